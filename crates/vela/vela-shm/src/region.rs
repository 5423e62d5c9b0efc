use memmap2::MmapMut;
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

/// Builds the backing-file path for a named region.
pub fn region_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

/// A named process-shared memory region backed by a file (normally on
/// tmpfs). The mapping is read-write and shared, so stores made by one
/// attached process are visible to all others.
pub struct ShmRegion {
    /// File handle kept alive to maintain the memory map validity
    _file: File,
    mmap: MmapMut,
}

impl ShmRegion {
    /// Create a new region of `len` bytes. Fails if it already exists.
    /// The kernel zero-fills fresh pages, so a new region reads as all
    /// zeros without an explicit memset.
    pub fn create<P: AsRef<Path>>(path: P, len: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { _file: file, mmap })
    }

    /// Attach to an existing region, mapping its full current length.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { _file: file, mmap })
    }

    /// Attach to a region, creating it at `len` bytes if absent. Two
    /// processes racing here resolve through `create_new`: the loser's
    /// create fails with `AlreadyExists` and it attaches instead.
    pub fn open_or_create<P: AsRef<Path>>(path: P, len: usize) -> io::Result<Self> {
        match Self::open(&path) {
            Ok(r) => Ok(r),
            Err(e) if e.kind() == io::ErrorKind::NotFound => match Self::create(&path, len) {
                Ok(r) => Ok(r),
                Err(e2) if e2.kind() == io::ErrorKind::AlreadyExists => Self::open(&path),
                Err(e2) => Err(e2),
            },
            Err(e) => Err(e),
        }
    }

    /// Remove the backing file. Existing mappings stay valid until every
    /// attached process drops its handle. Out-of-band cleanup only; the
    /// pipeline stages never call this on a live region.
    pub fn unlink<P: AsRef<Path>>(path: P) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch(name: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("vela_shm_{name}_{ts}"))
    }

    #[test]
    fn create_is_zeroed_and_shared() {
        let path = scratch("zero");
        {
            let mut a = ShmRegion::create(&path, 4096).unwrap();
            let b = ShmRegion::open(&path).unwrap();
            unsafe {
                assert_eq!(*b.as_ptr(), 0);
                *a.as_mut_ptr() = 0x5A;
                assert_eq!(*b.as_ptr(), 0x5A);
            }
        }
        ShmRegion::unlink(&path).unwrap();
    }

    #[test]
    fn open_or_create_attaches_to_existing() {
        let path = scratch("race");
        let mut a = ShmRegion::open_or_create(&path, 4096).unwrap();
        unsafe { *a.as_mut_ptr().add(7) = 0xEE };
        let b = ShmRegion::open_or_create(&path, 4096).unwrap();
        assert_eq!(b.len(), 4096);
        unsafe { assert_eq!(*b.as_ptr().add(7), 0xEE) };
        ShmRegion::unlink(&path).unwrap();
    }

    #[test]
    fn open_missing_region_fails() {
        let path = scratch("missing");
        assert!(ShmRegion::open(&path).is_err());
    }
}
