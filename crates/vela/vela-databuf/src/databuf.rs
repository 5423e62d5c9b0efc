use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;
use vela_cards::Cards;
use vela_shm::{ShmRegion, region_path};

use crate::layout::{
    BlockState, DATABUF_MAGIC, DATABUF_VERSION, DatabufGeometry, DatabufHeader, SemPair,
};

/// Region name for databuf `id`. Ids are small positive integers assigned
/// by convention: 1 carries capture output, 2 carries fold output.
pub fn databuf_name(id: u32) -> String {
    format!("vela_databuf_{id}")
}

#[derive(Debug, Error)]
pub enum DatabufError {
    #[error("failed to attach databuf {id}")]
    Attach {
        id: u32,
        #[source]
        source: io::Error,
    },
    #[error("databuf {id} region is not a databuf (bad magic {found:#x})")]
    BadMagic { id: u32, found: u64 },
    #[error("databuf {id} has layout version {found}, this build speaks {DATABUF_VERSION}")]
    BadVersion { id: u32, found: u64 },
    #[error("databuf {id} region is {region} bytes but its header claims {claimed}")]
    SizeMismatch { id: u32, region: usize, claimed: u64 },
    #[error("bad databuf geometry: {0}")]
    Geometry(&'static str),
}

/// Handle to one databuf. Every attaching stage holds its own; the handle
/// owns the mapping, and the cached pointers below all point into it.
pub struct Databuf {
    region: ShmRegion,
    id: u32,
    n_block: usize,
    block_size: usize,
    header_size: usize,
    states: *const AtomicU32,
    sems: *const SemPair,
    header_area: *mut u8,
    data_area: *mut u8,
}

// SAFETY: the raw pointers target the mapping owned by `region`, which
// moves with the struct; all cross-handle coordination goes through the
// atomics and futexes in the region.
unsafe impl Send for Databuf {}

impl Databuf {
    /// Create databuf `id` under `dir` and initialise every block to
    /// CLEAR / free=1 / filled=0. Fails if the region already exists.
    pub fn create(dir: &Path, id: u32, geo: DatabufGeometry) -> Result<Self, DatabufError> {
        geo.validate().map_err(DatabufError::Geometry)?;
        let layout = geo.layout();
        let path = region_path(dir, &databuf_name(id));
        let mut region = ShmRegion::create(&path, layout.total_size)
            .map_err(|source| DatabufError::Attach { id, source })?;
        // SAFETY: fresh region of exactly layout.total_size bytes, no other
        // attacher can race us before the header is written.
        unsafe {
            std::ptr::write(region.as_mut_ptr() as *mut DatabufHeader, DatabufHeader::new(geo));
        }
        let db = Self::from_region(region, id)?;
        db.clear();
        debug!(id, n_block = geo.n_block, block_size = geo.block_size, "created databuf");
        Ok(db)
    }

    /// Attach to an existing databuf `id`, validating magic, version and
    /// region size against the embedded header.
    pub fn attach(dir: &Path, id: u32) -> Result<Self, DatabufError> {
        let path = region_path(dir, &databuf_name(id));
        let region = ShmRegion::open(&path).map_err(|source| DatabufError::Attach { id, source })?;
        Self::from_region(region, id)
    }

    /// Attach, creating with `geo` if the region does not exist yet
    /// (whoever gets here first creates, per the shared-region ownership
    /// rule).
    pub fn attach_or_create(dir: &Path, id: u32, geo: DatabufGeometry) -> Result<Self, DatabufError> {
        match Self::attach(dir, id) {
            Ok(db) => Ok(db),
            Err(DatabufError::Attach { source, .. })
                if source.kind() == io::ErrorKind::NotFound =>
            {
                Self::create(dir, id, geo)
            }
            Err(e) => Err(e),
        }
    }

    fn from_region(mut region: ShmRegion, id: u32) -> Result<Self, DatabufError> {
        let base = region.as_mut_ptr();
        // SAFETY: every constructor hands us a mapping at least one header
        // long; the fields below are validated before any offset is used.
        let hdr = unsafe { &*(base as *const DatabufHeader) };
        if hdr.magic != DATABUF_MAGIC {
            return Err(DatabufError::BadMagic { id, found: hdr.magic });
        }
        if hdr.version != DATABUF_VERSION {
            return Err(DatabufError::BadVersion { id, found: hdr.version });
        }
        if hdr.total_size as usize != region.len() {
            return Err(DatabufError::SizeMismatch {
                id,
                region: region.len(),
                claimed: hdr.total_size,
            });
        }
        // SAFETY: offsets come from the validated header, all within the
        // mapping by the total_size check above.
        unsafe {
            Ok(Self {
                id,
                n_block: hdr.n_block as usize,
                block_size: hdr.block_size as usize,
                header_size: hdr.header_size as usize,
                states: base.add(hdr.state_offset as usize) as *const AtomicU32,
                sems: base.add(hdr.sem_offset as usize) as *const SemPair,
                header_area: base.add(hdr.header_area_offset as usize),
                data_area: base.add(hdr.data_offset as usize),
                region,
            })
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn n_block(&self) -> usize {
        self.n_block
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// Reset every block to CLEAR with free=1, filled=0 and an empty card
    /// header. Only valid while no stage is mid-handoff, i.e. at pipeline
    /// startup or external cleanup after a stage died holding blocks.
    pub fn clear(&self) {
        for i in 0..self.n_block {
            self.state_word(i).store(BlockState::Clear as u32, Ordering::Release);
            let sems = self.sem_pair(i);
            sems.free.init(1);
            sems.filled.init(0);
            // SAFETY: clear runs single-owner by contract.
            Cards::new(unsafe { self.header_slice(i) }).clear();
        }
    }

    /// Producer side: block until block `i` is free, then own it for
    /// writing.
    pub fn wait_free(&self, i: usize) {
        self.sem_pair(i).free.wait();
        self.state_word(i).store(BlockState::BusyProducer as u32, Ordering::Release);
    }

    /// Timed `wait_free`; false means the timeout elapsed and the caller
    /// does not own the block. Stage loops use this to poll the run flag.
    pub fn wait_free_timeout(&self, i: usize, timeout: Duration) -> bool {
        if !self.sem_pair(i).free.wait_timeout(timeout) {
            return false;
        }
        self.state_word(i).store(BlockState::BusyProducer as u32, Ordering::Release);
        true
    }

    /// Producer side: publish block `i`. Caller must own it as producer.
    pub fn set_filled(&self, i: usize) {
        self.state_word(i).store(BlockState::Filled as u32, Ordering::Release);
        self.sem_pair(i).filled.post();
    }

    /// Consumer side: block until block `i` is filled, then own it for
    /// reading.
    pub fn wait_filled(&self, i: usize) {
        self.sem_pair(i).filled.wait();
        self.state_word(i).store(BlockState::BusyConsumer as u32, Ordering::Release);
    }

    /// Timed `wait_filled`; false means no block ownership.
    pub fn wait_filled_timeout(&self, i: usize, timeout: Duration) -> bool {
        if !self.sem_pair(i).filled.wait_timeout(timeout) {
            return false;
        }
        self.state_word(i).store(BlockState::BusyConsumer as u32, Ordering::Release);
        true
    }

    /// Consumer side: recycle block `i`. Caller must own it as consumer.
    pub fn set_free(&self, i: usize) {
        self.state_word(i).store(BlockState::Clear as u32, Ordering::Release);
        self.sem_pair(i).free.post();
    }

    pub fn block_state(&self, i: usize) -> BlockState {
        BlockState::from_u32(self.state_word(i).load(Ordering::Acquire))
    }

    /// Sum of filled-semaphore values, for invariant checks.
    pub fn filled_total(&self) -> u32 {
        (0..self.n_block).map(|i| self.sem_pair(i).filled.value()).sum()
    }

    /// Card header of block `i`.
    ///
    /// # Safety
    /// Caller must own block `i` (between a `wait_*` and the matching
    /// `set_*`), and must not hold two overlapping slices of the same
    /// block.
    pub unsafe fn header_slice(&self, i: usize) -> &mut [u8] {
        assert!(i < self.n_block);
        unsafe {
            std::slice::from_raw_parts_mut(
                self.header_area.add(i * self.header_size),
                self.header_size,
            )
        }
    }

    /// Data region of block `i`.
    ///
    /// # Safety
    /// Same ownership contract as [`Self::header_slice`].
    pub unsafe fn data_slice(&self, i: usize) -> &mut [u8] {
        assert!(i < self.n_block);
        unsafe {
            std::slice::from_raw_parts_mut(self.data_area.add(i * self.block_size), self.block_size)
        }
    }

    /// Raw data pointer for handing a held block to a fold worker.
    pub fn data_ptr(&self, i: usize) -> *mut u8 {
        assert!(i < self.n_block);
        // Pointer arithmetic only; dereferencing is on the worker under
        // the coordinator's ownership of the block.
        unsafe { self.data_area.add(i * self.block_size) }
    }

    fn state_word(&self, i: usize) -> &AtomicU32 {
        assert!(i < self.n_block);
        // SAFETY: states array has n_block words inside the mapping.
        unsafe { &*self.states.add(i) }
    }

    fn sem_pair(&self, i: usize) -> &SemPair {
        assert!(i < self.n_block);
        // SAFETY: sems array has n_block pairs inside the mapping.
        unsafe { &*self.sems.add(i) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_dir(tag: &str) -> PathBuf {
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let dir = std::env::temp_dir().join(format!("vela_databuf_{tag}_{ts}"));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn small_geo() -> DatabufGeometry {
        DatabufGeometry {
            n_block: 4,
            block_size: 1024,
            header_size: 800,
        }
    }

    #[test]
    fn create_initialises_all_blocks_clear() {
        let dir = scratch_dir("init");
        let db = Databuf::create(&dir, 1, small_geo()).unwrap();
        for i in 0..db.n_block() {
            assert_eq!(db.block_state(i), BlockState::Clear);
        }
        assert_eq!(db.filled_total(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn attach_sees_creator_geometry() {
        let dir = scratch_dir("geo");
        let _db = Databuf::create(&dir, 1, small_geo()).unwrap();
        let db2 = Databuf::attach(&dir, 1).unwrap();
        assert_eq!(db2.n_block(), 4);
        assert_eq!(db2.block_size(), 1024);
        assert_eq!(db2.header_size(), 800);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn attach_rejects_non_databuf_region() {
        let dir = scratch_dir("magic");
        let path = region_path(&dir, &databuf_name(9));
        // A region that was never initialised as a databuf.
        let _junk = ShmRegion::create(&path, 8192).unwrap();
        let err = Databuf::attach(&dir, 9).err().expect("attach must fail");
        assert!(matches!(err, DatabufError::BadMagic { id: 9, .. }));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn state_machine_follows_handoff_protocol() {
        let dir = scratch_dir("states");
        let db = Databuf::create(&dir, 1, small_geo()).unwrap();
        db.wait_free(0);
        assert_eq!(db.block_state(0), BlockState::BusyProducer);
        db.set_filled(0);
        assert_eq!(db.block_state(0), BlockState::Filled);
        assert_eq!(db.filled_total(), 1);
        db.wait_filled(0);
        assert_eq!(db.block_state(0), BlockState::BusyConsumer);
        db.set_free(0);
        assert_eq!(db.block_state(0), BlockState::Clear);
        assert_eq!(db.filled_total(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn timed_waits_expire_without_ownership() {
        let dir = scratch_dir("timeout");
        let db = Databuf::create(&dir, 1, small_geo()).unwrap();
        // Nothing filled yet.
        assert!(!db.wait_filled_timeout(0, Duration::from_millis(20)));
        assert_eq!(db.block_state(0), BlockState::Clear);
        // Free is available exactly once without a consumer recycling.
        assert!(db.wait_free_timeout(0, Duration::from_millis(20)));
        assert!(!db.wait_free_timeout(0, Duration::from_millis(20)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn filled_semaphores_match_filled_states() {
        let dir = scratch_dir("invariant");
        let db = Databuf::create(&dir, 1, small_geo()).unwrap();
        for i in 0..3 {
            db.wait_free(i);
            db.set_filled(i);
        }
        let filled_states = (0..db.n_block())
            .filter(|&i| db.block_state(i) == BlockState::Filled)
            .count();
        assert_eq!(db.filled_total() as usize, filled_states);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn header_survives_attach() {
        let dir = scratch_dir("hdr");
        let db = Databuf::create(&dir, 1, small_geo()).unwrap();
        db.wait_free(2);
        let mut cards = Cards::new(unsafe { db.header_slice(2) });
        cards.put_int("PKTIDX", 12345).unwrap();
        db.set_filled(2);

        let db2 = Databuf::attach(&dir, 1).unwrap();
        db2.wait_filled(2);
        let cards = Cards::new(unsafe { db2.header_slice(2) });
        assert_eq!(cards.get_int("PKTIDX").unwrap(), 12345);
        db2.set_free(2);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
