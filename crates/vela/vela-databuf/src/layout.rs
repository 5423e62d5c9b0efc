//! Binary layout of a databuf region.
//!
//! The layout is computed once at creation, embedded in the region header,
//! and re-read verbatim by every attacher, so processes built from
//! different checkouts agree as long as magic and version match.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ DatabufHeader (128 B: magic, version, geometry, offsets)
//! ├──────────────────────────────────────────────┤
//! │ state[n_block]      one AtomicU32 per block  │
//! ├──────────────────────────────────────────────┤
//! │ sems[n_block]       free/filled pair per block
//! ├── page aligned ──────────────────────────────┤
//! │ header[n_block]     card text, header_size each
//! ├── page aligned ──────────────────────────────┤
//! │ data[n_block]       block_size bytes each    │
//! └──────────────────────────────────────────────┘
//! ```

use std::mem::size_of;
use std::sync::atomic::AtomicU32;

use vela_shm::ShmSemaphore;

/// ASCII "VELADBUF".
pub const DATABUF_MAGIC: u64 = 0x5645_4C41_4442_5546;

/// Bumped on incompatible layout changes; attach rejects mismatches.
pub const DATABUF_VERSION: u64 = 1;

const PAGE: usize = 4096;

/// Per-block ownership state. The state words are diagnostics and test
/// hooks; the semaphores alone carry the handoff.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Clear = 0,
    BusyProducer = 1,
    Filled = 2,
    BusyConsumer = 3,
}

impl BlockState {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::BusyProducer,
            2 => Self::Filled,
            3 => Self::BusyConsumer,
            _ => Self::Clear,
        }
    }
}

/// The free/filled semaphore pair owning one block's handoff.
#[repr(C)]
pub struct SemPair {
    pub free: ShmSemaphore,
    pub filled: ShmSemaphore,
}

/// Region header at offset 0.
#[repr(C)]
pub struct DatabufHeader {
    pub magic: u64,
    pub version: u64,
    pub n_block: u64,
    pub header_size: u64,
    pub block_size: u64,
    pub state_offset: u64,
    pub sem_offset: u64,
    pub header_area_offset: u64,
    pub data_offset: u64,
    pub total_size: u64,
    _pad: [u8; 48],
}

impl DatabufHeader {
    pub fn new(geo: DatabufGeometry) -> Self {
        let l = geo.layout();
        Self {
            magic: DATABUF_MAGIC,
            version: DATABUF_VERSION,
            n_block: geo.n_block as u64,
            header_size: geo.header_size as u64,
            block_size: geo.block_size as u64,
            state_offset: l.state_offset as u64,
            sem_offset: l.sem_offset as u64,
            header_area_offset: l.header_area_offset as u64,
            data_offset: l.data_offset as u64,
            total_size: l.total_size as u64,
            _pad: [0; 48],
        }
    }
}

/// Block count and sizes, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabufGeometry {
    pub n_block: usize,
    pub block_size: usize,
    /// Card text bytes per block header.
    pub header_size: usize,
}

impl DatabufGeometry {
    /// The deployed default: 24 blocks of 32 MiB with 16 KiB headers.
    pub fn standard() -> Self {
        Self {
            n_block: 24,
            block_size: 32 * 1024 * 1024,
            header_size: 16 * 1024,
        }
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.n_block < 2 {
            return Err("databuf needs at least 2 blocks");
        }
        if self.block_size == 0 {
            return Err("block_size must be nonzero");
        }
        if self.header_size < 2 * 80 {
            return Err("header_size must hold at least two cards");
        }
        Ok(())
    }

    pub fn layout(&self) -> DatabufLayout {
        let state_offset = size_of::<DatabufHeader>();
        let sem_offset = state_offset + self.n_block * size_of::<AtomicU32>();
        let header_area_offset = align_up(sem_offset + self.n_block * size_of::<SemPair>(), PAGE);
        let data_offset = align_up(header_area_offset + self.n_block * self.header_size, PAGE);
        let total_size = data_offset + self.n_block * self.block_size;
        DatabufLayout {
            state_offset,
            sem_offset,
            header_area_offset,
            data_offset,
            total_size,
        }
    }
}

pub struct DatabufLayout {
    pub state_offset: usize,
    pub sem_offset: usize,
    pub header_area_offset: usize,
    pub data_offset: usize,
    pub total_size: usize,
}

fn align_up(v: usize, to: usize) -> usize {
    v.div_ceil(to) * to
}
