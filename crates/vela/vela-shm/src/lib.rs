//! `vela-shm`: named shared-memory regions and the process-shared
//! synchronisation primitives that live inside them.
//!
//! Every shared resource in the pipeline (the status area, the databufs) is
//! a file under a shm directory (default `/dev/shm`) mapped read-write into
//! each attaching process. Whoever attaches first and finds no file creates
//! it; teardown is always external, the stages never unlink regions they
//! are using.
//!
//! # Core Components
//!
//! - [`ShmRegion`]: create/open/attach a named mapping
//! - [`ShmMutex`]: futex mutex embedded in a region, RAII guard
//! - [`ShmSemaphore`]: futex counting semaphore embedded in a region
//!
//! The futex words are plain `AtomicU32`s inside the mapping, so the same
//! primitives work between threads of one process and between processes
//! attached to the same region.

mod futex;
mod mutex;
mod region;
mod sem;

pub use mutex::{ShmMutex, ShmMutexGuard};
pub use region::{ShmRegion, region_path};
pub use sem::ShmSemaphore;

/// Default directory for named regions. tmpfs, so mappings never touch disk.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";
