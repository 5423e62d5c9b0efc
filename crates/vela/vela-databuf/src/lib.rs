//! `vela-databuf`: the multi-block shared-memory ring buffer that decouples
//! pipeline stages.
//!
//! A databuf is a named region holding N equal blocks, each a card header
//! plus a raw data area. Ownership of a block moves between a producer and
//! a consumer through a pair of counting semaphores per block; payload
//! access is lock-free once a block is owned.
//!
//! # Handoff protocol
//!
//! ```text
//! CLEAR ──P:wait_free──► BUSY_PRODUCER ──P:set_filled──► FILLED
//! FILLED ──C:wait_filled──► BUSY_CONSUMER ──C:set_free──► CLEAR
//! ```
//!
//! Both sides visit block indices in ascending round-robin order, which
//! with N ≥ 2 gives a correct single-producer/single-consumer ring without
//! any global lock. The fold stage runs several workers, but one
//! coordinator makes every wait/set call; workers only read payloads of
//! blocks the coordinator holds.
//!
//! After `create` or `clear`: every block CLEAR, free semaphore 1, filled
//! semaphore 0. At any later point the sum of filled semaphores equals the
//! number of FILLED blocks.

mod databuf;
mod layout;

pub use databuf::{Databuf, DatabufError, databuf_name};
pub use layout::{BlockState, DatabufGeometry};
