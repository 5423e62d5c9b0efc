//! The null consumer: drains a databuf without touching payloads.
//!
//! Used for capture throughput tests and as the downstream of the fold
//! stage when no writer is attached. Its existence is also a protocol
//! check: block handoff must never depend on the consumer reading data.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::info;
use vela_databuf::Databuf;
use vela_status::Status;

use crate::FoldError;

const BLOCK_WAIT_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct NullConfig {
    pub shm_dir: PathBuf,
    pub databuf_id: u32,
}

pub fn run_null(cfg: NullConfig, run: Arc<AtomicBool>) -> Result<(), FoldError> {
    let db = Databuf::attach(&cfg.shm_dir, cfg.databuf_id)?;
    let mut status = Status::attach(&cfg.shm_dir)?;
    info!(databuf = cfg.databuf_id, "null stage up");

    let mut curblock = 0;
    let mut drained: u64 = 0;
    'outer: while run.load(Ordering::Relaxed) {
        status.set_str("NULLSTAT", "waiting")?;
        loop {
            if db.wait_filled_timeout(curblock, BLOCK_WAIT_SLICE) {
                break;
            }
            if !run.load(Ordering::Relaxed) {
                break 'outer;
            }
        }
        status.set_str("NULLSTAT", "blanking")?;
        db.set_free(curblock);
        drained += 1;
        curblock = (curblock + 1) % db.n_block();
    }
    info!(drained, "null stage down");
    Ok(())
}
