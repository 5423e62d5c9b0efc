//! `vela-fold`: phase folding of captured voltage blocks.
//!
//! A coordinator thread drains the capture databuf, hands each block to an
//! idle worker for accumulation into a worker-local histogram, and merges
//! worker results into the current output block. On integration boundaries
//! (a configurable span of observed MJD, 60 s by default) the merged
//! histogram is published downstream and a fresh output block begins.
//!
//! Workers never touch ring state; all wait/set calls stay on the
//! coordinator, and a worker's input block is freed only after its join.
//! That single-ownership rule is what makes the pool safe without any
//! locking between workers.

mod foldbuf;
mod kernel;
mod null;
mod stage;

use thiserror::Error;

pub use foldbuf::{FoldBuf, FoldShape, FoldView};
pub use kernel::{FoldArgs, fold_8bit_power};
pub use null::{NullConfig, run_null};
pub use stage::{FoldConfig, run_fold};

#[derive(Debug, Error)]
pub enum FoldError {
    #[error(transparent)]
    Databuf(#[from] vela_databuf::DatabufError),
    #[error(transparent)]
    Status(#[from] vela_status::StatusError),
    #[error(transparent)]
    Cards(#[from] vela_cards::CardsError),
    #[error("failed to load polycos from '{path}'")]
    PolycoLoad {
        path: String,
        #[source]
        source: vela_polyco::PolycoError,
    },
    #[error("no matching polycos (src={src}, imjd={imjd}, fmjd={fmjd})")]
    NoPolyco { src: String, imjd: i64, fmjd: f64 },
    #[error("output block holds {block} bytes, fold of this shape needs {needed}")]
    OutputTooSmall { block: usize, needed: usize },
    #[error("shutdown requested")]
    Shutdown,
}
