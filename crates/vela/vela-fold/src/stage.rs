//! The fold stage coordinator and its worker pool.
//!
//! One coordinator thread owns both databufs. Each input block is handed
//! to an idle worker slot; when the pool saturates or an integration
//! boundary arrives, every in-flight worker is joined in launch order, its
//! input block freed, and its local histogram merged into the output
//! block. Input blocks are never freed at dispatch: the worker still reads
//! them, so freeing waits for the join.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use vela_cards::{Cards, ObsParams, SubintParams};
use vela_databuf::{Databuf, DatabufGeometry};
use vela_polyco::{Polyco, select_pc};
use vela_status::Status;

use crate::FoldError;
use crate::foldbuf::{FoldBuf, FoldShape, FoldView};
use crate::kernel::{FoldArgs, fold_8bit_power};

/// How long one ring wait may keep the coordinator from the run flag.
const BLOCK_WAIT_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct FoldConfig {
    pub shm_dir: PathBuf,
    pub input_id: u32,
    pub output_id: u32,
    pub input_geometry: DatabufGeometry,
    pub output_geometry: DatabufGeometry,
    /// Phase bins per profile.
    pub nbin: usize,
    /// Integration span in seconds of observed MJD.
    pub tfold_sec: f64,
    /// Worker pool width.
    pub nthread: usize,
    pub polyco_path: PathBuf,
}

/// A raw block pointer that may cross into a worker thread. Valid because
/// the coordinator keeps the block in BUSY_CONSUMER until the worker is
/// joined.
struct SendPtr(*const u8);
unsafe impl Send for SendPtr {}

struct InFlight {
    handle: JoinHandle<FoldBuf>,
    input_block: usize,
}

/// Run the fold stage until shutdown or a fatal error. A clean shutdown
/// joins all workers and reports `Ok`.
pub fn run_fold(cfg: FoldConfig, run: Arc<AtomicBool>) -> Result<(), FoldError> {
    let mut stage = FoldStage::new(&cfg, run)?;
    match stage.run() {
        Err(FoldError::Shutdown) | Ok(()) => {
            info!("fold stage down");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "fold stage fatal");
            let _ = stage.status.set_str("FOLDSTAT", "error");
            Err(e)
        }
    }
}

struct FoldStage {
    cfg: FoldConfig,
    db_in: Databuf,
    db_out: Databuf,
    status: Status,
    run: Arc<AtomicBool>,

    pcs: Vec<Polyco>,
    refresh_polycos: bool,

    in_flight: Vec<InFlight>,
    spare: Vec<FoldBuf>,
    shape: Option<FoldShape>,
    view: Option<FoldView>,

    curblock_in: usize,
    curblock_out: usize,
    first: bool,
    next_integration: bool,
    fmjd0: f64,
    fmjd_next: f64,
    nblock_int: i64,
    npacket: i64,
    ndrop: i64,
}

impl FoldStage {
    fn new(cfg: &FoldConfig, run: Arc<AtomicBool>) -> Result<Self, FoldError> {
        let db_in = Databuf::attach_or_create(&cfg.shm_dir, cfg.input_id, cfg.input_geometry)?;
        let db_out = Databuf::attach_or_create(&cfg.shm_dir, cfg.output_id, cfg.output_geometry)?;
        let mut status = Status::attach(&cfg.shm_dir)?;
        status.set_str("FOLDSTAT", "init")?;
        let mut cfg = cfg.clone();
        // The coordinator only joins the pool when it already holds the
        // next input block, so every slot plus one block must fit in the
        // ring or both sides stall.
        let max_workers = db_in.n_block().saturating_sub(1).max(1);
        if cfg.nthread > max_workers {
            warn!(
                requested = cfg.nthread,
                usable = max_workers,
                "worker pool clamped to ring size minus one"
            );
            cfg.nthread = max_workers;
        }
        Ok(Self {
            cfg,
            db_in,
            db_out,
            status,
            run,
            pcs: Vec::new(),
            refresh_polycos: true,
            in_flight: Vec::new(),
            spare: Vec::new(),
            shape: None,
            view: None,
            curblock_in: 0,
            curblock_out: 0,
            first: true,
            next_integration: false,
            fmjd0: 0.0,
            fmjd_next: 0.0,
            nblock_int: 0,
            npacket: 0,
            ndrop: 0,
        })
    }

    fn run(&mut self) -> Result<(), FoldError> {
        let result = self.run_loop();
        // Whatever ended the loop, drain the pool first so every worker's
        // input block is returned before the stage reports out.
        self.join_workers();
        result
    }

    fn run_loop(&mut self) -> Result<(), FoldError> {
        loop {
            self.status.set_str("FOLDSTAT", "waiting")?;
            self.wait_filled_in()?;
            self.status.set_str("FOLDSTAT", "folding")?;

            // SAFETY: we own curblock_in as consumer from here until the
            // worker handling it is joined.
            let (obs, subint) = {
                let cards = Cards::new(unsafe { self.db_in.header_slice(self.curblock_in) });
                (ObsParams::read(&cards)?, SubintParams::read(&cards)?)
            };

            // A zero packet index after the first block marks a new
            // observation start.
            if subint.pktidx == 0 && !self.first {
                self.next_integration = true;
            }

            let samples_per_byte_row = (obs.obsnchan * obs.npol).max(1);
            let nsamp = (subint.npkt * subint.pktsize / samples_per_byte_row) as usize;
            let start_sample = subint.pktidx * subint.pktsize / samples_per_byte_row;
            let imjd = obs.stt_imjd;
            let fmjd_start = (obs.stt_smjd + obs.tbin * start_sample as f64) / 86400.0;
            let fmjd_mid = fmjd_start + 0.5 * nsamp as f64 * obs.tbin / 86400.0;

            if self.first {
                self.begin_observation(&obs, &subint, fmjd_mid)?;
            }

            if fmjd_mid > self.fmjd_next {
                self.next_integration = true;
            }

            if self.in_flight.len() == self.cfg.nthread || self.next_integration {
                self.join_workers();
            }

            if self.next_integration {
                self.finalize_integration(&subint, fmjd_mid)?;
            }

            if self.refresh_polycos {
                self.pcs = load_polycos(&self.cfg.polyco_path)?;
                info!(n = self.pcs.len(), path = %self.cfg.polyco_path.display(), "loaded polycos");
                self.refresh_polycos = false;
            }
            let ipc = select_pc(&self.pcs, Some(&obs.src_name), imjd, fmjd_mid).ok_or_else(|| {
                FoldError::NoPolyco {
                    src: obs.src_name.clone(),
                    imjd,
                    fmjd: fmjd_mid,
                }
            })?;

            self.launch_worker(ipc, &obs, imjd, fmjd_start, nsamp);

            self.nblock_int += 1;
            self.npacket += subint.npkt;
            self.ndrop += subint.ndrop;
            {
                // SAFETY: curblock_out is held as producer between
                // integrations.
                let mut out = Cards::new(unsafe { self.db_out.header_slice(self.curblock_out) });
                out.put_int("NBLOCK", self.nblock_int)?;
                out.put_int("NPKT", self.npacket)?;
                out.put_int("NDROP", self.ndrop)?;
            }

            // The input block stays owned; the worker reads it until join.
            self.curblock_in = (self.curblock_in + 1) % self.db_in.n_block();
        }
    }

    /// First-block setup: size the fold from the observation parameters
    /// and open the first output block.
    fn begin_observation(
        &mut self,
        obs: &ObsParams,
        subint: &SubintParams,
        fmjd_mid: f64,
    ) -> Result<(), FoldError> {
        let shape = FoldShape {
            nbin: self.cfg.nbin,
            nchan: obs.obsnchan as usize,
            npol: obs.npol as usize,
        };
        if shape.block_bytes() > self.db_out.block_size() {
            return Err(FoldError::OutputTooSmall {
                block: self.db_out.block_size(),
                needed: shape.block_bytes(),
            });
        }
        self.shape = Some(shape);
        self.spare = (0..self.cfg.nthread).map(|_| FoldBuf::new(shape)).collect();

        self.fmjd0 = fmjd_mid;
        self.fmjd_next = self.fmjd0 + self.cfg.tfold_sec / 86400.0;

        self.wait_free_out()?;
        self.open_output_header(subint.pktidx)?;
        self.first = false;
        debug!(?shape, "observation started");
        Ok(())
    }

    /// Publish the finished integration and open the next output block.
    fn finalize_integration(&mut self, subint: &SubintParams, fmjd_mid: f64) -> Result<(), FoldError> {
        debug!(
            nblock = self.nblock_int,
            npacket = self.npacket,
            "finalizing integration"
        );
        self.db_out.set_filled(self.curblock_out);

        self.curblock_out = (self.curblock_out + 1) % self.db_out.n_block();
        self.wait_free_out()?;
        self.open_output_header(subint.pktidx)?;

        self.fmjd0 = fmjd_mid;
        self.fmjd_next = self.fmjd0 + self.cfg.tfold_sec / 86400.0;
        self.nblock_int = 0;
        self.npacket = 0;
        self.ndrop = 0;
        self.next_integration = false;
        Ok(())
    }

    /// Seed the held output block's header from the current input header
    /// and rebind the merge target to its data region.
    fn open_output_header(&mut self, pktidx: i64) -> Result<(), FoldError> {
        let shape = self.shape.expect("shape set before any output block");
        {
            // SAFETY: we hold curblock_out as producer and curblock_in as
            // consumer; different databufs, no overlap.
            let src = unsafe { self.db_in.header_slice(self.curblock_in) };
            let mut out = Cards::new(unsafe { self.db_out.header_slice(self.curblock_out) });
            out.copy_from(src);
            out.put_str("OBS_MODE", "PSR")?;
            out.put_int("NBIN", shape.nbin as i64)?;
            out.put_int("PKTIDX", pktidx)?;
        }
        // SAFETY: block data stays valid and producer-owned until the
        // integration is finalized, which drops this view first.
        let mut view =
            unsafe { FoldView::bind(self.db_out.data_ptr(self.curblock_out), shape) };
        view.clear();
        self.view = Some(view);
        Ok(())
    }

    /// Hand the current input block to a worker slot.
    fn launch_worker(&mut self, ipc: usize, obs: &ObsParams, imjd: i64, fmjd: f64, nsamp: usize) {
        let shape = self.shape.expect("shape set before launching workers");
        let buf = self
            .spare
            .pop()
            .unwrap_or_else(|| FoldBuf::new(shape));
        let pc = self.pcs[ipc].clone();
        let tsamp = obs.tbin;
        let stride = shape.nchan * shape.npol;
        let nbytes = (nsamp * stride).min(self.db_in.block_size());
        let ptr = SendPtr(self.db_in.data_ptr(self.curblock_in));

        let handle = std::thread::spawn(move || {
            let ptr = ptr;
            // SAFETY: the coordinator holds this block as consumer until
            // this thread is joined.
            let data = unsafe { std::slice::from_raw_parts(ptr.0, nbytes) };
            let mut fb = buf;
            fold_8bit_power(
                &FoldArgs {
                    data,
                    pc: &pc,
                    imjd,
                    fmjd,
                    nsamp,
                    tsamp,
                    raw_signed: true,
                },
                &mut fb,
            );
            fb
        });
        self.in_flight.push(InFlight {
            handle,
            input_block: self.curblock_in,
        });
    }

    /// Join every in-flight worker in launch order, free its input block,
    /// and merge its histogram into the output view.
    fn join_workers(&mut self) {
        for w in self.in_flight.drain(..) {
            match w.handle.join() {
                Ok(mut fb) => {
                    self.db_in.set_free(w.input_block);
                    if let Some(view) = self.view.as_mut() {
                        view.accumulate(&fb);
                    }
                    fb.clear();
                    self.spare.push(fb);
                }
                Err(_) => {
                    // The worker's partial histogram is gone; its block
                    // still goes back, and the slot gets a fresh buffer.
                    warn!(block = w.input_block, "fold worker panicked, block not merged");
                    self.db_in.set_free(w.input_block);
                    if let Some(shape) = self.shape {
                        self.spare.push(FoldBuf::new(shape));
                    }
                }
            }
        }
    }

    fn wait_filled_in(&self) -> Result<(), FoldError> {
        loop {
            if self.db_in.wait_filled_timeout(self.curblock_in, BLOCK_WAIT_SLICE) {
                return Ok(());
            }
            if !self.run.load(Ordering::Relaxed) {
                return Err(FoldError::Shutdown);
            }
        }
    }

    fn wait_free_out(&self) -> Result<(), FoldError> {
        loop {
            if self.db_out.wait_free_timeout(self.curblock_out, BLOCK_WAIT_SLICE) {
                return Ok(());
            }
            if !self.run.load(Ordering::Relaxed) {
                return Err(FoldError::Shutdown);
            }
        }
    }
}

fn load_polycos(path: &PathBuf) -> Result<Vec<Polyco>, FoldError> {
    let wrap = |source| FoldError::PolycoLoad {
        path: path.display().to_string(),
        source,
    };
    let file = File::open(path).map_err(|e| wrap(vela_polyco::PolycoError::Io(e)))?;
    Polyco::read_all(BufReader::new(file)).map_err(wrap)
}
