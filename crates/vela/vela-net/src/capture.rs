//! The capture stage: UDP stream in, gap-filled sequence-aligned blocks
//! out.
//!
//! [`CaptureState`] is the sequencing machine on its own, fed one packet at
//! a time, so the whole reassembly path is testable without a socket.
//! [`run_capture`] wraps it in the socket loop and status publishing.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, error, info};
use vela_cards::{Cards, ObsParams, SubintParams};
use vela_databuf::{Databuf, DatabufGeometry};
use vela_status::Status;

use crate::packet::{Packet, PacketFormat, parkes_rescale};
use crate::socket::{UdpCapture, WaitStatus};
use crate::vdif;
use crate::NetError;

/// Weight of the newest block in the drop-fraction moving average.
const DROP_LPF: f64 = 0.25;

/// Backward jumps larger than this mean the sampler restarted; smaller
/// ones are late duplicates and get dropped.
const RESTART_THRESHOLD: i64 = -1024;

/// How long a single free-block wait may hold the stage away from the run
/// flag.
const BLOCK_WAIT_SLICE: Duration = Duration::from_millis(250);

/// Parameters for the Parkes sampler's counter rescale and polarization
/// regather, applied to each datagram before sequencing.
#[derive(Debug, Clone, Copy)]
pub struct ParkesParams {
    pub acc_len: usize,
    pub npol: usize,
    pub nchan: usize,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub shm_dir: PathBuf,
    pub databuf_id: u32,
    pub geometry: DatabufGeometry,
    pub port: u16,
    /// Sender hostname, or `"any"` to accept every peer.
    pub sender: String,
    /// Expected datagram size; this fixes the packet format for the run.
    pub packet_size: usize,
    pub obs: ObsParams,
    /// VDIF frames per UTC second, used only for that format.
    pub packets_per_sec: u32,
    pub parkes: Option<ParkesParams>,
}

/// Per-run packet accounting, exposed for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureCounters {
    pub npacket_total: u64,
    pub ndropped_total: u64,
    pub nbogus_total: u64,
}

/// The capture sequencing machine. One per capture thread.
pub struct CaptureState {
    db: Databuf,
    status: Status,
    obs: ObsParams,
    format: PacketFormat,
    payload_size: usize,
    packets_per_block: u64,
    packets_per_sec: u32,
    parkes: Option<ParkesParams>,
    run: Arc<AtomicBool>,

    curblock: Option<usize>,
    curblock_seq: u64,
    nextblock_seq: u64,
    /// Next unwritten packet slot within the current block.
    last_block_idx: u64,
    last_seq: u64,
    vdif_ref: Option<vdif::VdifRef>,

    npacket_total: u64,
    npacket_block: u64,
    ndropped_total: u64,
    ndropped_block: u64,
    nbogus_total: u64,
    nbogus_block: u64,
    drop_frac_avg: f64,
}

impl CaptureState {
    pub fn new(cfg: &CaptureConfig, run: Arc<AtomicBool>) -> Result<Self, NetError> {
        let format = PacketFormat::classify(cfg.packet_size)
            .ok_or(NetError::UnsupportedSize(cfg.packet_size))?;
        let db = Databuf::attach_or_create(&cfg.shm_dir, cfg.databuf_id, cfg.geometry)?;
        let status = Status::attach(&cfg.shm_dir)?;
        let payload_size = format.payload_size();
        let packets_per_block = (db.block_size() / payload_size) as u64;
        Ok(Self {
            db,
            status,
            obs: cfg.obs.clone(),
            format,
            payload_size,
            packets_per_block,
            packets_per_sec: cfg.packets_per_sec,
            parkes: cfg.parkes,
            run,
            curblock: None,
            curblock_seq: 0,
            nextblock_seq: 0,
            last_block_idx: 0,
            // Start far enough in that a sampler already counting up from
            // zero is not mistaken for a restart on its first packet.
            last_seq: 2048,
            vdif_ref: None,
            npacket_total: 0,
            npacket_block: 0,
            ndropped_total: 0,
            ndropped_block: 0,
            nbogus_total: 0,
            nbogus_block: 0,
            drop_frac_avg: 0.0,
        })
    }

    pub fn counters(&self) -> CaptureCounters {
        CaptureCounters {
            npacket_total: self.npacket_total,
            ndropped_total: self.ndropped_total,
            nbogus_total: self.nbogus_total,
        }
    }

    pub fn drop_frac_avg(&self) -> f64 {
        self.drop_frac_avg
    }

    pub fn current_block(&self) -> Option<usize> {
        self.curblock
    }

    pub fn curblock_seq(&self) -> u64 {
        self.curblock_seq
    }

    pub fn format(&self) -> PacketFormat {
        self.format
    }

    /// Feed one received datagram through sequencing and placement.
    pub fn handle_packet(&mut self, pkt: &mut Packet) -> Result<(), NetError> {
        if pkt.len() != self.format.wire_size() {
            self.nbogus_total += 1;
            self.nbogus_block += 1;
            return Ok(());
        }

        if let Some(p) = self.parkes {
            parkes_rescale(pkt, p.acc_len, p.npol, p.nchan);
        }

        let seq = self.sequence_number(pkt);

        let diff = seq.wrapping_sub(self.last_seq) as i64;
        let force_new_block = if diff < 0 {
            if diff < RESTART_THRESHOLD {
                debug!(seq, diff, "sequence restart, forcing block rollover");
                true
            } else {
                // Late out-of-order packet; its slot is already behind us.
                return Ok(());
            }
        } else {
            false
        };

        if seq >= self.nextblock_seq || force_new_block || self.curblock.is_none() {
            if self.curblock.is_some() {
                self.seal_current_block()?;
            }
            self.update_drop_stats()?;
            self.npacket_block = 0;
            self.ndropped_block = 0;
            self.nbogus_block = 0;
            self.advance_block()?;
            self.curblock_seq = seq - (seq % self.packets_per_block);
            self.nextblock_seq = self.curblock_seq + self.packets_per_block;
            self.last_block_idx = 0;
        }

        // Zero-fill the gap, then land the packet in its slot.
        let curblock = self.curblock.expect("advance_block sets curblock");
        let block_packet_idx = seq - self.curblock_seq;
        // SAFETY: we hold curblock as producer from wait_free until the
        // matching set_filled in seal_current_block.
        let data = unsafe { self.db.data_slice(curblock) };
        for i in self.last_block_idx..block_packet_idx {
            let slot = &mut data[(i as usize) * self.payload_size..][..self.payload_size];
            slot.fill(0);
            self.ndropped_block += 1;
            self.ndropped_total += 1;
            self.npacket_block += 1;
            self.npacket_total += 1;
        }
        let slot =
            &mut data[(block_packet_idx as usize) * self.payload_size..][..self.payload_size];
        pkt.copy_payload(slot, self.format, self.obs.obsnchan as usize);
        self.npacket_block += 1;
        self.npacket_total += 1;
        self.last_block_idx = block_packet_idx + 1;
        self.last_seq = seq;
        Ok(())
    }

    fn sequence_number(&mut self, pkt: &Packet) -> u64 {
        if self.format == PacketFormat::Vdif {
            let r = self
                .vdif_ref
                .get_or_insert_with(|| vdif::reference(pkt));
            vdif::seq_num(pkt, r, self.packets_per_sec) as u64
        } else {
            pkt.seq_num(self.format)
        }
    }

    /// Write final metadata into the current block's header and publish
    /// the block downstream.
    fn seal_current_block(&mut self) -> Result<(), NetError> {
        let curblock = self.curblock.expect("sealing without a block");
        {
            // SAFETY: block is held as producer.
            let mut cards = Cards::new(unsafe { self.db.header_slice(curblock) });
            if !cards.is_initialized() {
                cards.clear();
            }
            SubintParams {
                pktidx: self.curblock_seq as i64,
                pktsize: self.payload_size as i64,
                npkt: self.npacket_block as i64,
                ndrop: self.ndropped_block as i64,
            }
            .write(&mut cards)?;
            self.obs.write(&mut cards)?;
        }
        self.db.set_filled(curblock);
        debug!(
            block = curblock,
            pktidx = self.curblock_seq,
            npkt = self.npacket_block,
            ndrop = self.ndropped_block,
            "sealed block"
        );
        Ok(())
    }

    fn update_drop_stats(&mut self) -> Result<(), NetError> {
        if self.npacket_block > 0 {
            self.drop_frac_avg = (1.0 - DROP_LPF) * self.drop_frac_avg
                + DROP_LPF * self.ndropped_block as f64 / self.npacket_block as f64;
        }
        let mut st = self.status.lock();
        st.put_dbl("DROPAVG", self.drop_frac_avg)?;
        st.put_dbl(
            "DROPTOT",
            if self.npacket_total > 0 {
                self.ndropped_total as f64 / self.npacket_total as f64
            } else {
                0.0
            },
        )?;
        st.put_dbl(
            "DROPBLK",
            if self.npacket_block > 0 {
                self.ndropped_block as f64 / self.npacket_block as f64
            } else {
                0.0
            },
        )?;
        Ok(())
    }

    /// Own the next block as producer, polling the run flag while the
    /// consumer side catches up.
    fn advance_block(&mut self) -> Result<(), NetError> {
        let next = match self.curblock {
            Some(c) => (c + 1) % self.db.n_block(),
            None => 0,
        };
        loop {
            if self.db.wait_free_timeout(next, BLOCK_WAIT_SLICE) {
                self.curblock = Some(next);
                return Ok(());
            }
            if !self.run.load(Ordering::Relaxed) {
                return Err(NetError::Shutdown);
            }
        }
    }
}

/// The capture stage entry point: socket loop plus status transitions.
/// Runs until the shared run flag clears or a fatal transport error.
pub fn run_capture(cfg: CaptureConfig, run: Arc<AtomicBool>) -> Result<(), NetError> {
    let mut state = CaptureState::new(&cfg, Arc::clone(&run))?;
    let socket = UdpCapture::open(cfg.port, &cfg.sender)?;
    info!(
        port = cfg.port,
        sender = %cfg.sender,
        format = ?state.format(),
        "capture stage up"
    );

    let mut pkt = Packet::new();
    let mut waiting = false;
    while run.load(Ordering::Relaxed) {
        match socket.wait(Duration::from_secs(1))? {
            WaitStatus::Timeout => {
                if !waiting {
                    state.status.set_str("NETSTAT", "waiting")?;
                    waiting = true;
                }
                continue;
            }
            WaitStatus::Ready => {}
        }
        if !socket.recv(&mut pkt)? {
            continue;
        }
        if waiting {
            state.status.set_str("NETSTAT", "receiving")?;
            waiting = false;
        }
        match state.handle_packet(&mut pkt) {
            Ok(()) => {}
            Err(NetError::Shutdown) => break,
            Err(e) => {
                error!(error = %e, "capture stage fatal");
                let _ = state.status.set_str("NETSTAT", "error");
                return Err(e);
            }
        }
    }
    info!(counters = ?state.counters(), "capture stage down");
    Ok(())
}
