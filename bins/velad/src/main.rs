//! `velad`: the acquisition supervisor.
//!
//! Creates (or attaches and clears) the shared status area and both
//! databufs, then runs the capture and fold stages as named threads until
//! SIGINT. Stage-internal failures kill only that stage; the supervisor
//! exits nonzero only when startup itself fails.

mod sched;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vela_cards::ObsParams;
use vela_config::DaqConfig;
use vela_databuf::{Databuf, DatabufGeometry};
use vela_fold::{FoldConfig, NullConfig, run_fold, run_null};
use vela_net::{CaptureConfig, run_capture};
use vela_status::Status;

#[derive(Parser, Debug)]
#[command(name = "velad", about = "pulsar backend acquisition pipeline")]
struct Cli {
    /// Configuration file; missing file means all defaults.
    #[arg(long, default_value = "vela.toml")]
    config: PathBuf,

    /// UDP capture port.
    #[arg(long)]
    port: Option<u16>,

    /// Sender hostname, or "any".
    #[arg(long)]
    hostname: Option<String>,

    /// Expected packet size in bytes.
    #[arg(long)]
    size: Option<usize>,

    /// Replace the fold stage with the null consumer (capture throughput
    /// testing).
    #[arg(long)]
    null: bool,

    /// Also drain the fold output ring with a null consumer, for runs
    /// without an attached writer.
    #[arg(long)]
    drain_output: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("INFO")),
        )
        .init();

    let mut cfg = if cli.config.exists() {
        DaqConfig::load(cli.config.display().to_string()).context("loading config")?
    } else {
        DaqConfig::defaults()
    };
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if let Some(hostname) = cli.hostname {
        cfg.sender = hostname;
    }
    if let Some(size) = cli.size {
        cfg.packet_size = size;
    }

    let run = Arc::new(AtomicBool::new(true));
    {
        let run = Arc::clone(&run);
        ctrlc::set_handler(move || run.store(false, Ordering::Relaxed))
            .context("installing SIGINT handler")?;
    }

    let shm_dir = PathBuf::from(&cfg.shm_dir);
    let geometry = DatabufGeometry {
        n_block: cfg.n_block,
        block_size: cfg.block_size,
        header_size: cfg.header_size,
    };
    let obs = ObsParams {
        src_name: cfg.observation.src_name.clone(),
        obs_mode: "SEARCH".into(),
        stt_imjd: cfg.observation.stt_imjd,
        stt_smjd: cfg.observation.stt_smjd,
        tbin: cfg.observation.tbin,
        obsnchan: cfg.observation.nchan,
        npol: cfg.observation.npol,
        nbin: cfg.nbin as i64,
        acc_len: cfg.observation.acc_len,
    };

    // Shared resources come up before any stage; a failure here is the
    // supervisor's to report.
    let mut status = Status::attach(&shm_dir).context("attaching status area")?;
    {
        let mut guard = status.lock();
        obs.write(&mut guard).context("publishing observation")?;
        guard.put_str("NETSTAT", "init").context("status init")?;
        guard.put_str("FOLDSTAT", "init").context("status init")?;
    }
    let db_in = Databuf::attach_or_create(&shm_dir, cfg.input_databuf, geometry)
        .context("creating input databuf")?;
    db_in.clear();
    let db_out = Databuf::attach_or_create(&shm_dir, cfg.output_databuf, geometry)
        .context("creating output databuf")?;
    db_out.clear();
    drop((db_in, db_out));

    info!(
        port = cfg.port,
        sender = %cfg.sender,
        packet_size = cfg.packet_size,
        null = cli.null,
        "velad starting"
    );

    // Stages, in startup order. Joined in reverse below.
    let mut stages: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    let capture_cfg = CaptureConfig {
        shm_dir: shm_dir.clone(),
        databuf_id: cfg.input_databuf,
        geometry,
        port: cfg.port,
        sender: cfg.sender.clone(),
        packet_size: cfg.packet_size,
        obs: obs.clone(),
        packets_per_sec: cfg.packets_per_sec,
        parkes: None,
    };
    let capture_cpu = cfg.capture_cpu;
    let capture_run = Arc::clone(&run);
    stages.push((
        "capture",
        std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                if let Some(cpu) = capture_cpu {
                    sched::pin_cpu(cpu);
                }
                sched::raise_priority();
                if let Err(e) = run_capture(capture_cfg, capture_run) {
                    error!(stage = "capture", error = %e, "stage died");
                }
            })
            .context("spawning capture stage")?,
    ));

    if cli.null {
        let null_cfg = NullConfig {
            shm_dir: shm_dir.clone(),
            databuf_id: cfg.input_databuf,
        };
        let null_run = Arc::clone(&run);
        stages.push((
            "null",
            std::thread::Builder::new()
                .name("null".into())
                .spawn(move || {
                    if let Err(e) = run_null(null_cfg, null_run) {
                        error!(stage = "null", error = %e, "stage died");
                    }
                })
                .context("spawning null stage")?,
        ));
    } else {
        let fold_cfg = FoldConfig {
            shm_dir: shm_dir.clone(),
            input_id: cfg.input_databuf,
            output_id: cfg.output_databuf,
            input_geometry: geometry,
            output_geometry: geometry,
            nbin: cfg.nbin,
            tfold_sec: cfg.tfold_sec,
            nthread: cfg.nthread,
            polyco_path: PathBuf::from(&cfg.polyco_path),
        };
        let fold_run = Arc::clone(&run);
        stages.push((
            "fold",
            std::thread::Builder::new()
                .name("fold".into())
                .spawn(move || {
                    sched::raise_priority();
                    if let Err(e) = run_fold(fold_cfg, fold_run) {
                        error!(stage = "fold", error = %e, "stage died");
                    }
                })
                .context("spawning fold stage")?,
        ));

        if cli.drain_output {
            let drain_cfg = NullConfig {
                shm_dir: shm_dir.clone(),
                databuf_id: cfg.output_databuf,
            };
            let drain_run = Arc::clone(&run);
            stages.push((
                "drain",
                std::thread::Builder::new()
                    .name("drain".into())
                    .spawn(move || {
                        if let Err(e) = run_null(drain_cfg, drain_run) {
                            error!(stage = "drain", error = %e, "stage died");
                        }
                    })
                    .context("spawning output drain stage")?,
            ));
        }
    }

    // Supervisor loop: nothing to do but watch the flag.
    while run.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_secs(1));
    }

    info!("shutting down");
    for (name, handle) in stages.into_iter().rev() {
        match handle.join() {
            Ok(()) => info!(stage = name, "joined"),
            Err(_) => error!(stage = name, "stage panicked"),
        }
    }
    Ok(())
}
