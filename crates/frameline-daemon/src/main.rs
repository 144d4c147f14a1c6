//! frameline-daemon - multi-client frame telemetry service.
//!
//! Binds the named control channel, opens the tracing source, and
//! serves client sessions until SIGTERM/SIGINT. All client-visible
//! behavior lives in the library crate; this binary is flag parsing,
//! logging bootstrap, and signal handling.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use frameline_daemon::source::{SimulatedConfig, SimulatedSource};
use frameline_daemon::{Daemon, DaemonConfig};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// frameline daemon - frame telemetry service
#[derive(Parser, Debug)]
#[command(name = "frameline-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path of the named control channel socket
    #[arg(long, default_value = "/tmp/frameline/control.sock")]
    control_pipe: PathBuf,

    /// Prefix for per-pid shared frame channel names
    #[arg(long, default_value = "frameline-nsm")]
    nsm_prefix: String,

    /// Name of the introspection shared-memory region
    #[arg(long, default_value = "frameline-intro")]
    intro_nsm: String,

    /// Enable the test-control command surface (status, err-check,
    /// get-frames)
    #[arg(long)]
    enable_test_control: bool,

    /// Directory for log files (logs to stdout when unset)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Suffix the log file name with the daemon pid
    #[arg(long)]
    log_name_pid: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Interval between simulated presents, in milliseconds
    #[arg(long, default_value = "4")]
    sim_frame_interval_ms: u64,
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_dir) = &args.log_dir {
        std::fs::create_dir_all(log_dir).context("failed to create log directory")?;
        let name = if args.log_name_pid {
            format!("frameline-daemon-{}.log", std::process::id())
        } else {
            "frameline-daemon.log".to_owned()
        };
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(name))
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let source = SimulatedSource::open(SimulatedConfig {
        frame_interval: std::time::Duration::from_millis(args.sim_frame_interval_ms.max(1)),
        ..SimulatedConfig::default()
    })
    .context("failed to open tracing source")?;

    let daemon = Daemon::spawn(
        DaemonConfig {
            control_pipe: args.control_pipe,
            nsm_prefix: args.nsm_prefix,
            intro_nsm: args.intro_nsm,
            enable_test_control: args.enable_test_control,
        },
        Box::new(source),
    )
    .context("failed to start service")?;

    info!(
        pid = std::process::id(),
        socket = %daemon.socket_path().display(),
        "frameline daemon started"
    );

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    daemon.shutdown().await;
    Ok(())
}
