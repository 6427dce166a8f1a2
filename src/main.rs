//! ==============================================================================
//! main.rs - tlog command line entry point
//! ==============================================================================
//!
//! purpose:
//!     `tlog` logs DS18x20 one-wire thermometers to an append-only sample
//!     log. the same binary is both the operator's control tool and the
//!     background sampling loop it launches.
//!
//! commands:
//!     - run      sample in the foreground (what `start` spawns)
//!     - start    launch the sampling loop in the background, restarting it
//!                if it is already up
//!     - stop     SIGTERM the loop, SIGKILL after the grace period
//!     - check    is a loop alive? (exit code 0 yes, 3 no)
//!     - tail     print recent entries, then follow new ones
//!     - devices  list discovered sensors with one reading each
//!
//! relationships:
//!     - uses: config.rs, sampler.rs (run), supervisor.rs (everything else),
//!             w1.rs (the real sensor bus)
//!
//! architecture:
//!
//!     ┌──────────────── operator shell ─────────────────┐
//!     │ tlog start | stop | check | tail                │
//!     └───────┬─────────────────────────────────────────┘
//!             │ spawn / signal / read
//!     ┌───────┴──────────┐     ┌─────────────────────┐
//!     │ tlog run         │ ──> │ var/temperatures    │
//!     │ (own proc group) │     │        .jsonl       │
//!     └───────┬──────────┘     └─────────────────────┘
//!             │ /sys/bus/w1/devices/<id>/w1_slave
//!     ┌───────┴──────────┐
//!     │ DS18B20 sensors  │
//!     └──────────────────┘
//!
//! exit codes:
//!     0 success, 1 error, 2 already running, 3 not running, 4 timeout
//!
//! ==============================================================================

mod config;
mod domain;
mod error;
mod follow;
mod hal;
mod lock;
mod process;
mod sampler;
mod store;
mod supervisor;
mod w1;

#[cfg(test)]
mod testutil;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use std::ffi::OsString;
use std::future::Future;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::config::LoggerConfig;
use crate::error::{ControlStatus, SamplerError};
use crate::hal::SensorBus;
use crate::sampler::{Sampler, SamplerSettings};
use crate::supervisor::{LaunchSpec, Status, StopOutcome, Supervisor};
use crate::w1::W1Bus;

#[derive(Parser)]
#[command(name = "tlog", version, about = "Remote logger for DS18B20 one-wire temperature sensors")]
struct Cli {
    /// config file (default: config/logger.toml or ../config/logger.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// more log output (-v debug, -vv trace); RUST_LOG wins if set
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// sampling interval in seconds
    #[arg(long, global = true)]
    interval: Option<f64>,

    #[arg(long, global = true)]
    store_path: Option<PathBuf>,

    #[arg(long, global = true)]
    lock_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// sample in the foreground until SIGTERM / ctrl-c
    Run {
        /// stop after this many sampling cycles
        #[arg(long)]
        ticks: Option<u64>,
    },
    /// report whether the sampling loop is running
    Check,
    /// start (or restart) the sampling loop in the background
    Start,
    /// stop the background sampling loop
    Stop,
    /// show recent samples and follow new ones
    Tail {
        #[arg(short = 'n', long, default_value_t = 10)]
        lines: usize,
        /// print the recent samples and exit
        #[arg(long)]
        no_follow: bool,
        /// raw json lines instead of the readable form
        #[arg(long)]
        json: bool,
    },
    /// list the sensors on the bus with one reading each
    Devices,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let (config, config_path) = match load_config(&cli) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("[ERROR] {e:#}");
            return exit(ControlStatus::Error);
        }
    };
    init_tracing(cli.verbose, &config.logging.level);

    let status = match cli.command {
        Commands::Run { ticks } => cmd_run(&config, ticks).await,
        Commands::Devices => cmd_devices(&config),
        Commands::Check | Commands::Start | Commands::Stop | Commands::Tail { .. } => {
            let launch = match launch_spec(&cli, config_path.as_deref()) {
                Ok(launch) => launch,
                Err(e) => {
                    eprintln!("[ERROR] {e:#}");
                    return exit(ControlStatus::Error);
                }
            };
            let supervisor = Supervisor::new(config, launch);
            match cli.command {
                Commands::Check => cmd_check(&supervisor),
                Commands::Start => cmd_start(&supervisor).await,
                Commands::Stop => cmd_stop(&supervisor).await,
                Commands::Tail {
                    lines,
                    no_follow,
                    json,
                } => cmd_tail(&supervisor, lines, !no_follow, json).await,
                Commands::Run { .. } | Commands::Devices => ControlStatus::Error,
            }
        }
    };
    exit(status)
}

fn exit(status: ControlStatus) -> ExitCode {
    ExitCode::from(status.code())
}

// ==============================================================================
// setup
// ==============================================================================

fn load_config(cli: &Cli) -> anyhow::Result<(LoggerConfig, Option<PathBuf>)> {
    let (mut config, path) = match &cli.config {
        Some(path) => (LoggerConfig::load(path)?, Some(path.clone())),
        None => LoggerConfig::load_or_default()?,
    };
    if let Some(interval) = cli.interval {
        config.sampling.interval_seconds = interval;
    }
    if let Some(path) = &cli.store_path {
        config.storage.store_path = path.clone();
    }
    if let Some(path) = &cli.lock_path {
        config.storage.lock_path = path.clone();
    }
    config.validate()?;
    Ok((config, path))
}

/// RUST_LOG if set, else -v, else the configured level; always to stderr
fn init_tracing(verbose: u8, configured: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();
}

/// `tlog [same options] run`, so the background loop sees the same config
fn launch_spec(cli: &Cli, config_path: Option<&Path>) -> anyhow::Result<LaunchSpec> {
    let program = std::env::current_exe().context("cannot locate the tlog executable")?;
    let mut args: Vec<OsString> = Vec::new();
    if let Some(path) = config_path {
        args.push("--config".into());
        args.push(path.into());
    }
    if let Some(interval) = cli.interval {
        args.push("--interval".into());
        args.push(interval.to_string().into());
    }
    if let Some(path) = &cli.store_path {
        args.push("--store-path".into());
        args.push(path.into());
    }
    if let Some(path) = &cli.lock_path {
        args.push("--lock-path".into());
        args.push(path.into());
    }
    for _ in 0..cli.verbose {
        args.push("-v".into());
    }
    Ok(LaunchSpec { program, args })
}

// ==============================================================================
// commands
// ==============================================================================

async fn cmd_run(config: &LoggerConfig, ticks: Option<u64>) -> ControlStatus {
    println!("===========================================================");
    println!("  tlog - DS18B20 sampling loop (pid {})", std::process::id());
    println!("===========================================================");
    config.print_summary();

    match run_sampler(config, ticks).await {
        Ok(summary) => {
            println!(
                "[RUN] stopped after {} cycles, {} entries written",
                summary.ticks, summary.entries_written
            );
            ControlStatus::Success
        }
        Err(e) => {
            eprintln!("[ERROR] {e:#}");
            e.downcast_ref::<SamplerError>()
                .map(SamplerError::exit_status)
                .unwrap_or(ControlStatus::Error)
        }
    }
}

async fn run_sampler(
    config: &LoggerConfig,
    ticks: Option<u64>,
) -> anyhow::Result<sampler::RunSummary> {
    let bus = Arc::new(W1Bus::new(&config.sensors.w1_devices_dir));
    let devices = if config.sensors.devices.is_empty() {
        bus.discover()?
    } else {
        config.sensors.devices.iter().map(|id| bus.device(id)).collect()
    };
    if devices.is_empty() {
        return Err(SamplerError::NoDevices {
            dir: config.sensors.w1_devices_dir.clone(),
        }
        .into());
    }

    // handlers go in before the lock is taken: a SIGTERM from `stop` must
    // never hit the default action and strand the lock
    let shutdown = shutdown_signal().context("cannot install signal handlers")?;

    let mut settings = SamplerSettings::from_config(config);
    settings.max_ticks = ticks;
    let sampler = Sampler::new(bus, devices, settings);
    let mut state = sampler.subscribe();
    let announce = tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let now = *state.borrow_and_update();
            println!("[RUN] state: {now:?}");
        }
    });
    let result = sampler.run(shutdown).await;
    let _ = announce.await;
    Ok(result?)
}

fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    Ok(async move {
        tokio::select! {
            _ = term.recv() => tracing::info!("SIGTERM received"),
            _ = int.recv() => tracing::info!("SIGINT received"),
        }
    })
}

fn cmd_devices(config: &LoggerConfig) -> ControlStatus {
    let bus = W1Bus::new(&config.sensors.w1_devices_dir);
    let devices = match bus.discover() {
        Ok(devices) => devices,
        Err(e) => {
            eprintln!("[ERROR] {e}");
            return ControlStatus::Error;
        }
    };
    if devices.is_empty() {
        println!(
            "[DEVICES] no temperature sensors under {}",
            config.sensors.w1_devices_dir.display()
        );
        return ControlStatus::Error;
    }
    for device in &devices {
        println!("[DEVICES] {}", bus.read(device));
    }
    ControlStatus::Success
}

fn cmd_check(supervisor: &Supervisor) -> ControlStatus {
    match supervisor.check() {
        Ok(Status::Running { pid, since }) => {
            println!("[CHECK] running (pid {pid}, since {since})");
            ControlStatus::Success
        }
        Ok(Status::NotRunning { stale }) => {
            if stale {
                println!("[CHECK] not running (stale lock left by a crashed loop)");
            } else {
                println!("[CHECK] not running");
            }
            ControlStatus::NotRunning
        }
        Err(e) => report(e),
    }
}

async fn cmd_start(supervisor: &Supervisor) -> ControlStatus {
    match supervisor.start().await {
        Ok(pid) => {
            println!("[START] ✓ logger running (pid {pid})");
            ControlStatus::Success
        }
        Err(e) => report(e),
    }
}

async fn cmd_stop(supervisor: &Supervisor) -> ControlStatus {
    match supervisor.stop().await {
        Ok(StopOutcome::Graceful) => {
            println!("[STOP] ✓ logger stopped");
            ControlStatus::Success
        }
        Ok(StopOutcome::Forced) => {
            println!("[STOP] ✓ logger killed (ignored SIGTERM)");
            ControlStatus::Success
        }
        Err(e) => report(e),
    }
}

async fn cmd_tail(supervisor: &Supervisor, lines: usize, follow: bool, json: bool) -> ControlStatus {
    let cancel = until_interrupted(tokio::signal::ctrl_c());
    let result = supervisor
        .tail(lines, follow, cancel, |entry| {
            if json {
                match serde_json::to_string(entry) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!("cannot render entry {}: {e}", entry.seq),
                }
            } else {
                println!("{entry}");
            }
        })
        .await;
    match result {
        Ok(()) => ControlStatus::Success,
        Err(e) => report(e),
    }
}

/// resolves on ctrl-c; if the handler cannot be installed it never resolves,
/// so the follow runs until the process is killed
async fn until_interrupted(ctrl_c: impl Future<Output = std::io::Result<()>>) {
    if let Err(e) = ctrl_c.await {
        tracing::warn!("cannot listen for ctrl-c, stop with SIGTERM instead: {e}");
        std::future::pending::<()>().await;
    }
}

fn report(e: error::SupervisorError) -> ControlStatus {
    let status = e.exit_status();
    eprintln!("[ERROR] {e}");
    status
}
