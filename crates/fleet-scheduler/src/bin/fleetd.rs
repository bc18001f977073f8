//! Main binary for the scheduler daemon (fleetd)

use clap::Parser;
use fleet_scheduler::{Scheduler, SchedulerConfig};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "fleetd")]
#[command(about = "Centralized scheduler for a fleet of inference serving nodes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port the RPC server binds to
    #[arg(long)]
    port: Option<u16>,

    /// Number of worker threads handling RPCs
    #[arg(long)]
    nthreads: Option<usize>,

    /// Directory holding the model profile database
    #[arg(long, value_name = "DIR")]
    db_root_dir: Option<PathBuf>,

    /// Beacon interval in seconds
    #[arg(long, value_name = "SECONDS")]
    beacon_interval: Option<u64>,

    /// Epoch interval in seconds
    #[arg(long, value_name = "SECONDS")]
    epoch_interval: Option<u64>,

    /// Static workload configuration file
    #[arg(long, value_name = "FILE")]
    workload_file: Option<PathBuf>,

    /// Log level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("fleetd: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> fleet_scheduler::Result<()> {
    let mut config = SchedulerConfig::load(cli.config.as_deref())?;

    // CLI flags override file and environment
    if let Some(port) = cli.port {
        config.scheduler.port = port;
    }
    if let Some(nthreads) = cli.nthreads {
        config.scheduler.nthreads = nthreads;
    }
    if let Some(db_root_dir) = cli.db_root_dir {
        config.scheduler.db_root_dir = db_root_dir;
    }
    if let Some(beacon_interval) = cli.beacon_interval {
        config.scheduler.beacon_interval_sec = beacon_interval;
    }
    if let Some(epoch_interval) = cli.epoch_interval {
        config.scheduler.epoch_interval_sec = epoch_interval;
    }
    if let Some(workload_file) = cli.workload_file {
        config.scheduler.workload_file = Some(workload_file);
    }
    if let Some(log_level) = cli.log_level {
        config.logging.level = log_level;
    }

    fleet_scheduler::init_logging(&config.logging)?;
    config.validate()?;

    info!(
        port = config.scheduler.port,
        nthreads = config.scheduler.nthreads,
        beacon_interval_sec = config.scheduler.beacon_interval_sec,
        epoch_interval_sec = config.scheduler.epoch_interval_sec,
        "starting fleetd"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.scheduler.nthreads)
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let scheduler = Scheduler::new(config)?;
        scheduler.run().await
    })
}
