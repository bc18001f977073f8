//! Scheduler daemon lifecycle
//!
//! Wires the profile oracle, static workload configuration, registry, gRPC
//! server, and the two periodic loops together, and runs until a shutdown
//! signal arrives.

use crate::loops::{run_beacon_loop, run_epoch_loop};
use crate::oracle::FileProfileOracle;
use crate::registry::Registry;
use crate::service::SchedulerCtrlService;
use crate::{Result, SchedulerConfig};
use fleet_core::load_workload_file;
use fleet_proto::SchedulerCtrlServer;
use std::sync::Arc;
use tokio::sync::watch;
use tonic::transport::Server;
use tracing::info;

/// The scheduler daemon
pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<Registry>,
}

impl Scheduler {
    /// Build the scheduler: load the profile database and the static
    /// workload file, then construct the registry. A workload file that does
    /// not parse is fatal.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let oracle = Arc::new(FileProfileOracle::load(&config.scheduler.db_root_dir)?);

        let static_workloads = match &config.scheduler.workload_file {
            Some(path) => {
                let slots = load_workload_file(path)?;
                info!(slots = slots.len(), file = %path.display(), "loaded static workloads");
                slots
            }
            None => Vec::new(),
        };

        let registry = Arc::new(Registry::new(
            oracle,
            config.scheduling_params(),
            static_workloads,
        ));
        Ok(Self { config, registry })
    }

    /// Shared handle to the registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Serve until ctrl-c, then stop the loops after their current pass
    pub async fn run(self) -> Result<()> {
        let addr = self.config.bind_addr();
        let rpc_deadline = self.config.rpc_deadline();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let beacon = tokio::spawn(run_beacon_loop(
            self.registry.clone(),
            rpc_deadline,
            shutdown_rx.clone(),
        ));
        let epoch = tokio::spawn(run_epoch_loop(
            self.registry.clone(),
            rpc_deadline,
            shutdown_rx,
        ));

        let service = SchedulerCtrlService::new(self.registry.clone(), rpc_deadline);
        info!(%addr, "scheduler listening");

        let serve_result = Server::builder()
            .add_service(SchedulerCtrlServer::new(service))
            .serve_with_shutdown(addr, async {
                let _ = tokio::signal::ctrl_c().await;
                info!("received shutdown signal");
            })
            .await;

        // Loops finish their current pass before observing the flag
        let _ = shutdown_tx.send(true);
        let _ = beacon.await;
        let _ = epoch.await;

        serve_result?;
        info!("scheduler stopped");
        Ok(())
    }
}
