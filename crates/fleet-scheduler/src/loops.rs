//! Periodic beacon and epoch loops
//!
//! Each loop runs on its own task, takes one full pass under the registry
//! mutex, then flushes the resulting outbox outside it. Shutdown is observed
//! between passes, never mid-pass.

use crate::registry::Registry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// Liveness loop: expire stale nodes every beacon interval
pub async fn run_beacon_loop(
    registry: Arc<Registry>,
    rpc_deadline: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(registry.params().beacon_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("beacon loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let outbox = registry.beacon_sweep(Instant::now());
                outbox.flush(rpc_deadline).await;
            }
            _ = shutdown.changed() => {
                info!("beacon loop stopped");
                return;
            }
        }
    }
}

/// Re-planning loop: reschedule every session from measured load each epoch
pub async fn run_epoch_loop(
    registry: Arc<Registry>,
    rpc_deadline: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(registry.params().epoch_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("epoch loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let outbox = registry.epoch_schedule();
                outbox.flush(rpc_deadline).await;
            }
            _ = shutdown.changed() => {
                info!("epoch loop stopped");
                return;
            }
        }
    }
}
