//! Outbound RPC dispatch
//!
//! The registry mutex must never be held across remote calls. Every mutation
//! therefore records its outbound work (instance pushes, route pushes) in an
//! [`Outbox`] while holding the lock, and the caller flushes the outbox after
//! releasing it. Push failures are logged and never mutate scheduler state;
//! the next beacon or epoch pass reconciles divergent peers.

use fleet_core::{BackendControl, FrontendControl, ModelInstanceConfig, ModelRoute, NodeId};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

enum OutboundCall {
    LoadModel {
        backend: NodeId,
        ctrl: Arc<dyn BackendControl>,
        config: ModelInstanceConfig,
    },
    UnloadModel {
        backend: NodeId,
        ctrl: Arc<dyn BackendControl>,
        model_session_id: String,
    },
    UpdateThroughput {
        backend: NodeId,
        ctrl: Arc<dyn BackendControl>,
        model_session_id: String,
        rps: f64,
    },
    PushRoute {
        frontend: NodeId,
        ctrl: Arc<dyn FrontendControl>,
        route: Arc<ModelRoute>,
    },
}

impl OutboundCall {
    fn describe(&self) -> String {
        match self {
            OutboundCall::LoadModel { backend, config, .. } => {
                format!("load {} on backend {}", config.session_id(), backend)
            }
            OutboundCall::UnloadModel {
                backend,
                model_session_id,
                ..
            } => format!("unload {} on backend {}", model_session_id, backend),
            OutboundCall::UpdateThroughput {
                backend,
                model_session_id,
                rps,
                ..
            } => format!(
                "update {} to {:.1} rps on backend {}",
                model_session_id, rps, backend
            ),
            OutboundCall::PushRoute { frontend, route, .. } => {
                format!("push route {} to frontend {}", route.model_session_id, frontend)
            }
        }
    }

    async fn execute(&self) -> fleet_core::Result<()> {
        match self {
            OutboundCall::LoadModel { ctrl, config, .. } => ctrl.load_model(config).await,
            OutboundCall::UnloadModel {
                ctrl,
                model_session_id,
                ..
            } => ctrl.unload_model(model_session_id).await,
            OutboundCall::UpdateThroughput {
                ctrl,
                model_session_id,
                rps,
                ..
            } => ctrl.update_model_throughput(model_session_id, *rps).await,
            OutboundCall::PushRoute { ctrl, route, .. } => ctrl.update_model_route(route).await,
        }
    }
}

/// Outbound work recorded under the registry mutex, flushed after release
#[derive(Default)]
pub struct Outbox {
    calls: Vec<OutboundCall>,
}

impl Outbox {
    pub fn push_load(
        &mut self,
        backend: NodeId,
        ctrl: Arc<dyn BackendControl>,
        config: ModelInstanceConfig,
    ) {
        self.calls.push(OutboundCall::LoadModel {
            backend,
            ctrl,
            config,
        });
    }

    pub fn push_unload(
        &mut self,
        backend: NodeId,
        ctrl: Arc<dyn BackendControl>,
        model_session_id: String,
    ) {
        self.calls.push(OutboundCall::UnloadModel {
            backend,
            ctrl,
            model_session_id,
        });
    }

    pub fn push_update_throughput(
        &mut self,
        backend: NodeId,
        ctrl: Arc<dyn BackendControl>,
        model_session_id: String,
        rps: f64,
    ) {
        self.calls.push(OutboundCall::UpdateThroughput {
            backend,
            ctrl,
            model_session_id,
            rps,
        });
    }

    pub fn push_route(
        &mut self,
        frontend: NodeId,
        ctrl: Arc<dyn FrontendControl>,
        route: Arc<ModelRoute>,
    ) {
        self.calls.push(OutboundCall::PushRoute {
            frontend,
            ctrl,
            route,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Perform all recorded calls concurrently, each bounded by `deadline`.
    ///
    /// Failures and timeouts are logged; there is no retry and no rollback.
    pub async fn flush(self, deadline: Duration) {
        if self.calls.is_empty() {
            return;
        }
        debug!(calls = self.calls.len(), "flushing outbound calls");

        let mut tasks = JoinSet::new();
        for call in self.calls {
            tasks.spawn(async move {
                let label = call.describe();
                match tokio::time::timeout(deadline, call.execute()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(call = %label, error = %e, "outbound call failed"),
                    Err(_) => warn!(call = %label, "outbound call timed out"),
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }
}
