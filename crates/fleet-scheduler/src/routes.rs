//! Route snapshots and subscriber fan-out
//!
//! Routes are computed under the registry mutex and recorded into the outbox;
//! the actual pushes run after the lock is released so a slow frontend can
//! never stall the scheduler.

use crate::dispatch::Outbox;
use crate::registry::RegistryState;
use fleet_core::{ModelRoute, NodeId, RouteEntry};
use std::collections::BTreeSet;
use std::sync::Arc;

impl RegistryState {
    /// Snapshot the current route of a session: one entry per assigned
    /// backend with its address, sorted by node id.
    pub(crate) fn model_route_snapshot(&self, session_id: &str) -> ModelRoute {
        let Some(info) = self.model_table.get(session_id) else {
            return ModelRoute::empty(session_id);
        };
        let entries: Vec<RouteEntry> = info
            .backend_rps
            .iter()
            .filter_map(|(&backend_id, &rps)| {
                self.backends.get(&backend_id).map(|backend| RouteEntry {
                    node_id: backend_id,
                    address: backend.address().to_string(),
                    rps,
                })
            })
            .collect();
        ModelRoute::new(session_id, entries)
    }

    /// Record a route push for every subscriber of every changed session
    pub(crate) fn update_model_routes(&self, sessions: &BTreeSet<String>, outbox: &mut Outbox) {
        for session_id in sessions {
            let Some(info) = self.model_table.get(session_id) else {
                continue;
            };
            if info.subscribers.is_empty() {
                continue;
            }
            let route = Arc::new(self.model_route_snapshot(session_id));
            let mut subscribers: Vec<NodeId> = info.subscribers.iter().copied().collect();
            subscribers.sort();
            for frontend_id in subscribers {
                if let Some(frontend) = self.frontends.get(&frontend_id) {
                    outbox.push_route(frontend_id, frontend.ctrl(), route.clone());
                }
            }
        }
    }
}
