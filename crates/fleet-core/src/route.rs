//! Model route snapshots
//!
//! A route is the scheduler's answer to "which backends serve this session,
//! at what rate". Routes are pushed to subscribed frontends whenever a
//! session's backend set changes; frontends treat them as level-triggered
//! snapshots, never deltas.

use crate::NodeId;
use serde::{Deserialize, Serialize};

/// One backend entry in a model route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Backend node id
    pub node_id: NodeId,

    /// Network address the frontend should dispatch to
    pub address: String,

    /// Throughput assigned to this backend for the session, in requests/sec
    pub rps: f64,
}

/// Snapshot of the backends serving one model session.
///
/// Entries are sorted by backend node id so that equal assignments always
/// serialize identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRoute {
    /// Canonical model session id
    pub model_session_id: String,

    /// Backends serving this session, sorted by node id
    pub backends: Vec<RouteEntry>,
}

impl ModelRoute {
    /// Create a route snapshot, sorting entries by node id
    pub fn new(model_session_id: impl Into<String>, mut backends: Vec<RouteEntry>) -> Self {
        backends.sort_by_key(|e| e.node_id);
        Self {
            model_session_id: model_session_id.into(),
            backends,
        }
    }

    /// Create an empty route for a session with no backends
    pub fn empty(model_session_id: impl Into<String>) -> Self {
        Self {
            model_session_id: model_session_id.into(),
            backends: Vec::new(),
        }
    }

    /// Total assigned throughput across all backends
    pub fn total_rps(&self) -> f64 {
        self.backends.iter().map(|e| e.rps).sum()
    }

    /// Check whether any backend serves this route
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
