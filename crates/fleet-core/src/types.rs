//! Core type definitions for inferfleet

use crate::ModelSession;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a node in the fleet.
///
/// Identifiers are assigned by the scheduler at registration time, are unique
/// within a scheduler process, and are never reused. Zero is reserved as
/// "none".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    /// The reserved "no node" identifier
    pub const NONE: NodeId = NodeId(0);

    /// Create a NodeId from a raw u32
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw u32 value
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Check whether this is the reserved "none" identifier
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Configuration of one model instance hosted on a backend.
///
/// Produced by `BackendDelegate::prepare_load_model` and pushed to the backend
/// over the control channel; the scheduler keeps a copy as the record of the
/// throughput reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInstanceConfig {
    /// The model session this instance serves
    pub session: ModelSession,

    /// Batch size the backend should run the instance at
    pub batch_size: u32,

    /// Throughput reserved on the backend for this instance, in requests/sec
    pub reserved_rps: f64,

    /// GPU memory footprint of the instance in MB
    pub memory_mb: u64,

    /// Latency SLO the instance must meet, in milliseconds
    pub latency_sla_ms: u32,
}

impl ModelInstanceConfig {
    /// Canonical id of the session this instance serves
    pub fn session_id(&self) -> String {
        self.session.id()
    }
}
