//! # fleet-core
//!
//! Core types, traits, and utilities for inferfleet - a centralized scheduler
//! for a fleet of inference serving nodes.
//!
//! This crate provides the foundational data structures and interfaces that are
//! shared between the scheduler daemon and its collaborators. It includes:
//!
//! - Node identifiers and model session naming
//! - Model route snapshots pushed to frontends
//! - Collaborator traits for backend/frontend control and profile lookups,
//!   with mock implementations for tests
//! - Static workload declarations and their file loader
//! - Error handling types and utilities

pub mod error;
pub mod route;
pub mod session;
pub mod traits;
pub mod types;
pub mod workload;

// Re-export commonly used types at the crate root
pub use error::{Error, Result};
pub use route::{ModelRoute, RouteEntry};
pub use session::ModelSession;
pub use traits::{BackendControl, FrontendControl, ProfileOracle, ProfilePoint};
pub use types::{ModelInstanceConfig, NodeId};
pub use workload::{load_workload_file, WorkloadSpec};
