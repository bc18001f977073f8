//! Static workload declarations
//!
//! A workload file declares slot groups of model instances that must each be
//! hosted by a single dedicated backend. The file is read once at scheduler
//! startup; slot group indices are stable for the life of the process.

use crate::{ModelSession, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Declaration of one model instance inside a static workload slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Serving framework
    pub framework: String,

    /// Model name
    pub model_name: String,

    /// Model version
    pub version: u32,

    /// Latency SLO in milliseconds
    pub latency_sla_ms: u32,

    /// Optional cap on the batch size chosen by the profile oracle
    #[serde(default)]
    pub batch_size: Option<u32>,
}

impl WorkloadSpec {
    /// The model session this declaration describes
    pub fn session(&self) -> ModelSession {
        ModelSession::new(
            self.framework.clone(),
            self.model_name.clone(),
            self.version,
            self.latency_sla_ms,
        )
    }
}

/// Load the static workload configuration from a YAML file.
///
/// The document root is a list of slot groups; each slot group is a list of
/// model-instance declarations. An unreadable or malformed file is a startup
/// failure.
pub fn load_workload_file(path: impl AsRef<Path>) -> Result<Vec<Vec<WorkloadSpec>>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)?;
    let slots: Vec<Vec<WorkloadSpec>> = serde_yaml::from_str(&contents)?;
    for (idx, group) in slots.iter().enumerate() {
        if group.is_empty() {
            return Err(crate::Error::workload(format!(
                "workload slot {} is empty",
                idx
            )));
        }
    }
    Ok(slots)
}
