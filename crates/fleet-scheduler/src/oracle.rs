//! File-backed profile oracle
//!
//! The profile database is a directory of YAML files, one per GPU device
//! class, each listing the measured operating points of the models that were
//! profiled on it. `best_config` picks the highest-throughput point whose
//! measured latency meets the session's SLO.

use fleet_core::{ModelSession, ProfileOracle, ProfilePoint, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct ProfileFile {
    gpu_device: String,
    models: Vec<ModelProfile>,
}

#[derive(Debug, Deserialize)]
struct ModelProfile {
    framework: String,
    model_name: String,
    version: u32,
    points: Vec<MeasuredPoint>,
}

#[derive(Debug, Clone, Deserialize)]
struct MeasuredPoint {
    batch_size: u32,
    peak_rps: f64,
    latency_p99_ms: u32,
    #[serde(default)]
    memory_mb: u64,
}

/// Profile oracle reading YAML profile tables from the db root directory
#[derive(Debug, Default)]
pub struct FileProfileOracle {
    /// Measured points keyed by (gpu device, model key)
    profiles: HashMap<(String, String), Vec<MeasuredPoint>>,
}

impl FileProfileOracle {
    /// Load every `*.yaml` / `*.yml` profile table under `db_root_dir`.
    ///
    /// A missing directory yields an empty oracle so a scheduler can run
    /// with zero profiles; a malformed file is an error.
    pub fn load(db_root_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = db_root_dir.as_ref();
        if !dir.is_dir() {
            warn!(
                path = %dir.display(),
                "profile database directory not found, starting with an empty oracle"
            );
            return Ok(Self::default());
        }

        let mut oracle = Self::default();
        let mut files = 0usize;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map_or(false, |e| e == "yaml" || e == "yml");
            if !is_yaml {
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            let file: ProfileFile = serde_yaml::from_str(&contents)?;
            oracle.absorb(file);
            files += 1;
        }
        info!(
            files,
            entries = oracle.profiles.len(),
            "loaded model profile database"
        );
        Ok(oracle)
    }

    fn absorb(&mut self, file: ProfileFile) {
        for model in file.models {
            let model_key = format!("{}:{}:{}", model.framework, model.model_name, model.version);
            self.profiles
                .entry((file.gpu_device.clone(), model_key))
                .or_default()
                .extend(model.points);
        }
    }

    #[cfg(test)]
    fn from_yaml(contents: &str) -> Result<Self> {
        let file: ProfileFile = serde_yaml::from_str(contents)?;
        let mut oracle = Self::default();
        oracle.absorb(file);
        Ok(oracle)
    }
}

impl ProfileOracle for FileProfileOracle {
    fn best_config(&self, session: &ModelSession, gpu_device: &str) -> Option<ProfilePoint> {
        let points = self
            .profiles
            .get(&(gpu_device.to_string(), session.model_key()))?;
        points
            .iter()
            .filter(|p| p.latency_p99_ms <= session.latency_sla_ms)
            .max_by(|a, b| {
                a.peak_rps
                    .partial_cmp(&b.peak_rps)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|p| ProfilePoint {
                batch_size: p.batch_size,
                peak_rps: p.peak_rps,
                memory_mb: p.memory_mb,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE_YAML: &str = r#"
gpu_device: tesla_v100
models:
  - framework: tf
    model_name: resnet50
    version: 1
    points:
      - batch_size: 1
        peak_rps: 120.0
        latency_p99_ms: 12
        memory_mb: 900
      - batch_size: 8
        peak_rps: 480.0
        latency_p99_ms: 40
        memory_mb: 1400
      - batch_size: 32
        peak_rps: 900.0
        latency_p99_ms: 130
        memory_mb: 2600
"#;

    #[test]
    fn test_best_config_respects_latency_slo() {
        let oracle = FileProfileOracle::from_yaml(PROFILE_YAML).unwrap();

        // 50ms SLO: batch 32 is too slow, batch 8 wins on throughput
        let session = ModelSession::new("tf", "resnet50", 1, 50);
        let point = oracle.best_config(&session, "tesla_v100").unwrap();
        assert_eq!(point.batch_size, 8);
        assert_eq!(point.peak_rps, 480.0);

        // A looser SLO unlocks the big batch
        let relaxed = ModelSession::new("tf", "resnet50", 1, 200);
        let point = oracle.best_config(&relaxed, "tesla_v100").unwrap();
        assert_eq!(point.batch_size, 32);

        // An SLO nothing meets
        let strict = ModelSession::new("tf", "resnet50", 1, 5);
        assert!(oracle.best_config(&strict, "tesla_v100").is_none());
    }

    #[test]
    fn test_unknown_device_or_model() {
        let oracle = FileProfileOracle::from_yaml(PROFILE_YAML).unwrap();
        let session = ModelSession::new("tf", "resnet50", 1, 50);
        assert!(oracle.best_config(&session, "tesla_t4").is_none());

        let other = ModelSession::new("onnx", "bert", 1, 50);
        assert!(oracle.best_config(&other, "tesla_v100").is_none());
    }

    #[test]
    fn test_load_missing_directory_is_empty() {
        let oracle = FileProfileOracle::load("/nonexistent/profile-db").unwrap();
        let session = ModelSession::new("tf", "resnet50", 1, 50);
        assert!(oracle.best_config(&session, "tesla_v100").is_none());
    }

    #[test]
    fn test_load_directory_of_profiles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tesla_v100.yaml"), PROFILE_YAML).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let oracle = FileProfileOracle::load(dir.path()).unwrap();
        let session = ModelSession::new("tf", "resnet50", 1, 50);
        assert!(oracle.best_config(&session, "tesla_v100").is_some());
    }

    #[test]
    fn test_malformed_profile_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "gpu_device: [not a string").unwrap();
        assert!(FileProfileOracle::load(dir.path()).is_err());
    }
}
