//! Configuration management for the scheduler daemon
//!
//! Supports YAML files, environment variables with an `INFERFLEET_` prefix,
//! and command-line overrides applied by the binary.

use crate::registry::SchedulingParams;
use crate::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Complete configuration for the scheduler daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Scheduler-specific configuration
    pub scheduler: SchedulerSection,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Scheduler-specific configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// IP address the RPC server binds to
    pub bind_ip: IpAddr,

    /// Port the RPC server binds to
    pub port: u16,

    /// Number of worker threads handling RPCs
    pub nthreads: usize,

    /// Beacon interval in seconds; nodes whose beacon is older than
    /// 1.5 x this are treated as dead
    pub beacon_interval_sec: u64,

    /// Epoch interval in seconds; every epoch the scheduler re-plans
    /// throughput budgets from measured load
    pub epoch_interval_sec: u64,

    /// Number of per-epoch RPS measurements kept per model session
    pub history_len: usize,

    /// A session grows when measured load exceeds its budget by this fraction
    pub over_provision_slack: f64,

    /// A session shrinks when measured load falls below its budget by this
    /// fraction
    pub under_provision_slack: f64,

    /// Directory holding the model profile database
    pub db_root_dir: PathBuf,

    /// Optional static workload configuration file
    pub workload_file: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,

    /// Show target in logs
    pub show_target: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerSection::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 7001,
            nthreads: 4,
            beacon_interval_sec: 5,
            epoch_interval_sec: 30,
            history_len: 10,
            over_provision_slack: 0.1,
            under_provision_slack: 0.1,
            db_root_dir: PathBuf::from("profiles"),
            workload_file: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: false,
        }
    }
}

impl SchedulerConfig {
    /// Load configuration with precedence: environment variables over the
    /// optional file, over the defaults.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path.to_path_buf()));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("INFERFLEET")
                .separator("_")
                .try_parsing(true),
        );

        let parsed: Self = builder.build()?.try_deserialize()?;
        Ok(parsed)
    }

    /// Load configuration from a specific file, layered over the defaults
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        Self::load(Some(&path.into()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.port == 0 {
            return Err(SchedulerError::Config("port must be non-zero".to_string()));
        }
        if s.nthreads == 0 {
            return Err(SchedulerError::Config(
                "nthreads must be at least 1".to_string(),
            ));
        }
        if s.beacon_interval_sec == 0 || s.epoch_interval_sec == 0 {
            return Err(SchedulerError::Config(
                "beacon and epoch intervals must be at least 1 second".to_string(),
            ));
        }
        if s.history_len == 0 {
            return Err(SchedulerError::Config(
                "history_len must be at least 1".to_string(),
            ));
        }
        for (name, slack) in [
            ("over_provision_slack", s.over_provision_slack),
            ("under_provision_slack", s.under_provision_slack),
        ] {
            if !(0.0..1.0).contains(&slack) {
                return Err(SchedulerError::Config(format!(
                    "{} must be in [0, 1), got {}",
                    name, slack
                )));
            }
        }
        Ok(())
    }

    /// The socket address the RPC server binds to
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.scheduler.bind_ip, self.scheduler.port)
    }

    /// Deadline applied to every outbound RPC: one beacon interval
    pub fn rpc_deadline(&self) -> Duration {
        Duration::from_secs(self.scheduler.beacon_interval_sec)
    }

    /// The scheduling parameters handed to the registry
    pub fn scheduling_params(&self) -> SchedulingParams {
        let s = &self.scheduler;
        SchedulingParams {
            beacon_interval: Duration::from_secs(s.beacon_interval_sec),
            epoch_interval: Duration::from_secs(s.epoch_interval_sec),
            history_len: s.history_len,
            over_provision_slack: s.over_provision_slack,
            under_provision_slack: s.under_provision_slack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr().port(), 7001);
        assert_eq!(config.rpc_deadline(), Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SchedulerConfig::default();
        config.scheduler.nthreads = 0;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.scheduler.over_provision_slack = 1.5;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.scheduler.beacon_interval_sec = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scheduling_params_derived_from_config() {
        let config = SchedulerConfig::default();
        let params = config.scheduling_params();
        assert_eq!(params.beacon_interval, Duration::from_secs(5));
        assert_eq!(params.epoch_interval, Duration::from_secs(30));
        assert_eq!(params.history_len, 10);
        // one missed beacon is tolerated, two are not
        assert_eq!(
            params.beacon_timeout(),
            Duration::from_secs(5).mul_f64(1.5)
        );
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(
            b"scheduler:\n  port: 9321\n  beacon_interval_sec: 2\nlogging:\n  level: debug\n",
        )
        .unwrap();

        let config = SchedulerConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.scheduler.port, 9321);
        assert_eq!(config.scheduler.beacon_interval_sec, 2);
        assert_eq!(config.logging.level, "debug");
        // untouched fields keep their defaults
        assert_eq!(config.scheduler.epoch_interval_sec, 30);
    }
}
