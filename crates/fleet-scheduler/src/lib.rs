//! # fleet-scheduler
//!
//! The centralized scheduler daemon (fleetd) for inferfleet.
//!
//! The scheduler holds the global view of which model sessions exist, which
//! backends serve each session with what throughput budget, and which
//! frontends subscribe to each session. It decides placement and routing, and
//! republishes both as the fleet and its measured load change. All table
//! mutations are serialized by a single registry mutex; outbound RPCs are
//! collected under the mutex and performed after it is released.

pub mod clients;
pub mod config;
pub mod delegate;
pub mod dispatch;
pub mod loops;
pub mod oracle;
pub mod registry;
pub mod server;
pub mod service;

mod epoch;
mod placement;
mod routes;

// Re-export commonly used types
pub use config::{LoggingConfig, SchedulerConfig};
pub use registry::{LoadModelOutcome, Registry, SchedulingParams};
pub use server::Scheduler;

/// Throughput below this threshold is treated as zero
pub(crate) const RPS_EPSILON: f64 = 1e-6;

// Error handling
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Core error: {0}")]
    Core(#[from] fleet_core::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config file error: {0}")]
    ConfigFile(#[from] ::config::ConfigError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Initialize logging and tracing
pub fn init_logging(logging_config: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging_config.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging_config.show_target);

    match logging_config.format.as_str() {
        "json" => subscriber.json().init(),
        _ => subscriber.init(),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.scheduler.port > 0);
    }
}
