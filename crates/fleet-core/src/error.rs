//! Error handling for inferfleet
//!
//! Provides a unified error type and result type for use across all inferfleet
//! components.

use crate::NodeId;

/// Result type alias for inferfleet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for inferfleet
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// A node id that is not present in any registry table
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request or parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Model session id that does not parse or does not exist
    #[error("Invalid model session: {0}")]
    InvalidModelSession(String),

    /// Static workload file errors
    #[error("Workload error: {0}")]
    Workload(String),

    /// gRPC/transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal scheduler error
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a workload error
    pub fn workload(msg: impl Into<String>) -> Self {
        Self::Workload(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error indicates a client-side problem
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::UnknownNode(_)
                | Error::InvalidRequest(_)
                | Error::InvalidModelSession(_)
                | Error::NotFound(_)
        )
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidConfiguration(_) => "configuration",
            Error::UnknownNode(_) => "unknown_node",
            Error::NotFound(_) => "not_found",
            Error::InvalidRequest(_) => "invalid_request",
            Error::InvalidModelSession(_) => "invalid_model_session",
            Error::Workload(_) => "workload",
            Error::Transport(_) => "transport",
            Error::Timeout(_) => "timeout",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
            Error::Yaml(_) => "yaml",
        }
    }
}
