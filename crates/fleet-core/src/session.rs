//! Model session naming
//!
//! A model session is the unit of routing: a concrete binding of framework,
//! model name, model version, and latency SLO. Sessions are compared by their
//! canonical string id; two sessions are the same iff their ids are byte-equal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A concrete (framework, model, version, latency-SLO) binding
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSession {
    /// Serving framework (e.g., "tf", "onnx", "trt")
    pub framework: String,

    /// Model name (e.g., "resnet50", "bert-base")
    pub model_name: String,

    /// Model version
    pub version: u32,

    /// Latency SLO in milliseconds
    pub latency_sla_ms: u32,
}

impl ModelSession {
    /// Create a new model session
    pub fn new(
        framework: impl Into<String>,
        model_name: impl Into<String>,
        version: u32,
        latency_sla_ms: u32,
    ) -> Self {
        Self {
            framework: framework.into(),
            model_name: model_name.into(),
            version,
            latency_sla_ms,
        }
    }

    /// Canonical string id of this session.
    ///
    /// The id is the identity of the session: equality of sessions is equality
    /// of ids, and the registry keys its model table by it.
    pub fn id(&self) -> String {
        format!(
            "{}:{}:{}:{}ms",
            self.framework, self.model_name, self.version, self.latency_sla_ms
        )
    }

    /// Key identifying the model independent of the latency SLO, used for
    /// profile lookups
    pub fn model_key(&self) -> String {
        format!("{}:{}:{}", self.framework, self.model_name, self.version)
    }
}

impl fmt::Display for ModelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl FromStr for ModelSession {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 4 {
            return Err(crate::Error::InvalidModelSession(s.to_string()));
        }
        let version: u32 = parts[2]
            .parse()
            .map_err(|_| crate::Error::InvalidModelSession(s.to_string()))?;
        let sla = parts[3]
            .strip_suffix("ms")
            .ok_or_else(|| crate::Error::InvalidModelSession(s.to_string()))?;
        let latency_sla_ms: u32 = sla
            .parse()
            .map_err(|_| crate::Error::InvalidModelSession(s.to_string()))?;
        if parts[0].is_empty() || parts[1].is_empty() {
            return Err(crate::Error::InvalidModelSession(s.to_string()));
        }
        Ok(Self {
            framework: parts[0].to_string(),
            model_name: parts[1].to_string(),
            version,
            latency_sla_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_format() {
        let session = ModelSession::new("tf", "resnet50", 1, 50);
        assert_eq!(session.id(), "tf:resnet50:1:50ms");
        assert_eq!(session.model_key(), "tf:resnet50:1");
        assert_eq!(session.to_string(), session.id());
    }

    #[test]
    fn test_session_parse_round_trip() {
        let session = ModelSession::new("onnx", "bert-base", 3, 100);
        let parsed: ModelSession = session.id().parse().unwrap();
        assert_eq!(parsed, session);
    }

    #[test]
    fn test_session_parse_rejects_malformed() {
        assert!("tf:resnet50:1".parse::<ModelSession>().is_err());
        assert!("tf:resnet50:one:50ms".parse::<ModelSession>().is_err());
        assert!("tf:resnet50:1:50".parse::<ModelSession>().is_err());
        assert!(":resnet50:1:50ms".parse::<ModelSession>().is_err());
    }

    #[test]
    fn test_session_identity_is_id_equality() {
        let a = ModelSession::new("tf", "resnet50", 1, 50);
        let b = ModelSession::new("tf", "resnet50", 1, 100);
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.model_key(), b.model_key());
    }
}
