//! Collaborator traits for the scheduler core
//!
//! These traits define the interfaces through which the scheduler talks to
//! the world: profile lookups for placement decisions, and the outbound
//! control surface of backends and frontends. The gRPC-backed implementations
//! live in the scheduler crate; the mocks below are used throughout the test
//! suites.

use crate::{ModelInstanceConfig, ModelRoute, ModelSession, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One profiled operating point of a model on a GPU device class
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProfilePoint {
    /// Batch size of the operating point
    pub batch_size: u32,

    /// Peak sustainable throughput at this batch size, in requests/sec
    pub peak_rps: f64,

    /// GPU memory footprint in MB
    pub memory_mb: u64,
}

/// Lookup of model performance profiles.
///
/// Answers "what is the best configuration of model M on device class D that
/// still meets M's latency SLO". Lookups are pure and cheap; the scheduler
/// calls them under its registry mutex.
pub trait ProfileOracle: Send + Sync {
    /// Return the highest-throughput operating point of `session` on
    /// `gpu_device` that meets the session's latency SLO, or `None` if the
    /// model has no profile for that device or no point meets the SLO.
    fn best_config(&self, session: &ModelSession, gpu_device: &str) -> Option<ProfilePoint>;
}

/// Outbound control surface of a backend node
#[async_trait]
pub trait BackendControl: Send + Sync {
    /// Push a model instance to the backend
    async fn load_model(&self, config: &ModelInstanceConfig) -> Result<()>;

    /// Remove a model instance from the backend
    async fn unload_model(&self, model_session_id: &str) -> Result<()>;

    /// Change the throughput reservation of an instance already on the backend
    async fn update_model_throughput(&self, model_session_id: &str, rps: f64) -> Result<()>;
}

/// Outbound control surface of a frontend node
#[async_trait]
pub trait FrontendControl: Send + Sync {
    /// Push a route snapshot to the frontend (best-effort)
    async fn update_model_route(&self, route: &ModelRoute) -> Result<()>;
}

/// Mock implementations for testing and development

/// Mock profile oracle backed by a static table.
///
/// Points are keyed by (gpu device, model key); a default point, if set,
/// answers every lookup that misses the table.
#[derive(Debug, Default)]
pub struct MockProfileOracle {
    points: HashMap<(String, String), ProfilePoint>,
    default_point: Option<ProfilePoint>,
}

impl MockProfileOracle {
    /// An oracle with no profiles; every lookup fails
    pub fn new() -> Self {
        Self::default()
    }

    /// An oracle that answers every lookup with an effectively unlimited
    /// throughput point, so reservations are bounded only by backend capacity
    pub fn unlimited() -> Self {
        Self::new().with_default(ProfilePoint {
            batch_size: 8,
            peak_rps: f64::MAX,
            memory_mb: 0,
        })
    }

    /// Set the default point returned when the table has no entry
    pub fn with_default(mut self, point: ProfilePoint) -> Self {
        self.default_point = Some(point);
        self
    }

    /// Add a profile point for (gpu device, model key)
    pub fn with_profile(
        mut self,
        gpu_device: impl Into<String>,
        model_key: impl Into<String>,
        point: ProfilePoint,
    ) -> Self {
        self.points.insert((gpu_device.into(), model_key.into()), point);
        self
    }
}

impl ProfileOracle for MockProfileOracle {
    fn best_config(&self, session: &ModelSession, gpu_device: &str) -> Option<ProfilePoint> {
        self.points
            .get(&(gpu_device.to_string(), session.model_key()))
            .copied()
            .or(self.default_point)
    }
}

/// A call recorded by `MockBackendControl`
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Load(ModelInstanceConfig),
    Unload(String),
    UpdateThroughput(String, f64),
}

/// Mock backend control that records every call
#[derive(Debug, Clone, Default)]
pub struct MockBackendControl {
    calls: Arc<Mutex<Vec<BackendCall>>>,
}

impl MockBackendControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// All calls recorded so far, in order
    pub async fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl BackendControl for MockBackendControl {
    async fn load_model(&self, config: &ModelInstanceConfig) -> Result<()> {
        self.calls.lock().await.push(BackendCall::Load(config.clone()));
        Ok(())
    }

    async fn unload_model(&self, model_session_id: &str) -> Result<()> {
        self.calls
            .lock()
            .await
            .push(BackendCall::Unload(model_session_id.to_string()));
        Ok(())
    }

    async fn update_model_throughput(&self, model_session_id: &str, rps: f64) -> Result<()> {
        self.calls
            .lock()
            .await
            .push(BackendCall::UpdateThroughput(model_session_id.to_string(), rps));
        Ok(())
    }
}

/// Mock frontend control that records every pushed route
#[derive(Debug, Clone, Default)]
pub struct MockFrontendControl {
    routes: Arc<Mutex<Vec<ModelRoute>>>,
}

impl MockFrontendControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// All routes pushed so far, in order
    pub async fn routes(&self) -> Vec<ModelRoute> {
        self.routes.lock().await.clone()
    }

    /// The most recently pushed route, if any
    pub async fn last_route(&self) -> Option<ModelRoute> {
        self.routes.lock().await.last().cloned()
    }
}

#[async_trait]
impl FrontendControl for MockFrontendControl {
    async fn update_model_route(&self, route: &ModelRoute) -> Result<()> {
        self.routes.lock().await.push(route.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeId, RouteEntry};

    fn session() -> ModelSession {
        ModelSession::new("tf", "resnet50", 1, 50)
    }

    #[test]
    fn test_mock_oracle_lookup() {
        let oracle = MockProfileOracle::new().with_profile(
            "tesla_v100",
            "tf:resnet50:1",
            ProfilePoint {
                batch_size: 16,
                peak_rps: 400.0,
                memory_mb: 2048,
            },
        );

        let point = oracle.best_config(&session(), "tesla_v100").unwrap();
        assert_eq!(point.batch_size, 16);
        assert_eq!(point.peak_rps, 400.0);

        // No profile for this device class
        assert!(oracle.best_config(&session(), "tesla_t4").is_none());
    }

    #[test]
    fn test_mock_oracle_default_point() {
        let oracle = MockProfileOracle::unlimited();
        assert!(oracle.best_config(&session(), "anything").is_some());
    }

    #[tokio::test]
    async fn test_mock_backend_control_records_calls() {
        let ctrl = MockBackendControl::new();
        let cfg = ModelInstanceConfig {
            session: session(),
            batch_size: 8,
            reserved_rps: 100.0,
            memory_mb: 512,
            latency_sla_ms: 50,
        };

        ctrl.load_model(&cfg).await.unwrap();
        ctrl.update_model_throughput(&cfg.session_id(), 80.0).await.unwrap();
        ctrl.unload_model(&cfg.session_id()).await.unwrap();

        let calls = ctrl.calls().await;
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], BackendCall::Load(cfg.clone()));
        assert_eq!(
            calls[1],
            BackendCall::UpdateThroughput("tf:resnet50:1:50ms".to_string(), 80.0)
        );
        assert_eq!(calls[2], BackendCall::Unload("tf:resnet50:1:50ms".to_string()));
    }

    #[tokio::test]
    async fn test_mock_frontend_control_records_routes() {
        let ctrl = MockFrontendControl::new();
        let route = ModelRoute::new(
            "tf:resnet50:1:50ms",
            vec![RouteEntry {
                node_id: NodeId::new(1),
                address: "10.0.0.1:8001".to_string(),
                rps: 200.0,
            }],
        );

        ctrl.update_model_route(&route).await.unwrap();
        assert_eq!(ctrl.last_route().await, Some(route));
    }
}
