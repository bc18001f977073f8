//! Frontend delegate: one router's subscriptions

use fleet_core::{FrontendControl, NodeId};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The scheduler's record of one frontend node
pub struct FrontendDelegate {
    node_id: NodeId,
    address: String,
    ctrl: Arc<dyn FrontendControl>,
    last_beacon: Instant,
    subscriptions: HashSet<String>,
}

impl FrontendDelegate {
    pub fn new(
        node_id: NodeId,
        address: String,
        ctrl: Arc<dyn FrontendControl>,
        now: Instant,
    ) -> Self {
        Self {
            node_id,
            address,
            ctrl,
            last_beacon: now,
            subscriptions: HashSet::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Shared handle to the frontend's control surface
    pub fn ctrl(&self) -> Arc<dyn FrontendControl> {
        self.ctrl.clone()
    }

    /// Subscribe this frontend to a model session
    pub fn subscribe(&mut self, model_session_id: String) {
        self.subscriptions.insert(model_session_id);
    }

    /// Drop a subscription
    pub fn unsubscribe(&mut self, model_session_id: &str) {
        self.subscriptions.remove(model_session_id);
    }

    pub fn subscriptions(&self) -> &HashSet<String> {
        &self.subscriptions
    }

    /// Record a keep-alive from this frontend
    pub fn touch(&mut self, now: Instant) {
        self.last_beacon = now;
    }

    pub fn last_beacon(&self) -> Instant {
        self.last_beacon
    }

    /// Whether the frontend's beacon is fresher than `timeout`
    pub fn is_alive(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_beacon) <= timeout
    }
}

impl std::fmt::Debug for FrontendDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrontendDelegate")
            .field("node_id", &self.node_id)
            .field("address", &self.address)
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::traits::MockFrontendControl;

    #[test]
    fn test_subscriptions() {
        let mut frontend = FrontendDelegate::new(
            NodeId::new(2),
            "10.0.1.1:9001".to_string(),
            Arc::new(MockFrontendControl::new()),
            Instant::now(),
        );

        frontend.subscribe("tf:resnet50:1:50ms".to_string());
        frontend.subscribe("tf:resnet50:1:50ms".to_string());
        assert_eq!(frontend.subscriptions().len(), 1);

        frontend.unsubscribe("tf:resnet50:1:50ms");
        assert!(frontend.subscriptions().is_empty());
    }

    #[test]
    fn test_beacon_expiry() {
        let now = Instant::now();
        let frontend = FrontendDelegate::new(
            NodeId::new(2),
            "10.0.1.1:9001".to_string(),
            Arc::new(MockFrontendControl::new()),
            now,
        );

        let timeout = Duration::from_secs(5).mul_f64(1.5);
        assert!(frontend.is_alive(now, timeout));
        assert!(!frontend.is_alive(now + Duration::from_secs(10), timeout));
    }
}
