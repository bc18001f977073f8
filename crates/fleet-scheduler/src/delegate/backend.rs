//! Backend delegate: one GPU worker's instances and reservations

use crate::RPS_EPSILON;
use fleet_core::{BackendControl, ModelInstanceConfig, ModelSession, NodeId, ProfileOracle};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Resources a backend declares at registration
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSpec {
    /// Address of the backend's control service, host:port
    pub address: String,

    /// GPU device class, e.g. "tesla_v100"
    pub gpu_device: String,

    /// Declared throughput capacity in requests/sec
    pub capacity_rps: f64,

    /// GPU memory in MB; zero means unconstrained
    pub gpu_memory_mb: u64,
}

/// Result of a hypothetical load computed by [`BackendDelegate::prepare_load_model`]
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedLoad {
    /// The instance configuration that would be loaded
    pub config: ModelInstanceConfig,

    /// Fraction of the backend's remaining capacity the load would consume
    pub occupancy: f64,
}

/// The scheduler's record of one backend node
pub struct BackendDelegate {
    node_id: NodeId,
    spec: BackendSpec,
    ctrl: Arc<dyn BackendControl>,
    last_beacon: Instant,
    instances: HashMap<String, ModelInstanceConfig>,
    /// Set when the backend is bound to a static workload slot
    static_slot: Option<usize>,
}

impl BackendDelegate {
    pub fn new(
        node_id: NodeId,
        spec: BackendSpec,
        ctrl: Arc<dyn BackendControl>,
        now: Instant,
    ) -> Self {
        Self {
            node_id,
            spec,
            ctrl,
            last_beacon: now,
            instances: HashMap::new(),
            static_slot: None,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn address(&self) -> &str {
        &self.spec.address
    }

    pub fn gpu_device(&self) -> &str {
        &self.spec.gpu_device
    }

    pub fn capacity_rps(&self) -> f64 {
        self.spec.capacity_rps
    }

    pub fn gpu_memory_mb(&self) -> u64 {
        self.spec.gpu_memory_mb
    }

    /// Shared handle to the backend's control surface
    pub fn ctrl(&self) -> Arc<dyn BackendControl> {
        self.ctrl.clone()
    }

    /// Whether this backend is dedicated to a static workload slot
    pub fn exclusive(&self) -> bool {
        self.static_slot.is_some()
    }

    pub fn static_slot(&self) -> Option<usize> {
        self.static_slot
    }

    /// Bind this backend to a static workload slot, making it exclusive
    pub fn set_static_slot(&mut self, slot: usize) {
        self.static_slot = Some(slot);
    }

    pub fn instances(&self) -> &HashMap<String, ModelInstanceConfig> {
        &self.instances
    }

    /// Total throughput currently reserved on this backend
    pub fn reserved_rps(&self) -> f64 {
        self.instances.values().map(|i| i.reserved_rps).sum()
    }

    /// Declared capacity minus reservations, clamped at zero
    pub fn available_rps(&self) -> f64 {
        (self.spec.capacity_rps - self.reserved_rps()).max(0.0)
    }

    /// GPU memory consumed by loaded instances
    pub fn memory_in_use_mb(&self) -> u64 {
        self.instances.values().map(|i| i.memory_mb).sum()
    }

    /// Throughput reserved for one session, zero if not hosted here
    pub fn throughput(&self, model_session_id: &str) -> f64 {
        self.instances
            .get(model_session_id)
            .map_or(0.0, |i| i.reserved_rps)
    }

    /// All (session, reserved rps) pairs hosted on this backend
    pub fn workload_assignments(&self) -> Vec<(ModelSession, f64)> {
        self.instances
            .values()
            .map(|i| (i.session.clone(), i.reserved_rps))
            .collect()
    }

    /// Compute the configuration that would serve `request_rate` of `session`
    /// on this backend, without mutating anything.
    ///
    /// The reservation is capped by the profile's peak throughput for the
    /// session (counting what is already reserved for it here) and by the
    /// backend's remaining capacity, so a prepared load may cover only part
    /// of the requested rate. Returns `None` when the model has no feasible
    /// profile on this device or nothing can be reserved.
    pub fn prepare_load_model(
        &self,
        oracle: &dyn ProfileOracle,
        session: &ModelSession,
        request_rate: f64,
    ) -> Option<PreparedLoad> {
        if request_rate <= RPS_EPSILON {
            return None;
        }
        let point = oracle.best_config(session, &self.spec.gpu_device)?;
        let available = self.available_rps();
        if available <= RPS_EPSILON {
            return None;
        }

        let session_id = session.id();
        let already_reserved = self.throughput(&session_id);
        let session_headroom = point.peak_rps - already_reserved;
        if session_headroom <= RPS_EPSILON {
            return None;
        }

        // A fresh instance must also fit in GPU memory
        let is_new_instance = !self.instances.contains_key(&session_id);
        if is_new_instance
            && self.spec.gpu_memory_mb > 0
            && self.memory_in_use_mb() + point.memory_mb > self.spec.gpu_memory_mb
        {
            return None;
        }

        let reserve = request_rate.min(available).min(session_headroom);
        if reserve <= RPS_EPSILON {
            return None;
        }

        Some(PreparedLoad {
            occupancy: reserve / available,
            config: ModelInstanceConfig {
                session: session.clone(),
                batch_size: point.batch_size,
                reserved_rps: reserve,
                memory_mb: point.memory_mb,
                latency_sla_ms: session.latency_sla_ms,
            },
        })
    }

    /// Reserve capacity for an instance. Returns true when a new instance was
    /// created, false when an existing instance's reservation was raised.
    pub fn load_model(&mut self, config: ModelInstanceConfig) -> bool {
        let session_id = config.session_id();
        match self.instances.entry(session_id) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                entry.get_mut().reserved_rps += config.reserved_rps;
                false
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(config);
                true
            }
        }
    }

    /// Drop an instance, freeing its reservation
    pub fn unload_model(&mut self, model_session_id: &str) -> Option<ModelInstanceConfig> {
        self.instances.remove(model_session_id)
    }

    /// Re-reserve an instance at a new rate
    pub fn update_model_throughput(
        &mut self,
        model_session_id: &str,
        rps: f64,
    ) -> fleet_core::Result<()> {
        let instance = self.instances.get_mut(model_session_id).ok_or_else(|| {
            fleet_core::Error::not_found(format!(
                "no instance of {} on backend {}",
                model_session_id, self.node_id
            ))
        })?;
        instance.reserved_rps = rps;
        Ok(())
    }

    /// Record a keep-alive from this backend
    pub fn touch(&mut self, now: Instant) {
        self.last_beacon = now;
    }

    pub fn last_beacon(&self) -> Instant {
        self.last_beacon
    }

    /// Whether the backend's beacon is fresher than `timeout`
    pub fn is_alive(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_beacon) <= timeout
    }
}

impl std::fmt::Debug for BackendDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendDelegate")
            .field("node_id", &self.node_id)
            .field("address", &self.spec.address)
            .field("gpu_device", &self.spec.gpu_device)
            .field("capacity_rps", &self.spec.capacity_rps)
            .field("reserved_rps", &self.reserved_rps())
            .field("instances", &self.instances.len())
            .field("static_slot", &self.static_slot)
            .finish()
    }
}
