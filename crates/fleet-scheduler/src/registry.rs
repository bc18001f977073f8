//! The registry: global state of the fleet
//!
//! Three tables (frontends, backends, model table) plus the static and
//! pending workload vectors, all guarded by a single mutex. Cross-table
//! invariants make finer locking intractable; every mutation, whether it
//! comes from an RPC handler or a periodic loop, runs to completion under
//! this one lock and hands back an [`Outbox`] of outbound work.

use crate::delegate::{BackendDelegate, BackendSpec, FrontendDelegate};
use crate::dispatch::Outbox;
use crate::RPS_EPSILON;
use fleet_core::{
    BackendControl, FrontendControl, ModelRoute, ModelSession, NodeId, ProfileOracle, WorkloadSpec,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Tunables handed to the registry at startup
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingParams {
    /// Liveness interval; nodes beacon once per interval
    pub beacon_interval: Duration,

    /// Re-planning interval over measured load
    pub epoch_interval: Duration,

    /// Bound on each session's RPS history
    pub history_len: usize,

    /// Grow a session when measured load exceeds budget x (1 + slack)
    pub over_provision_slack: f64,

    /// Shrink a session when measured load falls below budget x (1 - slack)
    pub under_provision_slack: f64,
}

impl SchedulingParams {
    /// Beacon expiry threshold: tolerates one missed beacon, not two
    pub fn beacon_timeout(&self) -> Duration {
        self.beacon_interval.mul_f64(1.5)
    }
}

/// Scheduler-side record of one model session
#[derive(Debug)]
pub struct ModelInfo {
    /// The session this record describes
    pub session: ModelSession,

    /// Throughput assigned per backend, keyed by node id (sorted, so route
    /// snapshots come out deterministic)
    pub backend_rps: BTreeMap<NodeId, f64>,

    /// Frontends subscribed to this session
    pub subscribers: HashSet<NodeId>,

    /// Recent per-epoch aggregate RPS measurements
    pub rps_history: VecDeque<f64>,

    /// Set when the session is declared by a static workload slot
    pub static_slot: Option<usize>,
}

impl ModelInfo {
    fn new(session: ModelSession) -> Self {
        Self {
            session,
            backend_rps: BTreeMap::new(),
            subscribers: HashSet::new(),
            rps_history: VecDeque::new(),
            static_slot: None,
        }
    }

    /// Total throughput assigned across all backends
    pub fn total_throughput(&self) -> f64 {
        self.backend_rps.values().sum()
    }

    /// Append a measurement, truncating the history to `history_len`
    pub fn push_rps(&mut self, rps: f64, history_len: usize) {
        self.rps_history.push_back(rps);
        while self.rps_history.len() > history_len {
            self.rps_history.pop_front();
        }
    }

    /// A session stays in the model table only while it has a subscriber, a
    /// backend instance, or a static slot declaration
    pub fn is_orphaned(&self) -> bool {
        self.subscribers.is_empty() && self.backend_rps.is_empty() && self.static_slot.is_none()
    }
}

/// A (session, rate) pair awaiting backend capacity
#[derive(Debug, Clone)]
pub struct PendingWorkload {
    pub session: ModelSession,
    pub rate: f64,
}

/// Outcome of a LoadModel operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadModelOutcome {
    /// The session's full requested rate is backed
    Satisfied,
    /// Part of the requested rate remains unassigned
    NotEnoughBackends,
}

pub(crate) struct RegistryState {
    pub(crate) oracle: Arc<dyn ProfileOracle>,
    pub(crate) params: SchedulingParams,
    next_node_id: u32,
    pub(crate) frontends: HashMap<NodeId, FrontendDelegate>,
    pub(crate) backends: HashMap<NodeId, BackendDelegate>,
    pub(crate) model_table: HashMap<String, ModelInfo>,
    pub(crate) static_workloads: Vec<Vec<WorkloadSpec>>,
    pub(crate) assigned_static_slots: HashMap<usize, NodeId>,
    pub(crate) unassigned_workloads: Vec<PendingWorkload>,
}

/// The scheduler's registry of frontends, backends, and model sessions
pub struct Registry {
    inner: Mutex<RegistryState>,
    params: SchedulingParams,
}

impl Registry {
    pub fn new(
        oracle: Arc<dyn ProfileOracle>,
        params: SchedulingParams,
        static_workloads: Vec<Vec<WorkloadSpec>>,
    ) -> Self {
        Self {
            inner: Mutex::new(RegistryState {
                oracle,
                params: params.clone(),
                next_node_id: 1,
                frontends: HashMap::new(),
                backends: HashMap::new(),
                model_table: HashMap::new(),
                static_workloads,
                assigned_static_slots: HashMap::new(),
                unassigned_workloads: Vec::new(),
            }),
            params,
        }
    }

    pub fn params(&self) -> &SchedulingParams {
        &self.params
    }

    /// Register a backend: allocate a node id, then either bind it to a
    /// static workload slot or absorb pending workloads onto it.
    pub fn register_backend(
        &self,
        spec: BackendSpec,
        ctrl: Arc<dyn BackendControl>,
    ) -> (NodeId, Outbox) {
        let mut state = self.inner.lock();
        let node_id = state.alloc_node_id();
        let delegate = BackendDelegate::new(node_id, spec, ctrl, Instant::now());
        info!(backend = %node_id, address = delegate.address(), gpu = delegate.gpu_device(),
              capacity_rps = delegate.capacity_rps(), "backend registered");
        state.backends.insert(node_id, delegate);

        let mut outbox = Outbox::default();
        state.add_backend(node_id, &mut outbox);
        state.debug_check_invariants();
        (node_id, outbox)
    }

    /// Register a frontend and allocate its node id
    pub fn register_frontend(&self, address: String, ctrl: Arc<dyn FrontendControl>) -> NodeId {
        let mut state = self.inner.lock();
        let node_id = state.alloc_node_id();
        info!(frontend = %node_id, address = %address, "frontend registered");
        state
            .frontends
            .insert(node_id, FrontendDelegate::new(node_id, address, ctrl, Instant::now()));
        state.debug_check_invariants();
        node_id
    }

    /// Voluntary unregister; beacon expiry converges on the same paths
    pub fn unregister(&self, node_id: NodeId) -> fleet_core::Result<Outbox> {
        let mut state = self.inner.lock();
        let mut outbox = Outbox::default();
        if state.backends.contains_key(&node_id) {
            info!(backend = %node_id, "backend unregistered");
            state.remove_backend(node_id, &mut outbox);
        } else if state.frontends.contains_key(&node_id) {
            info!(frontend = %node_id, "frontend unregistered");
            state.remove_frontend(node_id, &mut outbox);
        } else {
            return Err(fleet_core::Error::UnknownNode(node_id));
        }
        state.debug_check_invariants();
        Ok(outbox)
    }

    /// Subscribe a frontend to a session and make sure the session is backed,
    /// parking the request in the unassigned list when capacity is short.
    pub fn load_model(
        &self,
        frontend_id: NodeId,
        session: ModelSession,
        estimated_rps: f64,
    ) -> fleet_core::Result<(LoadModelOutcome, ModelRoute, Outbox)> {
        let mut state = self.inner.lock();
        let session_id = session.id();

        {
            let frontend = state
                .frontends
                .get_mut(&frontend_id)
                .ok_or(fleet_core::Error::UnknownNode(frontend_id))?;
            frontend.subscribe(session_id.clone());
        }

        let backed = {
            let info = state.ensure_model_info(&session);
            info.subscribers.insert(frontend_id);
            info.total_throughput() > RPS_EPSILON
        };

        let pending = state
            .unassigned_workloads
            .iter()
            .any(|w| w.session.id() == session_id);
        if !backed && !pending && estimated_rps > RPS_EPSILON {
            state.unassigned_workloads.push(PendingWorkload {
                session: session.clone(),
                rate: estimated_rps,
            });
        }

        let mut outbox = Outbox::default();
        let mut changed_routes = BTreeSet::new();
        let mut changed_backends = BTreeSet::new();
        state.allocate_unassigned_workloads(&mut changed_routes, &mut changed_backends, &mut outbox);
        state.update_model_routes(&changed_routes, &mut outbox);

        let route = state.model_route_snapshot(&session_id);
        let outcome = if state
            .unassigned_workloads
            .iter()
            .any(|w| w.session.id() == session_id)
        {
            LoadModelOutcome::NotEnoughBackends
        } else {
            LoadModelOutcome::Satisfied
        };
        state.debug_check_invariants();
        Ok((outcome, route, outbox))
    }

    /// Record per-session RPS measurements reported by a backend.
    ///
    /// Returns true when at least one reported session exists in the model
    /// table; samples for unknown sessions are skipped.
    pub fn update_backend_stats(
        &self,
        backend_id: NodeId,
        samples: &[(String, f64)],
    ) -> fleet_core::Result<bool> {
        let mut state = self.inner.lock();
        if !state.backends.contains_key(&backend_id) {
            return Err(fleet_core::Error::UnknownNode(backend_id));
        }
        let history_len = state.params.history_len;
        let mut any_known = false;
        for (session_id, rps) in samples {
            if let Some(info) = state.model_table.get_mut(session_id) {
                info.push_rps(*rps, history_len);
                any_known = true;
            }
        }
        Ok(any_known)
    }

    /// Refresh the beacon stamp of a node
    pub fn keep_alive(&self, node_id: NodeId, now: Instant) -> fleet_core::Result<()> {
        let mut state = self.inner.lock();
        if let Some(backend) = state.backends.get_mut(&node_id) {
            backend.touch(now);
            return Ok(());
        }
        if let Some(frontend) = state.frontends.get_mut(&node_id) {
            frontend.touch(now);
            return Ok(());
        }
        Err(fleet_core::Error::UnknownNode(node_id))
    }

    /// Expire nodes whose beacon is stale; expiry funnels into the same
    /// cleanup as voluntary unregister.
    pub fn beacon_sweep(&self, now: Instant) -> Outbox {
        let mut state = self.inner.lock();
        let mut outbox = Outbox::default();
        state.beacon_sweep(now, &mut outbox);
        state.debug_check_invariants();
        outbox
    }

    /// Re-plan every session's throughput budget from its measured load
    pub fn epoch_schedule(&self) -> Outbox {
        let mut state = self.inner.lock();
        let mut outbox = Outbox::default();
        state.epoch_schedule(&mut outbox);
        state.debug_check_invariants();
        outbox
    }

    /// Snapshot the current route of a session
    pub fn model_route(&self, session_id: &str) -> Option<ModelRoute> {
        let state = self.inner.lock();
        if state.model_table.contains_key(session_id) {
            Some(state.model_route_snapshot(session_id))
        } else {
            None
        }
    }

    /// Run the full invariant check; panics on violation
    pub fn check_invariants(&self) {
        self.inner.lock().check_invariants();
    }

    /// Inspect the locked state; test-only
    #[cfg(test)]
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut RegistryState) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl RegistryState {
    fn alloc_node_id(&mut self) -> NodeId {
        let id = NodeId::new(self.next_node_id);
        self.next_node_id += 1;
        id
    }

    /// Get or create the model table entry for a session
    pub(crate) fn ensure_model_info(&mut self, session: &ModelSession) -> &mut ModelInfo {
        self.model_table
            .entry(session.id())
            .or_insert_with(|| ModelInfo::new(session.clone()))
    }

    /// Park a workload for the next allocation pass, merging with an existing
    /// entry for the same session
    pub(crate) fn park_unassigned(&mut self, session: &ModelSession, rate: f64) {
        if rate <= RPS_EPSILON {
            return;
        }
        let session_id = session.id();
        if let Some(entry) = self
            .unassigned_workloads
            .iter_mut()
            .find(|w| w.session.id() == session_id)
        {
            entry.rate += rate;
        } else {
            self.unassigned_workloads.push(PendingWorkload {
                session: session.clone(),
                rate,
            });
        }
    }

    /// Drop sessions that no longer satisfy the membership invariant, along
    /// with their pending workloads
    pub(crate) fn prune_orphaned_sessions(&mut self, changed_routes: &mut BTreeSet<String>) {
        let orphaned: Vec<String> = self
            .model_table
            .iter()
            .filter(|(_, info)| info.is_orphaned())
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in orphaned {
            self.model_table.remove(&session_id);
            self.unassigned_workloads
                .retain(|w| w.session.id() != session_id);
            changed_routes.remove(&session_id);
        }
    }

    pub(crate) fn debug_check_invariants(&self) {
        #[cfg(debug_assertions)]
        self.check_invariants();
    }

    /// Verify the cross-table invariants. A violation means the registry is
    /// unsafe to keep running, so this panics.
    pub(crate) fn check_invariants(&self) {
        // 1. Model table membership
        for (session_id, info) in &self.model_table {
            assert!(
                !info.is_orphaned(),
                "invariant violation: session {} has no subscriber, backend, or static slot",
                session_id
            );
            assert_eq!(
                *session_id,
                info.session.id(),
                "invariant violation: model table key does not match session id"
            );
        }
        // Pending workloads always refer to live sessions
        for workload in &self.unassigned_workloads {
            assert!(
                self.model_table.contains_key(&workload.session.id()),
                "invariant violation: pending workload for unknown session {}",
                workload.session.id()
            );
        }

        // 2. Assignments match backend instances, in both directions
        for (session_id, info) in &self.model_table {
            for (backend_id, rps) in &info.backend_rps {
                let backend = self.backends.get(backend_id).unwrap_or_else(|| {
                    panic!(
                        "invariant violation: session {} assigned to unknown backend {}",
                        session_id, backend_id
                    )
                });
                let reserved = backend.throughput(session_id);
                assert!(
                    (reserved - rps).abs() <= RPS_EPSILON,
                    "invariant violation: session {} on backend {}: table says {} rps, instance says {}",
                    session_id,
                    backend_id,
                    rps,
                    reserved
                );
            }
        }
        for (backend_id, backend) in &self.backends {
            for (session_id, instance) in backend.instances() {
                let info = self.model_table.get(session_id).unwrap_or_else(|| {
                    panic!(
                        "invariant violation: backend {} hosts unknown session {}",
                        backend_id, session_id
                    )
                });
                let assigned = info.backend_rps.get(backend_id).copied().unwrap_or(0.0);
                assert!(
                    (assigned - instance.reserved_rps).abs() <= RPS_EPSILON,
                    "invariant violation: backend {} instance {} not mirrored in model table",
                    backend_id,
                    session_id
                );
            }
        }

        // 3. Subscriptions match in both directions
        for (session_id, info) in &self.model_table {
            for frontend_id in &info.subscribers {
                let frontend = self.frontends.get(frontend_id).unwrap_or_else(|| {
                    panic!(
                        "invariant violation: session {} subscribed by unknown frontend {}",
                        session_id, frontend_id
                    )
                });
                assert!(
                    frontend.subscriptions().contains(session_id),
                    "invariant violation: frontend {} does not know it subscribes {}",
                    frontend_id,
                    session_id
                );
            }
        }
        for (frontend_id, frontend) in &self.frontends {
            for session_id in frontend.subscriptions() {
                let info = self.model_table.get(session_id).unwrap_or_else(|| {
                    panic!(
                        "invariant violation: frontend {} subscribes unknown session {}",
                        frontend_id, session_id
                    )
                });
                assert!(
                    info.subscribers.contains(frontend_id),
                    "invariant violation: session {} missing subscriber {}",
                    session_id,
                    frontend_id
                );
            }
        }

        // 4. Capacity is never oversubscribed
        for (backend_id, backend) in &self.backends {
            assert!(
                backend.reserved_rps() <= backend.capacity_rps() + RPS_EPSILON,
                "invariant violation: backend {} oversubscribed: {} reserved of {}",
                backend_id,
                backend.reserved_rps(),
                backend.capacity_rps()
            );
        }

        // 5. Static slots bind to exactly one exclusive backend whose
        // instances match the declarations
        for (slot, backend_id) in &self.assigned_static_slots {
            let backend = self.backends.get(backend_id).unwrap_or_else(|| {
                panic!(
                    "invariant violation: static slot {} assigned to unknown backend {}",
                    slot, backend_id
                )
            });
            assert_eq!(
                backend.static_slot(),
                Some(*slot),
                "invariant violation: backend {} does not hold static slot {}",
                backend_id,
                slot
            );
            let declared: HashSet<String> = self.static_workloads[*slot]
                .iter()
                .map(|spec| spec.session().id())
                .collect();
            let hosted: HashSet<String> = backend.instances().keys().cloned().collect();
            assert_eq!(
                declared, hosted,
                "invariant violation: backend {} instances do not match static slot {}",
                backend_id, slot
            );
        }
        for (backend_id, backend) in &self.backends {
            if let Some(slot) = backend.static_slot() {
                assert_eq!(
                    self.assigned_static_slots.get(&slot),
                    Some(backend_id),
                    "invariant violation: exclusive backend {} not recorded for slot {}",
                    backend_id,
                    slot
                );
            }
        }
    }
}
