//! Placement: best-fit packing of workloads onto backends

use crate::delegate::PreparedLoad;
use crate::dispatch::Outbox;
use crate::registry::RegistryState;
use crate::RPS_EPSILON;
use fleet_core::{ModelInstanceConfig, ModelSession, NodeId};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, warn};

impl RegistryState {
    /// Find the backend that can serve `request_rate` of `session` with the
    /// tightest fit: the candidate whose remaining capacity the load would
    /// consume in the largest fraction wins, minimizing fragmentation. The
    /// score is the `occupancy` computed by `prepare_load_model`. Candidates
    /// in `skips` and exclusive backends are ignored. Ties go to the lower
    /// node id.
    pub(crate) fn find_best_backend(
        &self,
        session: &ModelSession,
        request_rate: f64,
        skips: &HashSet<NodeId>,
    ) -> Option<(NodeId, ModelInstanceConfig)> {
        let mut candidates: Vec<NodeId> = self.backends.keys().copied().collect();
        candidates.sort();

        let mut best: Option<(NodeId, PreparedLoad)> = None;
        for node_id in candidates {
            if skips.contains(&node_id) {
                continue;
            }
            let backend = &self.backends[&node_id];
            if backend.exclusive() {
                continue;
            }
            let Some(prepared) =
                backend.prepare_load_model(self.oracle.as_ref(), session, request_rate)
            else {
                continue;
            };
            // Strict greater-than keeps the lowest node id on ties
            if best
                .as_ref()
                .map_or(true, |(_, b)| prepared.occupancy > b.occupancy)
            {
                best = Some((node_id, prepared));
            }
        }
        best.map(|(node_id, prepared)| (node_id, prepared.config))
    }

    /// Record a reservation on a backend and mirror it in the model table.
    /// The matching outbound push (load for a new instance, throughput update
    /// for a raised one) goes into the outbox.
    pub(crate) fn apply_load(
        &mut self,
        backend_id: NodeId,
        config: ModelInstanceConfig,
        outbox: &mut Outbox,
    ) {
        let session = config.session.clone();
        let session_id = config.session_id();
        let rps = config.reserved_rps;

        let Some(backend) = self.backends.get_mut(&backend_id) else {
            panic!("placement chose unknown backend {}", backend_id);
        };
        let created = backend.load_model(config.clone());
        let ctrl = backend.ctrl();
        if created {
            debug!(backend = %backend_id, session = %session_id, rps, "loading instance");
            outbox.push_load(backend_id, ctrl, config);
        } else {
            let new_total = backend.throughput(&session_id);
            debug!(backend = %backend_id, session = %session_id, rps = new_total,
                   "raising instance throughput");
            outbox.push_update_throughput(backend_id, ctrl, session_id, new_total);
        }

        let info = self.ensure_model_info(&session);
        *info.backend_rps.entry(backend_id).or_insert(0.0) += rps;
    }

    /// Walk the unassigned workloads in order and place as much as possible.
    /// A single workload may be split across several backends; entries that
    /// find no home keep their residual rate for the next invocation.
    pub(crate) fn allocate_unassigned_workloads(
        &mut self,
        changed_routes: &mut BTreeSet<String>,
        changed_backends: &mut BTreeSet<NodeId>,
        outbox: &mut Outbox,
    ) {
        let pending = std::mem::take(&mut self.unassigned_workloads);
        let mut still_pending = Vec::new();
        let skips = HashSet::new();

        for mut workload in pending {
            while workload.rate > RPS_EPSILON {
                let Some((backend_id, config)) =
                    self.find_best_backend(&workload.session, workload.rate, &skips)
                else {
                    break;
                };
                workload.rate -= config.reserved_rps;
                changed_routes.insert(workload.session.id());
                changed_backends.insert(backend_id);
                self.apply_load(backend_id, config, outbox);
            }
            if workload.rate > RPS_EPSILON {
                debug!(session = %workload.session.id(), rate = workload.rate,
                       "workload still unassigned");
                still_pending.push(workload);
            }
        }
        self.unassigned_workloads = still_pending;
    }

    /// Absorb a newly registered backend: claim the lowest-index unassigned
    /// static slot whose declarations all fit, or soak up pending workloads.
    pub(crate) fn add_backend(&mut self, backend_id: NodeId, outbox: &mut Outbox) {
        let mut changed_routes = BTreeSet::new();

        if self.try_claim_static_slot(backend_id, &mut changed_routes, outbox) {
            self.update_model_routes(&changed_routes, outbox);
            return;
        }

        let mut changed_backends = BTreeSet::new();
        self.allocate_unassigned_workloads(&mut changed_routes, &mut changed_backends, outbox);
        self.update_model_routes(&changed_routes, outbox);
    }

    fn try_claim_static_slot(
        &mut self,
        backend_id: NodeId,
        changed_routes: &mut BTreeSet<String>,
        outbox: &mut Outbox,
    ) -> bool {
        for slot in 0..self.static_workloads.len() {
            if self.assigned_static_slots.contains_key(&slot) {
                continue;
            }
            let Some(configs) = self.plan_static_slot(backend_id, slot) else {
                continue;
            };

            if let Some(backend) = self.backends.get_mut(&backend_id) {
                backend.set_static_slot(slot);
            }
            self.assigned_static_slots.insert(slot, backend_id);
            info!(backend = %backend_id, slot, "backend claimed static workload slot");

            for config in configs {
                let session = config.session.clone();
                changed_routes.insert(config.session_id());
                self.apply_load(backend_id, config, outbox);
                self.ensure_model_info(&session).static_slot = Some(slot);
            }
            return true;
        }
        false
    }

    /// Compute the instance configurations a backend would host for a static
    /// slot, or `None` when any declaration does not fit at its full profile
    /// throughput.
    fn plan_static_slot(&self, backend_id: NodeId, slot: usize) -> Option<Vec<ModelInstanceConfig>> {
        let backend = self.backends.get(&backend_id)?;
        let mut configs: Vec<ModelInstanceConfig> = Vec::new();
        let mut rps_budget = backend.capacity_rps();
        let mut memory_used = 0u64;

        for spec in &self.static_workloads[slot] {
            let session = spec.session();
            let point = self.oracle.best_config(&session, backend.gpu_device())?;
            if point.peak_rps <= RPS_EPSILON || point.peak_rps > rps_budget + RPS_EPSILON {
                return None;
            }
            if backend.gpu_memory_mb() > 0 && memory_used + point.memory_mb > backend.gpu_memory_mb()
            {
                return None;
            }
            rps_budget -= point.peak_rps;
            memory_used += point.memory_mb;

            let batch_size = spec
                .batch_size
                .map_or(point.batch_size, |cap| cap.min(point.batch_size));
            configs.push(ModelInstanceConfig {
                session,
                batch_size,
                reserved_rps: point.peak_rps,
                memory_mb: point.memory_mb,
                latency_sla_ms: spec.latency_sla_ms,
            });
        }
        Some(configs)
    }

    /// Tear down a backend and repair what it was serving: reassign each of
    /// its workloads where capacity allows, park the rest, and free its
    /// static slot if it held one.
    pub(crate) fn remove_backend(&mut self, backend_id: NodeId, outbox: &mut Outbox) {
        let Some(backend) = self.backends.remove(&backend_id) else {
            return;
        };
        let assignments = backend.workload_assignments();
        let mut changed_routes = BTreeSet::new();

        if let Some(slot) = backend.static_slot() {
            // The slot returns to the pool and waits for the next backend
            // that fits; its sessions are not respread onto shared backends.
            self.assigned_static_slots.remove(&slot);
            warn!(backend = %backend_id, slot, "exclusive backend lost, static slot unassigned");
            for (session, _) in &assignments {
                let session_id = session.id();
                if let Some(info) = self.model_table.get_mut(&session_id) {
                    info.backend_rps.remove(&backend_id);
                    info.static_slot = None;
                    changed_routes.insert(session_id);
                }
            }
        } else {
            let skips = HashSet::from([backend_id]);
            for (session, rps) in &assignments {
                let session_id = session.id();
                if let Some(info) = self.model_table.get_mut(&session_id) {
                    info.backend_rps.remove(&backend_id);
                }
                changed_routes.insert(session_id);

                let mut remaining = *rps;
                while remaining > RPS_EPSILON {
                    let Some((winner, config)) =
                        self.find_best_backend(session, remaining, &skips)
                    else {
                        break;
                    };
                    remaining -= config.reserved_rps;
                    self.apply_load(winner, config, outbox);
                }
                if remaining > RPS_EPSILON {
                    warn!(session = %session.id(), rate = remaining,
                          "no capacity to reassign workload from lost backend");
                    self.park_unassigned(session, remaining);
                }
            }
        }

        self.prune_orphaned_sessions(&mut changed_routes);
        self.update_model_routes(&changed_routes, outbox);
    }

    /// Drop a frontend's subscriptions; sessions left with no subscribers and
    /// no static backing are unloaded everywhere and removed.
    pub(crate) fn remove_frontend(&mut self, frontend_id: NodeId, outbox: &mut Outbox) {
        let Some(frontend) = self.frontends.remove(&frontend_id) else {
            return;
        };
        let mut changed_routes = BTreeSet::new();

        let mut subscriptions: Vec<String> = frontend.subscriptions().iter().cloned().collect();
        subscriptions.sort();
        for session_id in subscriptions {
            let delete = match self.model_table.get_mut(&session_id) {
                None => continue,
                Some(info) => {
                    info.subscribers.remove(&frontend_id);
                    info.subscribers.is_empty() && info.static_slot.is_none()
                }
            };
            if delete {
                if let Some(info) = self.model_table.remove(&session_id) {
                    debug!(session = %session_id, "last subscriber gone, unloading session");
                    for &backend_id in info.backend_rps.keys() {
                        if let Some(backend) = self.backends.get_mut(&backend_id) {
                            backend.unload_model(&session_id);
                            outbox.push_unload(backend_id, backend.ctrl(), session_id.clone());
                        }
                    }
                }
                self.unassigned_workloads
                    .retain(|w| w.session.id() != session_id);
            } else {
                changed_routes.insert(session_id);
            }
        }

        self.update_model_routes(&changed_routes, outbox);
    }
}

#[cfg(test)]
mod tests {
    use crate::registry::test_support::*;
    use crate::registry::LoadModelOutcome;
    use fleet_core::traits::MockProfileOracle;
    use fleet_core::{ModelSession, ProfilePoint, WorkloadSpec};
    use std::collections::HashSet;

    // Tightest fit: the backend left with the smallest remaining fraction
    // wins, not the emptiest one.
    #[test]
    fn test_find_best_backend_prefers_tightest_fit() {
        let registry = registry();
        let (b1, _) = add_backend(&registry, 1000.0);
        let (b2, _) = add_backend(&registry, 300.0);

        registry.with_state(|state| {
            let (winner, config) = state
                .find_best_backend(&session(), 200.0, &HashSet::new())
                .unwrap();
            // 200 on b2 leaves 100/300; 200 on b1 leaves 800/1000
            assert_ne!(winner, b1);
            assert_eq!(winner, b2);
            assert_eq!(config.reserved_rps, 200.0);
        });
    }

    #[test]
    fn test_find_best_backend_tie_breaks_on_lower_node_id() {
        let registry = registry();
        let (b1, _) = add_backend(&registry, 500.0);
        let (b2, _) = add_backend(&registry, 500.0);
        assert!(b1 < b2);

        registry.with_state(|state| {
            let (winner, _) = state
                .find_best_backend(&session(), 100.0, &HashSet::new())
                .unwrap();
            assert_eq!(winner, b1);

            // Skipping the winner falls through to the next candidate
            let (winner, _) = state
                .find_best_backend(&session(), 100.0, &HashSet::from([b1]))
                .unwrap();
            assert_eq!(winner, b2);
        });
    }

    #[test]
    fn test_find_best_backend_none_when_infeasible() {
        let registry = registry_with(MockProfileOracle::new(), Vec::new());
        add_backend(&registry, 1000.0);

        registry.with_state(|state| {
            // Oracle knows no profiles, so nothing is feasible
            assert!(state
                .find_best_backend(&session(), 100.0, &HashSet::new())
                .is_none());
        });
    }

    // Boundary: a backend registered with nothing to absorb is a pure
    // reserve.
    #[test]
    fn test_idle_backend_is_pure_reserve() {
        let registry = registry();
        let (b1, _) = add_backend(&registry, 750.0);
        registry.with_state(|state| {
            let backend = &state.backends[&b1];
            assert_eq!(backend.available_rps(), 750.0);
            assert!(backend.instances().is_empty());
            assert!(!backend.exclusive());
        });
        registry.check_invariants();
    }

    // A late-arriving backend absorbs parked workloads.
    #[test]
    fn test_new_backend_absorbs_pending_workloads() {
        let registry = registry();
        let (f1, _) = add_frontend(&registry);
        let (outcome, _, _) = registry.load_model(f1, session(), 400.0).unwrap();
        assert_eq!(outcome, LoadModelOutcome::NotEnoughBackends);

        let (b1, _) = add_backend(&registry, 1000.0);
        registry.with_state(|state| {
            assert!(state.unassigned_workloads.is_empty());
            let info = &state.model_table[&session().id()];
            assert_eq!(info.backend_rps.get(&b1), Some(&400.0));
        });
        registry.check_invariants();
    }

    // Allocation is idempotent when no backends changed in between.
    #[test]
    fn test_allocate_idempotent_without_backend_changes() {
        let registry = registry();
        add_backend(&registry, 100.0);
        let (f1, _) = add_frontend(&registry);
        registry.load_model(f1, session(), 300.0).unwrap();

        let before = registry.with_state(|state| {
            (
                state.unassigned_workloads.len(),
                state.unassigned_workloads[0].rate,
                state.model_table[&session().id()].total_throughput(),
            )
        });

        registry.with_state(|state| {
            let mut changed_routes = std::collections::BTreeSet::new();
            let mut changed_backends = std::collections::BTreeSet::new();
            let mut outbox = crate::dispatch::Outbox::default();
            state.allocate_unassigned_workloads(
                &mut changed_routes,
                &mut changed_backends,
                &mut outbox,
            );
            assert!(changed_routes.is_empty());
            assert!(changed_backends.is_empty());
            assert!(outbox.is_empty());
        });

        let after = registry.with_state(|state| {
            (
                state.unassigned_workloads.len(),
                state.unassigned_workloads[0].rate,
                state.model_table[&session().id()].total_throughput(),
            )
        });
        assert_eq!(before, after);
    }

    // S2 without the clock: losing a backend reassigns its workload.
    #[test]
    fn test_remove_backend_reassigns_workload() {
        let registry = registry();
        let (b1, _) = add_backend(&registry, 1000.0);
        let (f1, _) = add_frontend(&registry);
        registry.load_model(f1, session(), 200.0).unwrap();

        let (b2, _) = add_backend(&registry, 1000.0);
        let outbox = registry.unregister(b1).unwrap();
        assert!(!outbox.is_empty());

        registry.with_state(|state| {
            let info = &state.model_table[&session().id()];
            assert_eq!(info.backend_rps.len(), 1);
            assert_eq!(info.backend_rps.get(&b2), Some(&200.0));
            assert!(state.unassigned_workloads.is_empty());
        });
        registry.check_invariants();
    }

    // Property 3: re-registering an equivalent backend restores the prior
    // assignment set (modulo node id).
    #[test]
    fn test_lost_capacity_restored_by_equivalent_backend() {
        let registry = registry();
        let (b1, _) = add_backend(&registry, 500.0);
        let (f1, _) = add_frontend(&registry);
        registry.load_model(f1, session(), 500.0).unwrap();

        registry.unregister(b1).unwrap();
        registry.with_state(|state| {
            assert_eq!(state.unassigned_workloads.len(), 1);
            assert_eq!(state.unassigned_workloads[0].rate, 500.0);
        });

        let (b2, _) = add_backend(&registry, 500.0);
        registry.with_state(|state| {
            let info = &state.model_table[&session().id()];
            assert_eq!(info.backend_rps.get(&b2), Some(&500.0));
            assert!(state.unassigned_workloads.is_empty());
        });
        registry.check_invariants();
    }

    // Property 4: LoadModel followed by unregistering the only subscriber
    // leaves the model table as it was.
    #[test]
    fn test_unregister_last_subscriber_cleans_up() {
        let registry = registry();
        let (b1, ctrl) = add_backend(&registry, 1000.0);
        let (f1, _) = add_frontend(&registry);
        registry.load_model(f1, session(), 200.0).unwrap();

        let outbox = registry.unregister(f1).unwrap();

        registry.with_state(|state| {
            assert!(state.model_table.is_empty());
            assert!(state.unassigned_workloads.is_empty());
            assert_eq!(state.backends[&b1].instances().len(), 0);
            assert_eq!(state.backends[&b1].available_rps(), 1000.0);
        });
        registry.check_invariants();

        // The unload reaches the backend when the outbox is flushed
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            outbox.flush(std::time::Duration::from_secs(1)).await;
            let calls = ctrl.calls().await;
            assert!(calls.iter().any(|c| matches!(
                c,
                fleet_core::traits::BackendCall::Unload(id) if id == "tf:resnet50:1:50ms"
            )));
        });
    }

    #[test]
    fn test_unregister_subscriber_keeps_shared_session() {
        let registry = registry();
        add_backend(&registry, 1000.0);
        let (f1, _) = add_frontend(&registry);
        let (f2, _) = add_frontend(&registry);
        registry.load_model(f1, session(), 200.0).unwrap();
        registry.load_model(f2, session(), 200.0).unwrap();

        registry.unregister(f1).unwrap();
        registry.with_state(|state| {
            let info = &state.model_table[&session().id()];
            assert_eq!(info.subscribers.len(), 1);
            assert_eq!(info.total_throughput(), 200.0);
        });
        registry.check_invariants();
    }

    fn bert_slot() -> Vec<Vec<WorkloadSpec>> {
        vec![vec![WorkloadSpec {
            framework: "tf".to_string(),
            model_name: "bert".to_string(),
            version: 1,
            latency_sla_ms: 100,
            batch_size: None,
        }]]
    }

    fn slot_oracle() -> MockProfileOracle {
        MockProfileOracle::new()
            .with_default(ProfilePoint {
                batch_size: 8,
                peak_rps: 400.0,
                memory_mb: 0,
            })
            .with_profile(
                "tesla_v100",
                "tf:bert:1",
                ProfilePoint {
                    batch_size: 4,
                    peak_rps: 250.0,
                    memory_mb: 0,
                },
            )
    }

    // S6: the first fitting backend claims the static slot and becomes
    // exclusive; placement skips it afterwards.
    #[test]
    fn test_static_slot_claim_makes_backend_exclusive() {
        let registry = registry_with(slot_oracle(), bert_slot());
        let (b1, _) = add_backend(&registry, 1000.0);

        registry.with_state(|state| {
            let backend = &state.backends[&b1];
            assert!(backend.exclusive());
            assert_eq!(backend.static_slot(), Some(0));
            assert_eq!(backend.throughput("tf:bert:1:100ms"), 250.0);
            assert_eq!(state.assigned_static_slots.get(&0), Some(&b1));
            let info = &state.model_table["tf:bert:1:100ms"];
            assert_eq!(info.static_slot, Some(0));
            assert!(info.subscribers.is_empty());
        });
        registry.check_invariants();

        // A second backend stays shared, and LoadModel must land there
        let (b2, _) = add_backend(&registry, 1000.0);
        let (f1, _) = add_frontend(&registry);
        let (_, route, _) = registry.load_model(f1, session(), 100.0).unwrap();
        assert_eq!(route.backends.len(), 1);
        assert_eq!(route.backends[0].node_id, b2);
        registry.check_invariants();
    }

    #[test]
    fn test_static_slot_skipped_when_it_does_not_fit() {
        // Capacity below the declared model's peak throughput
        let registry = registry_with(slot_oracle(), bert_slot());
        let (b1, _) = add_backend(&registry, 200.0);

        registry.with_state(|state| {
            assert!(!state.backends[&b1].exclusive());
            assert!(state.assigned_static_slots.is_empty());
        });

        // The next backend with enough capacity claims it
        let (b2, _) = add_backend(&registry, 300.0);
        registry.with_state(|state| {
            assert_eq!(state.assigned_static_slots.get(&0), Some(&b2));
        });
        registry.check_invariants();
    }

    #[test]
    fn test_exclusive_backend_loss_frees_slot() {
        let registry = registry_with(slot_oracle(), bert_slot());
        let (b1, _) = add_backend(&registry, 1000.0);
        registry.with_state(|state| {
            assert_eq!(state.assigned_static_slots.get(&0), Some(&b1));
        });

        registry.unregister(b1).unwrap();
        registry.with_state(|state| {
            assert!(state.assigned_static_slots.is_empty());
            // No subscribers, no backing: the declared session is gone
            assert!(state.model_table.is_empty());
        });
        registry.check_invariants();

        // The slot is claimable again
        let (b2, _) = add_backend(&registry, 1000.0);
        registry.with_state(|state| {
            assert_eq!(state.assigned_static_slots.get(&0), Some(&b2));
        });
        registry.check_invariants();
    }

    #[test]
    fn test_workload_split_across_backends() {
        let registry = registry();
        let (b1, _) = add_backend(&registry, 150.0);
        let (b2, _) = add_backend(&registry, 150.0);
        let (f1, _) = add_frontend(&registry);

        let (outcome, route, _) = registry.load_model(f1, session(), 250.0).unwrap();
        assert_eq!(outcome, LoadModelOutcome::Satisfied);
        assert_eq!(route.backends.len(), 2);
        assert_eq!(route.total_rps(), 250.0);

        registry.with_state(|state| {
            let info = &state.model_table[&session().id()];
            // First pass packs b1 tight, the remainder lands on b2
            assert_eq!(info.backend_rps.get(&b1), Some(&150.0));
            assert_eq!(info.backend_rps.get(&b2), Some(&100.0));
        });
        registry.check_invariants();
    }

    #[test]
    fn test_session_with_different_slo_is_distinct() {
        let registry = registry();
        add_backend(&registry, 1000.0);
        let (f1, _) = add_frontend(&registry);

        let strict = ModelSession::new("tf", "resnet50", 1, 10);
        registry.load_model(f1, session(), 100.0).unwrap();
        registry.load_model(f1, strict.clone(), 50.0).unwrap();

        registry.with_state(|state| {
            assert_eq!(state.model_table.len(), 2);
            assert_eq!(state.model_table[&strict.id()].total_throughput(), 50.0);
        });
        registry.check_invariants();
    }
}
