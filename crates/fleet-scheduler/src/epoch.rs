//! Beacon sweep and epoch rescheduling
//!
//! The beacon sweep expires nodes whose keep-alive is stale; expiry funnels
//! into the same cleanup as voluntary unregister. The epoch pass re-plans
//! every session's throughput budget from its measured load: sessions whose
//! recent peak exceeds their budget grow, sessions well below it shrink,
//! smallest assignment first.

use crate::dispatch::Outbox;
use crate::registry::RegistryState;
use crate::RPS_EPSILON;
use fleet_core::NodeId;
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, warn};

impl RegistryState {
    /// Expire backends and frontends whose last beacon is older than
    /// 1.5 x beacon_interval.
    pub(crate) fn beacon_sweep(&mut self, now: Instant, outbox: &mut Outbox) {
        let timeout = self.params.beacon_timeout();

        let mut expired_backends: Vec<NodeId> = self
            .backends
            .iter()
            .filter(|(_, b)| !b.is_alive(now, timeout))
            .map(|(&id, _)| id)
            .collect();
        expired_backends.sort();

        let mut expired_frontends: Vec<NodeId> = self
            .frontends
            .iter()
            .filter(|(_, f)| !f.is_alive(now, timeout))
            .map(|(&id, _)| id)
            .collect();
        expired_frontends.sort();

        for node_id in expired_backends {
            warn!(backend = %node_id, "backend beacon expired, removing");
            self.remove_backend(node_id, outbox);
        }
        for node_id in expired_frontends {
            warn!(frontend = %node_id, "frontend beacon expired, removing");
            self.remove_frontend(node_id, outbox);
        }
    }

    /// Re-plan throughput budgets from measured load, then run one
    /// allocation pass and repush every touched route.
    pub(crate) fn epoch_schedule(&mut self, outbox: &mut Outbox) {
        let over = 1.0 + self.params.over_provision_slack;
        let under = 1.0 - self.params.under_provision_slack;
        let mut changed_routes = BTreeSet::new();

        let mut session_ids: Vec<String> = self.model_table.keys().cloned().collect();
        session_ids.sort();

        for session_id in session_ids {
            let (session, measured, total) = {
                let info = &self.model_table[&session_id];
                // Static reservations belong to the slot, not to measured load
                if info.static_slot.is_some() {
                    continue;
                }
                let total = info.total_throughput();
                // Track the recent peak, not the average: budgets must cover
                // the worst window the session has seen lately
                let measured = if info.rps_history.is_empty() {
                    total
                } else {
                    info.rps_history.iter().copied().fold(0.0_f64, f64::max)
                };
                (info.session.clone(), measured, total)
            };

            if measured > total * over + RPS_EPSILON {
                debug!(session = %session_id, measured, budget = total, "session demand grew");
                self.park_deficit(&session, measured - total);
            } else if measured < total * under - RPS_EPSILON {
                debug!(session = %session_id, measured, budget = total, "session demand shrank");
                self.shrink_session(&session_id, measured, outbox);
                changed_routes.insert(session_id);
            }
        }

        let mut changed_backends = BTreeSet::new();
        self.allocate_unassigned_workloads(&mut changed_routes, &mut changed_backends, outbox);
        self.update_model_routes(&changed_routes, outbox);
        self.log_model_table();
    }

    /// Park a grow deficit, replacing any entry left over from an earlier
    /// epoch so the pending rate tracks current demand instead of stacking.
    fn park_deficit(&mut self, session: &fleet_core::ModelSession, deficit: f64) {
        if deficit <= RPS_EPSILON {
            return;
        }
        let session_id = session.id();
        if let Some(entry) = self
            .unassigned_workloads
            .iter_mut()
            .find(|w| w.session.id() == session_id)
        {
            entry.rate = deficit;
        } else {
            self.unassigned_workloads.push(crate::registry::PendingWorkload {
                session: session.clone(),
                rate: deficit,
            });
        }
    }

    /// Reduce a session's assignments down to `target`, unloading whole
    /// instances smallest-first and trimming the last one in place.
    fn shrink_session(&mut self, session_id: &str, target: f64, outbox: &mut Outbox) {
        loop {
            let decision = {
                let Some(info) = self.model_table.get(session_id) else {
                    return;
                };
                let excess = info.total_throughput() - target;
                if excess <= RPS_EPSILON {
                    return;
                }
                info.backend_rps
                    .iter()
                    .min_by(|a, b| {
                        a.1.partial_cmp(b.1)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.0.cmp(b.0))
                    })
                    .map(|(&backend_id, &rps)| (backend_id, rps, excess))
            };
            let Some((backend_id, rps, excess)) = decision else {
                return;
            };

            if rps <= excess + RPS_EPSILON {
                // The whole instance fits in the excess: unload it
                if let Some(info) = self.model_table.get_mut(session_id) {
                    info.backend_rps.remove(&backend_id);
                }
                if let Some(backend) = self.backends.get_mut(&backend_id) {
                    backend.unload_model(session_id);
                    outbox.push_unload(backend_id, backend.ctrl(), session_id.to_string());
                }
            } else {
                let new_rps = rps - excess;
                if let Some(info) = self.model_table.get_mut(session_id) {
                    info.backend_rps.insert(backend_id, new_rps);
                }
                if let Some(backend) = self.backends.get_mut(&backend_id) {
                    if backend.update_model_throughput(session_id, new_rps).is_ok() {
                        outbox.push_update_throughput(
                            backend_id,
                            backend.ctrl(),
                            session_id.to_string(),
                            new_rps,
                        );
                    }
                }
            }
        }
    }

    /// Debug dump of the model table, logged after every epoch pass
    fn log_model_table(&self) {
        let mut session_ids: Vec<&String> = self.model_table.keys().collect();
        session_ids.sort();
        for session_id in session_ids {
            let info = &self.model_table[session_id];
            debug!(
                session = %session_id,
                total_rps = info.total_throughput(),
                backends = info.backend_rps.len(),
                subscribers = info.subscribers.len(),
                "model table"
            );
        }
        if !self.unassigned_workloads.is_empty() {
            debug!(
                pending = self.unassigned_workloads.len(),
                "unassigned workloads"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::registry::test_support::*;
    use fleet_core::traits::BackendCall;
    use std::time::{Duration, Instant};

    // S2: a dead backend is expired by the beacon sweep and its workload
    // moves to the survivor, which the subscriber hears about.
    #[tokio::test]
    async fn test_beacon_expiry_reassigns_workload() {
        let registry = registry();
        let (b1, _) = add_backend(&registry, 1000.0);
        let (f1, fctrl) = add_frontend(&registry);
        registry.load_model(f1, session(), 200.0).unwrap();
        let (b2, _) = add_backend(&registry, 1000.0);

        // Only b2 and f1 stay fresh past the timeout
        let later = Instant::now() + Duration::from_secs(60);
        registry.keep_alive(b2, later).unwrap();
        registry.keep_alive(f1, later).unwrap();

        let outbox = registry.beacon_sweep(later);
        outbox.flush(Duration::from_secs(1)).await;

        registry.with_state(|state| {
            assert!(!state.backends.contains_key(&b1));
            let info = &state.model_table[&session().id()];
            assert_eq!(info.backend_rps.get(&b2), Some(&200.0));
        });
        registry.check_invariants();

        let route = fctrl.last_route().await.unwrap();
        assert_eq!(route.backends.len(), 1);
        assert_eq!(route.backends[0].node_id, b2);
        assert_eq!(route.backends[0].rps, 200.0);
    }

    #[test]
    fn test_beacon_sweep_expires_frontends() {
        let registry = registry();
        let (b1, _) = add_backend(&registry, 1000.0);
        let (f1, _) = add_frontend(&registry);
        registry.load_model(f1, session(), 200.0).unwrap();

        let later = Instant::now() + Duration::from_secs(60);
        registry.keep_alive(b1, later).unwrap();
        registry.beacon_sweep(later);

        registry.with_state(|state| {
            assert!(!state.frontends.contains_key(&f1));
            // Last subscriber gone: session unloaded and dropped
            assert!(state.model_table.is_empty());
            assert_eq!(state.backends[&b1].available_rps(), 1000.0);
        });
        registry.check_invariants();
    }

    #[test]
    fn test_beacon_sweep_keeps_fresh_nodes() {
        let registry = registry();
        let (b1, _) = add_backend(&registry, 1000.0);
        let (f1, _) = add_frontend(&registry);

        // Within 1.5 x beacon_interval (7.5s) nothing expires
        let soon = Instant::now() + Duration::from_secs(6);
        let outbox = registry.beacon_sweep(soon);
        assert!(outbox.is_empty());
        registry.with_state(|state| {
            assert!(state.backends.contains_key(&b1));
            assert!(state.frontends.contains_key(&f1));
        });
    }

    // S4: measured demand above budget x 1.1 grows the session onto spare
    // capacity.
    #[tokio::test]
    async fn test_epoch_grow_allocates_deficit() {
        let registry = registry();
        let (b1, _) = add_backend(&registry, 100.0);
        let (f1, fctrl) = add_frontend(&registry);
        registry.load_model(f1, session(), 100.0).unwrap();
        let (b2, _) = add_backend(&registry, 1000.0);

        for rps in [180.0, 190.0, 200.0] {
            registry
                .update_backend_stats(b1, &[(session().id(), rps)])
                .unwrap();
        }

        let outbox = registry.epoch_schedule();
        outbox.flush(Duration::from_secs(1)).await;

        registry.with_state(|state| {
            let info = &state.model_table[&session().id()];
            // measured 200 > 100 x 1.1: the 100 rps deficit lands on b2
            assert_eq!(info.total_throughput(), 200.0);
            assert_eq!(info.backend_rps.get(&b1), Some(&100.0));
            assert_eq!(info.backend_rps.get(&b2), Some(&100.0));
            assert!(state.unassigned_workloads.is_empty());
        });
        registry.check_invariants();

        let route = fctrl.last_route().await.unwrap();
        assert_eq!(route.total_rps(), 200.0);
        assert_eq!(route.backends.len(), 2);
    }

    // S5: shrink unloads smallest-first, then trims the survivor.
    #[tokio::test]
    async fn test_epoch_shrink_smallest_first() {
        let registry = registry();
        let (b1, ctrl1) = add_backend(&registry, 200.0);
        let (b2, ctrl2) = add_backend(&registry, 200.0);
        let (f1, _) = add_frontend(&registry);
        // 400 rps splits 200/200 across both backends
        registry.load_model(f1, session(), 400.0).unwrap();

        for rps in [50.0, 60.0, 55.0] {
            registry
                .update_backend_stats(b1, &[(session().id(), rps)])
                .unwrap();
        }

        let outbox = registry.epoch_schedule();
        outbox.flush(Duration::from_secs(1)).await;

        registry.with_state(|state| {
            let info = &state.model_table[&session().id()];
            // Shrink target is the recent peak, 60. The tied-smallest b1 is
            // unloaded entirely, then the survivor b2 is trimmed to 60.
            assert_eq!(info.total_throughput(), 60.0);
            assert_eq!(info.backend_rps.len(), 1);
            assert_eq!(info.backend_rps.get(&b2), Some(&60.0));
        });
        registry.check_invariants();

        let calls1 = ctrl1.calls().await;
        assert!(calls1
            .iter()
            .any(|c| matches!(c, BackendCall::Unload(id) if id == &session().id())));
        let calls2 = ctrl2.calls().await;
        assert!(calls2
            .iter()
            .any(|c| matches!(c, BackendCall::UpdateThroughput(id, rps)
                if id == &session().id() && *rps == 60.0)));
    }

    // Boundary: shrink to zero empties the assignment but keeps the session
    // while it has a subscriber.
    #[test]
    fn test_epoch_shrink_to_zero_keeps_subscribed_session() {
        let registry = registry();
        let (b1, _) = add_backend(&registry, 500.0);
        let (f1, _) = add_frontend(&registry);
        registry.load_model(f1, session(), 300.0).unwrap();

        registry
            .update_backend_stats(b1, &[(session().id(), 0.0)])
            .unwrap();
        registry.epoch_schedule();

        registry.with_state(|state| {
            let info = &state.model_table[&session().id()];
            assert!(info.backend_rps.is_empty());
            assert_eq!(info.subscribers.len(), 1);
            assert_eq!(state.backends[&b1].available_rps(), 500.0);
        });
        registry.check_invariants();
    }

    #[test]
    fn test_epoch_within_slack_leaves_session_alone() {
        let registry = registry();
        let (b1, _) = add_backend(&registry, 500.0);
        let (f1, _) = add_frontend(&registry);
        registry.load_model(f1, session(), 100.0).unwrap();

        // 105 is inside [90, 110]: neither grow nor shrink
        registry
            .update_backend_stats(b1, &[(session().id(), 105.0)])
            .unwrap();
        let outbox = registry.epoch_schedule();
        assert!(outbox.is_empty());

        registry.with_state(|state| {
            let info = &state.model_table[&session().id()];
            assert_eq!(info.total_throughput(), 100.0);
        });
    }

    #[test]
    fn test_epoch_empty_history_is_noop() {
        let registry = registry();
        add_backend(&registry, 500.0);
        let (f1, _) = add_frontend(&registry);
        registry.load_model(f1, session(), 100.0).unwrap();

        // No stats reported: measured defaults to the current budget
        let outbox = registry.epoch_schedule();
        assert!(outbox.is_empty());
        registry.with_state(|state| {
            assert_eq!(
                state.model_table[&session().id()].total_throughput(),
                100.0
            );
        });
    }

    #[test]
    fn test_epoch_grow_replaces_stale_pending_entry() {
        let registry = registry();
        let (b1, _) = add_backend(&registry, 100.0);
        let (f1, _) = add_frontend(&registry);
        registry.load_model(f1, session(), 100.0).unwrap();

        registry
            .update_backend_stats(b1, &[(session().id(), 200.0)])
            .unwrap();

        // No spare capacity: the deficit parks. Two epochs must not stack
        // two entries.
        registry.epoch_schedule();
        registry.epoch_schedule();

        registry.with_state(|state| {
            assert_eq!(state.unassigned_workloads.len(), 1);
            assert_eq!(state.unassigned_workloads[0].rate, 100.0);
        });
        registry.check_invariants();
    }
}
