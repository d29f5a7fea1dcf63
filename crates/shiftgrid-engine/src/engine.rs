//! The per-trigger reconcile pipeline.
//!
//! The driver guarantees at-least-once, per-identity-serialized
//! delivery; nothing else. Every step here re-runs from scratch on each
//! trigger, and every status-mutating write happens against the
//! freshest copy of the rollout, because the step timer writes the same
//! record on its own clock.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use shiftgrid_scheduler::StepScheduler;
use shiftgrid_state::{
    ANNOTATION_COMMAND, GatewayError, GatewayResult, Rollout, RolloutId, RolloutState,
    SharedGateway, Workload,
};

use crate::detect::{Detection, detect_and_rollback};
use crate::error::EngineResult;
use crate::sync::sync_capacities;

/// Result of one reconcile pass, handed back to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    /// Whether the driver should deliver another trigger promptly
    /// (a write lost a version race and the pass must re-run).
    pub requeue: bool,
}

impl Outcome {
    pub fn done() -> Self {
        Self { requeue: false }
    }

    pub fn requeue() -> Self {
        Self { requeue: true }
    }
}

/// Classification of a gateway write inside a reconcile pass.
pub(crate) enum Write {
    Applied,
    Conflict,
}

/// Converges one rollout intent onto its two workloads per trigger.
pub struct ConvergenceEngine {
    pub(crate) gateway: SharedGateway,
    pub(crate) scheduler: Arc<StepScheduler>,
}

impl ConvergenceEngine {
    pub fn new(gateway: SharedGateway, scheduler: Arc<StepScheduler>) -> Self {
        Self { gateway, scheduler }
    }

    /// One reconcile pass for the given identity.
    ///
    /// Missing objects are not errors: an absent rollout means deletion
    /// already finished. Version conflicts anywhere in the pass surface
    /// as `Outcome::requeue`, never as `Err`.
    pub async fn reconcile(&self, id: &RolloutId) -> EngineResult<Outcome> {
        let Some(mut rollout) = self.gateway.get_rollout(id).await? else {
            debug!(%id, "rollout absent, nothing to converge");
            return Ok(Outcome::done());
        };

        // The guard finalizer must be durably recorded before any
        // ownership link exists, so cleanup on deletion is always
        // possible. Defer the rest of the pass to the next trigger.
        if rollout.add_finalizer() {
            return match self.classify(
                self.gateway.update_rollout(&rollout).await,
                id,
                "guard finalizer",
            )? {
                Write::Applied => {
                    debug!(%id, "guard finalizer recorded");
                    Ok(Outcome::requeue())
                }
                Write::Conflict => Ok(Outcome::requeue()),
            };
        }

        // Fetch both workloads tolerantly; deletion cleanup must run
        // even when one of them is already gone.
        let old = self
            .gateway
            .get_workload(&id.namespace, &rollout.spec.old_workload)
            .await?;
        let new = self
            .gateway
            .get_workload(&id.namespace, &rollout.spec.new_workload)
            .await?;

        if rollout.marked_for_deletion() {
            return self.finalize_deletion(rollout, old, new).await;
        }

        let (mut old_workload, mut new_workload) = match (old, new) {
            (Some(o), Some(n)) => (o, n),
            (o, n) => {
                return self
                    .enter_missing_workload_error(rollout, o.is_some(), n.is_some())
                    .await;
            }
        };

        // Commands preempt the normal convergence step for this trigger.
        if let Some(raw) = rollout.meta.annotations.get(ANNOTATION_COMMAND).cloned() {
            return self.apply_command(rollout, &raw).await;
        }

        match sync_capacities(&self.gateway, &rollout, &mut old_workload, &mut new_workload).await
        {
            Ok(true) => debug!(%id, "workload capacities updated"),
            Ok(false) => {}
            Err(GatewayError::Conflict(e)) => {
                debug!(%id, error = %e, "capacity sync conflicted, retrying next trigger");
                return Ok(Outcome::requeue());
            }
            Err(e) => return Err(e.into()),
        }

        if rollout.spec.rollback_enabled {
            match detect_and_rollback(&self.gateway, &self.scheduler, id, &new_workload).await? {
                Detection::Healthy => {}
                Detection::RolledBack => return Ok(Outcome::requeue()),
                Detection::Conflicted => return Ok(Outcome::requeue()),
            }
        }

        self.update_status(id, &old_workload, &new_workload).await
    }

    /// Recompute status from the live split and decide whether the step
    /// timer stays armed. Evaluated in priority order on the freshest
    /// copy of the rollout.
    async fn update_status(
        &self,
        id: &RolloutId,
        old_workload: &Workload,
        new_workload: &Workload,
    ) -> EngineResult<Outcome> {
        let Some(mut rollout) = self.gateway.get_rollout(id).await? else {
            return Ok(Outcome::done());
        };

        rollout.status.old_capacity = old_workload.capacity;
        rollout.status.new_capacity = new_workload.capacity;

        let mut disarm = false;
        if rollout.status.new_capacity == rollout.spec.total_capacity
            || rollout.status.state == RolloutState::Complete
        {
            rollout.status.state = RolloutState::Complete;
            rollout.status.message = "rollout complete".to_string();
            disarm = true;
        } else if rollout.status.state == RolloutState::Stopped {
            disarm = true;
        } else if rollout.status.state == RolloutState::Error {
            // Sticky until cleared by a command.
        } else if rollout.status.state == RolloutState::Running {
            rollout.status.message = "rollout running".to_string();
            if let Err(e) = self
                .scheduler
                .arm(
                    id,
                    &rollout.spec.schedule,
                    &rollout.spec.old_workload,
                    &rollout.spec.new_workload,
                )
                .await
            {
                warn!(%id, error = %e, "failed to arm step timer");
            }
        } else {
            rollout.status.state = RolloutState::Stopped;
            rollout.status.message = "pending".to_string();
            disarm = true;
        }

        let requeue = matches!(
            self.classify(
                self.gateway.update_rollout_status(&rollout).await,
                id,
                "status",
            )?,
            Write::Conflict
        );

        if disarm {
            self.scheduler.disarm(id).await;
        }

        Ok(Outcome { requeue })
    }

    /// Terminal-until-user-action failure: a referenced workload is
    /// missing. Capacities are cleared and the step timer disarmed.
    async fn enter_missing_workload_error(
        &self,
        mut rollout: Rollout,
        has_old: bool,
        has_new: bool,
    ) -> EngineResult<Outcome> {
        let id = rollout.id();

        let mut message = String::new();
        if !has_old {
            message.push_str(&format!("old workload {} not found. ", rollout.spec.old_workload));
        }
        if !has_new {
            message.push_str(&format!("new workload {} not found. ", rollout.spec.new_workload));
        }
        let message = message.trim_end().to_string();

        rollout.status.old_capacity = 0;
        rollout.status.new_capacity = 0;
        rollout.status.state = RolloutState::Error;
        rollout.status.message = message.clone();

        let requeue = matches!(
            self.classify(
                self.gateway.update_rollout_status(&rollout).await,
                &id,
                "error status",
            )?,
            Write::Conflict
        );
        self.scheduler.disarm(&id).await;
        warn!(%id, %message, "workload missing, rollout in error state");
        Ok(Outcome { requeue })
    }

    /// Deletion sequence: sever this rollout's ownership link from each
    /// workload that carries it, then drop the guard finalizer so the
    /// store can remove the record. The workloads themselves are never
    /// deleted.
    async fn finalize_deletion(
        &self,
        mut rollout: Rollout,
        old: Option<Workload>,
        new: Option<Workload>,
    ) -> EngineResult<Outcome> {
        let id = rollout.id();

        if !rollout.has_finalizer() {
            return Ok(Outcome::done());
        }

        for workload in [old, new].into_iter().flatten() {
            let mut workload = workload;
            if workload.remove_rollout_link(&id) {
                match self.classify(
                    self.gateway.update_workload(&workload).await,
                    &id,
                    "link removal",
                )? {
                    Write::Applied => {
                        debug!(%id, workload = %workload.name, "ownership link removed")
                    }
                    Write::Conflict => return Ok(Outcome::requeue()),
                }
            }
        }

        if !rollout.remove_finalizer() {
            error!(%id, "guard finalizer missing during deletion cleanup");
            return Ok(Outcome::done());
        }
        match self.classify(self.gateway.update_rollout(&rollout).await, &id, "finalizer")? {
            Write::Applied => {
                info!(%id, "rollout cleanup complete");
                Ok(Outcome::done())
            }
            Write::Conflict => Ok(Outcome::requeue()),
        }
    }

    /// Map a gateway write result: a version conflict is transient (the
    /// next trigger re-runs the pass), anything else propagates.
    pub(crate) fn classify(
        &self,
        result: GatewayResult<()>,
        id: &RolloutId,
        op: &str,
    ) -> EngineResult<Write> {
        match result {
            Ok(()) => Ok(Write::Applied),
            Err(GatewayError::Conflict(e)) => {
                debug!(%id, op, error = %e, "stale write, retrying on next trigger");
                Ok(Write::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use shiftgrid_state::{
        ANNOTATION_LAST_ADVANCE, ObjectMeta, PodObservation, RolloutSpec, RolloutStatus,
        StateStore, StoreGateway, WorkloadGateway,
    };

    struct Harness {
        store: StateStore,
        gateway: SharedGateway,
        scheduler: Arc<StepScheduler>,
        engine: ConvergenceEngine,
    }

    fn harness() -> Harness {
        harness_with(|gw| gw)
    }

    fn harness_with(wrap: impl FnOnce(SharedGateway) -> SharedGateway) -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let gateway = wrap(Arc::new(StoreGateway::new(store.clone())));
        let scheduler = Arc::new(StepScheduler::new(gateway.clone()));
        let engine = ConvergenceEngine::new(gateway.clone(), scheduler.clone());
        Harness {
            store,
            gateway,
            scheduler,
            engine,
        }
    }

    fn seed_rollout(h: &Harness, state: RolloutState, current_step: u32) -> RolloutId {
        seed_rollout_spec(h, state, current_step, 100, 20, true)
    }

    fn seed_rollout_spec(
        h: &Harness,
        state: RolloutState,
        current_step: u32,
        total: u32,
        step: u32,
        rollback_enabled: bool,
    ) -> RolloutId {
        let mut rollout = Rollout {
            namespace: "prod".into(),
            name: "shift-a".into(),
            meta: ObjectMeta::default(),
            spec: RolloutSpec {
                old_workload: "api-v1".into(),
                new_workload: "api-v2".into(),
                total_capacity: total,
                step_capacity: step,
                schedule: "*/5 * * * *".into(),
                rollback_enabled,
            },
            status: RolloutStatus {
                state,
                current_step,
                ..Default::default()
            },
        };
        rollout.add_finalizer();
        h.store.put_rollout(&rollout).unwrap();
        rollout.id()
    }

    fn seed_workload(h: &Harness, name: &str, capacity: u32) {
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), name.to_string());
        h.store
            .put_workload(&Workload {
                namespace: "prod".into(),
                name: name.into(),
                capacity,
                selector,
                owner_links: Vec::new(),
                resource_version: 0,
            })
            .unwrap();
    }

    fn seed_pod(h: &Harness, workload: &str, name: &str, restarts: Vec<u32>) {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), workload.to_string());
        h.store
            .put_pod(&PodObservation {
                namespace: "prod".into(),
                name: name.into(),
                labels,
                restart_counts: restarts,
            })
            .unwrap();
    }

    fn set_command(h: &Harness, id: &RolloutId, command: &str) {
        let mut rollout = h.store.get_rollout(id).unwrap().unwrap();
        rollout
            .meta
            .annotations
            .insert(ANNOTATION_COMMAND.to_string(), command.to_string());
        h.store.put_rollout(&rollout).unwrap();
    }

    #[tokio::test]
    async fn absent_rollout_is_a_successful_noop() {
        let h = harness();
        let outcome = h
            .engine
            .reconcile(&RolloutId::new("prod", "ghost"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::done());
    }

    #[tokio::test]
    async fn first_pass_records_the_guard_finalizer_and_defers() {
        let h = harness();
        let rollout = Rollout {
            namespace: "prod".into(),
            name: "shift-a".into(),
            meta: ObjectMeta::default(),
            spec: RolloutSpec {
                old_workload: "api-v1".into(),
                new_workload: "api-v2".into(),
                total_capacity: 100,
                step_capacity: 20,
                schedule: "*/5 * * * *".into(),
                rollback_enabled: false,
            },
            status: RolloutStatus::default(),
        };
        let id = rollout.id();
        h.store.put_rollout(&rollout).unwrap();
        seed_workload(&h, "api-v1", 100);
        seed_workload(&h, "api-v2", 0);

        let outcome = h.engine.reconcile(&id).await.unwrap();
        assert!(outcome.requeue);

        let stored = h.store.get_rollout(&id).unwrap().unwrap();
        assert!(stored.has_finalizer());
        // Deferred: workloads untouched until the next trigger.
        let old = h.store.get_workload("prod", "api-v1").unwrap().unwrap();
        assert!(old.owner_links.is_empty());
    }

    #[tokio::test]
    async fn running_rollout_converges_capacities_and_arms() {
        let h = harness();
        let id = seed_rollout(&h, RolloutState::Running, 2);
        seed_workload(&h, "api-v1", 100);
        seed_workload(&h, "api-v2", 0);

        let outcome = h.engine.reconcile(&id).await.unwrap();
        assert_eq!(outcome, Outcome::done());

        let old = h.store.get_workload("prod", "api-v1").unwrap().unwrap();
        let new = h.store.get_workload("prod", "api-v2").unwrap().unwrap();
        assert_eq!(old.capacity, 60);
        assert_eq!(new.capacity, 40);
        assert!(old.has_rollout_link(&id));
        assert!(new.has_rollout_link(&id));

        let rollout = h.store.get_rollout(&id).unwrap().unwrap();
        assert_eq!(rollout.status.old_capacity, 60);
        assert_eq!(rollout.status.new_capacity, 40);
        assert_eq!(rollout.status.state, RolloutState::Running);
        assert_eq!(rollout.status.message, "rollout running");
        assert!(h.scheduler.is_armed(&id).await);
    }

    #[tokio::test]
    async fn repeat_pass_with_unchanged_step_writes_no_workloads() {
        let h = harness();
        let id = seed_rollout(&h, RolloutState::Running, 2);
        seed_workload(&h, "api-v1", 100);
        seed_workload(&h, "api-v2", 0);

        h.engine.reconcile(&id).await.unwrap();
        let old_v1 = h.store.get_workload("prod", "api-v1").unwrap().unwrap();
        let new_v1 = h.store.get_workload("prod", "api-v2").unwrap().unwrap();

        h.engine.reconcile(&id).await.unwrap();
        let old_v2 = h.store.get_workload("prod", "api-v1").unwrap().unwrap();
        let new_v2 = h.store.get_workload("prod", "api-v2").unwrap().unwrap();

        assert_eq!(old_v1.resource_version, old_v2.resource_version);
        assert_eq!(new_v1.resource_version, new_v2.resource_version);
    }

    #[tokio::test]
    async fn missing_new_workload_enters_terminal_error() {
        let h = harness();
        let id = seed_rollout(&h, RolloutState::Running, 2);
        seed_workload(&h, "api-v1", 100);
        // api-v2 never created.

        // Pre-arm so the disarm is observable.
        h.scheduler
            .arm(&id, "*/5 * * * *", "api-v1", "api-v2")
            .await
            .unwrap();

        h.engine.reconcile(&id).await.unwrap();

        let rollout = h.store.get_rollout(&id).unwrap().unwrap();
        assert_eq!(rollout.status.state, RolloutState::Error);
        assert_eq!(rollout.status.old_capacity, 0);
        assert_eq!(rollout.status.new_capacity, 0);
        assert!(rollout.status.message.contains("api-v2"));
        assert!(!h.scheduler.is_armed(&id).await);
    }

    #[tokio::test]
    async fn error_state_is_sticky_and_keeps_its_message() {
        let h = harness();
        let id = seed_rollout(&h, RolloutState::Error, 0);
        let mut rollout = h.store.get_rollout(&id).unwrap().unwrap();
        rollout.status.message = "old workload api-v1 not found.".into();
        h.store.put_rollout_status(&rollout).unwrap();
        seed_workload(&h, "api-v1", 100);
        seed_workload(&h, "api-v2", 0);

        h.engine.reconcile(&id).await.unwrap();

        let rollout = h.store.get_rollout(&id).unwrap().unwrap();
        assert_eq!(rollout.status.state, RolloutState::Error);
        assert_eq!(rollout.status.message, "old workload api-v1 not found.");
        assert!(!h.scheduler.is_armed(&id).await);
    }

    #[tokio::test]
    async fn pending_rollout_is_forced_to_stopped() {
        let h = harness();
        let id = seed_rollout(&h, RolloutState::Pending, 0);
        seed_workload(&h, "api-v1", 100);
        seed_workload(&h, "api-v2", 0);

        h.engine.reconcile(&id).await.unwrap();

        let rollout = h.store.get_rollout(&id).unwrap().unwrap();
        assert_eq!(rollout.status.state, RolloutState::Stopped);
        assert_eq!(rollout.status.message, "pending");
        assert!(!h.scheduler.is_armed(&id).await);
    }

    #[tokio::test]
    async fn restart_on_new_workload_rolls_back() {
        let h = harness();
        let id = seed_rollout(&h, RolloutState::Running, 3);
        seed_workload(&h, "api-v1", 40);
        seed_workload(&h, "api-v2", 60);
        seed_pod(&h, "api-v2", "api-v2-abc", vec![0, 1]);

        h.scheduler
            .arm(&id, "*/5 * * * *", "api-v1", "api-v2")
            .await
            .unwrap();

        let outcome = h.engine.reconcile(&id).await.unwrap();
        assert!(outcome.requeue);

        let rollout = h.store.get_rollout(&id).unwrap().unwrap();
        assert_eq!(rollout.status.state, RolloutState::Stopped);
        assert_eq!(rollout.status.current_step, 0);
        assert!(rollout.status.message.contains("rolled back"));
        assert!(!h.scheduler.is_armed(&id).await);
    }

    #[tokio::test]
    async fn restarts_are_ignored_when_rollback_is_disabled() {
        let h = harness();
        let id = seed_rollout_spec(&h, RolloutState::Running, 3, 100, 20, false);
        seed_workload(&h, "api-v1", 40);
        seed_workload(&h, "api-v2", 60);
        seed_pod(&h, "api-v2", "api-v2-abc", vec![2]);

        h.engine.reconcile(&id).await.unwrap();

        let rollout = h.store.get_rollout(&id).unwrap().unwrap();
        assert_eq!(rollout.status.state, RolloutState::Running);
        assert_eq!(rollout.status.current_step, 3);
    }

    #[tokio::test]
    async fn completion_command_jumps_to_the_final_step() {
        let h = harness();
        let id = seed_rollout_spec(&h, RolloutState::Running, 1, 100, 25, false);
        seed_workload(&h, "api-v1", 75);
        seed_workload(&h, "api-v2", 25);
        h.scheduler
            .arm(&id, "*/5 * * * *", "api-v1", "api-v2")
            .await
            .unwrap();
        set_command(&h, &id, "completion");

        h.engine.reconcile(&id).await.unwrap();

        let rollout = h.store.get_rollout(&id).unwrap().unwrap();
        assert_eq!(rollout.status.state, RolloutState::Complete);
        assert_eq!(rollout.status.current_step, 4);
        assert!(!rollout.meta.annotations.contains_key(ANNOTATION_COMMAND));
        assert!(!h.scheduler.is_armed(&id).await);
    }

    #[tokio::test]
    async fn apply_command_starts_the_shift() {
        let h = harness();
        let id = seed_rollout(&h, RolloutState::Stopped, 0);
        seed_workload(&h, "api-v1", 100);
        seed_workload(&h, "api-v2", 0);
        set_command(&h, &id, "apply");

        h.engine.reconcile(&id).await.unwrap();
        let rollout = h.store.get_rollout(&id).unwrap().unwrap();
        assert_eq!(rollout.status.state, RolloutState::Running);
        assert!(!rollout.meta.annotations.contains_key(ANNOTATION_COMMAND));

        // The next trigger runs the normal convergence step and arms.
        h.engine.reconcile(&id).await.unwrap();
        assert!(h.scheduler.is_armed(&id).await);
    }

    #[tokio::test]
    async fn rollback_command_resets_the_step_and_stops() {
        let h = harness();
        let id = seed_rollout(&h, RolloutState::Running, 3);
        seed_workload(&h, "api-v1", 40);
        seed_workload(&h, "api-v2", 60);
        set_command(&h, &id, "rollback");

        h.engine.reconcile(&id).await.unwrap();

        let rollout = h.store.get_rollout(&id).unwrap().unwrap();
        assert_eq!(rollout.status.state, RolloutState::Stopped);
        assert_eq!(rollout.status.current_step, 0);
    }

    #[tokio::test]
    async fn unknown_command_is_consumed_without_effect() {
        let h = harness();
        let id = seed_rollout(&h, RolloutState::Running, 2);
        seed_workload(&h, "api-v1", 60);
        seed_workload(&h, "api-v2", 40);
        set_command(&h, &id, "promote");

        h.engine.reconcile(&id).await.unwrap();

        let rollout = h.store.get_rollout(&id).unwrap().unwrap();
        assert_eq!(rollout.status.state, RolloutState::Running);
        assert_eq!(rollout.status.current_step, 2);
        assert!(!rollout.meta.annotations.contains_key(ANNOTATION_COMMAND));
    }

    #[tokio::test]
    async fn full_shift_completes_and_disarms() {
        let h = harness();
        // Step counter already at the maximum, as after the last timer fire.
        let id = seed_rollout(&h, RolloutState::Running, 5);
        seed_workload(&h, "api-v1", 20);
        seed_workload(&h, "api-v2", 80);
        h.scheduler
            .arm(&id, "*/5 * * * *", "api-v1", "api-v2")
            .await
            .unwrap();

        h.engine.reconcile(&id).await.unwrap();

        let rollout = h.store.get_rollout(&id).unwrap().unwrap();
        assert_eq!(rollout.status.state, RolloutState::Complete);
        assert_eq!(rollout.status.message, "rollout complete");
        assert_eq!(rollout.status.new_capacity, 100);
        assert_eq!(rollout.status.old_capacity, 0);
        assert!(!h.scheduler.is_armed(&id).await);
    }

    #[tokio::test]
    async fn capacity_invariant_holds_across_steps() {
        let h = harness();
        let id = seed_rollout(&h, RolloutState::Running, 0);
        seed_workload(&h, "api-v1", 100);
        seed_workload(&h, "api-v2", 0);

        for step in 0..=5 {
            let mut rollout = h.store.get_rollout(&id).unwrap().unwrap();
            rollout.status.current_step = step;
            rollout.status.state = RolloutState::Running;
            h.store.put_rollout_status(&rollout).unwrap();

            h.engine.reconcile(&id).await.unwrap();

            let rollout = h.store.get_rollout(&id).unwrap().unwrap();
            assert_eq!(
                rollout.status.new_capacity,
                rollout.spec.step_capacity * rollout.status.current_step
            );
            assert_eq!(
                rollout.status.old_capacity,
                rollout.spec.total_capacity - rollout.status.new_capacity
            );
        }
        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn deletion_severs_links_and_removes_the_rollout() {
        let h = harness();
        let id = seed_rollout(&h, RolloutState::Running, 2);
        seed_workload(&h, "api-v1", 100);
        seed_workload(&h, "api-v2", 0);

        // Converge once so both workloads carry the link.
        h.engine.reconcile(&id).await.unwrap();

        let mut rollout = h.store.get_rollout(&id).unwrap().unwrap();
        rollout.meta.deletion_timestamp = Some("2026-08-30T00:00:00Z".into());
        h.store.put_rollout(&rollout).unwrap();

        let outcome = h.engine.reconcile(&id).await.unwrap();
        assert_eq!(outcome, Outcome::done());

        assert!(h.store.get_rollout(&id).unwrap().is_none());
        let old = h.store.get_workload("prod", "api-v1").unwrap().unwrap();
        let new = h.store.get_workload("prod", "api-v2").unwrap().unwrap();
        assert!(!old.has_rollout_link(&id));
        assert!(!new.has_rollout_link(&id));
    }

    #[tokio::test]
    async fn timer_advance_then_reconcile_reaches_complete() {
        let h = harness();
        let id = seed_rollout_spec(&h, RolloutState::Running, 4, 100, 20, false);
        seed_workload(&h, "api-v1", 20);
        seed_workload(&h, "api-v2", 80);

        // One timer fire takes the counter to its maximum.
        shiftgrid_scheduler::advance_step(&h.gateway, &id).await;
        let rollout = h.store.get_rollout(&id).unwrap().unwrap();
        assert_eq!(rollout.status.current_step, 5);
        assert!(rollout.meta.annotations.contains_key(ANNOTATION_LAST_ADVANCE));

        // The next trigger completes and disarms with no further fires.
        h.engine.reconcile(&id).await.unwrap();
        let rollout = h.store.get_rollout(&id).unwrap().unwrap();
        assert_eq!(rollout.status.state, RolloutState::Complete);
        assert!(!h.scheduler.is_armed(&id).await);
    }

    // Gateway wrapper that fails the first status write with a version
    // conflict, as a racing timer fire would.
    struct ConflictOnce {
        inner: SharedGateway,
        tripped: AtomicBool,
    }

    #[async_trait]
    impl WorkloadGateway for ConflictOnce {
        async fn get_rollout(&self, id: &RolloutId) -> shiftgrid_state::GatewayResult<Option<Rollout>> {
            self.inner.get_rollout(id).await
        }

        async fn get_workload(
            &self,
            namespace: &str,
            name: &str,
        ) -> shiftgrid_state::GatewayResult<Option<Workload>> {
            self.inner.get_workload(namespace, name).await
        }

        async fn list_pods(
            &self,
            namespace: &str,
            selector: &BTreeMap<String, String>,
        ) -> shiftgrid_state::GatewayResult<Vec<PodObservation>> {
            self.inner.list_pods(namespace, selector).await
        }

        async fn update_workload(&self, workload: &Workload) -> shiftgrid_state::GatewayResult<()> {
            self.inner.update_workload(workload).await
        }

        async fn update_rollout(&self, rollout: &Rollout) -> shiftgrid_state::GatewayResult<()> {
            self.inner.update_rollout(rollout).await
        }

        async fn update_rollout_status(&self, rollout: &Rollout) -> shiftgrid_state::GatewayResult<()> {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                return Err(GatewayError::Conflict("simulated stale write".into()));
            }
            self.inner.update_rollout_status(rollout).await
        }
    }

    #[tokio::test]
    async fn status_write_conflict_requeues_instead_of_failing() {
        let h = harness_with(|inner| {
            Arc::new(ConflictOnce {
                inner,
                tripped: AtomicBool::new(false),
            }) as SharedGateway
        });
        let id = seed_rollout(&h, RolloutState::Running, 2);
        seed_workload(&h, "api-v1", 100);
        seed_workload(&h, "api-v2", 0);

        let outcome = h.engine.reconcile(&id).await.unwrap();
        assert!(outcome.requeue);

        // The retried trigger converges normally.
        let outcome = h.engine.reconcile(&id).await.unwrap();
        assert_eq!(outcome, Outcome::done());
        let rollout = h.store.get_rollout(&id).unwrap().unwrap();
        assert_eq!(rollout.status.state, RolloutState::Running);
    }
}
