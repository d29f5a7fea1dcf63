//! StepScheduler — identity-keyed registry of recurring step timers.
//!
//! Each armed rollout gets one background task that sleeps until the
//! next cron occurrence and then advances the rollout's step counter
//! through the gateway. Re-arming with an unchanged (schedule, old, new)
//! triple is a no-op; any change cancels and recreates the entry.
//! Disarming guarantees no further fire for that identity once the call
//! returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shiftgrid_state::{ANNOTATION_LAST_ADVANCE, RolloutId, SharedGateway};

use crate::error::SchedulerResult;
use crate::schedule::parse_schedule;

/// Per-rollout timer state held in the registry.
struct SchedulerEntry {
    /// The cron expression this entry was armed with.
    schedule: String,
    /// Workload name pair the entry was armed with.
    old_workload: String,
    new_workload: String,
    /// Creation sequence number; unchanged by a deduped re-arm.
    seq: u64,
    /// Shutdown signal for the timer task.
    shutdown_tx: watch::Sender<bool>,
    /// Handle to the timer task.
    handle: JoinHandle<()>,
}

impl SchedulerEntry {
    fn matches(&self, schedule: &str, old: &str, new: &str) -> bool {
        self.schedule == schedule && self.old_workload == old && self.new_workload == new
    }

    /// Stop the timer task and wait for it to finish. A fire that is
    /// already past an await point is cancelled there, so no write from
    /// this entry can land once `cancel` returns.
    async fn cancel(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
        let _ = self.handle.await;
    }
}

/// Manages step timers for all running rollouts.
///
/// At most one live entry exists per rollout identity. The registry map
/// is the only shared mutable state; gateway writes rely on the store's
/// optimistic versioning instead of a lock.
pub struct StepScheduler {
    gateway: SharedGateway,
    /// Active entries: rollout identity → timer slot.
    entries: RwLock<HashMap<RolloutId, SchedulerEntry>>,
    /// Monotonic source for entry sequence numbers.
    next_seq: AtomicU64,
}

impl StepScheduler {
    /// Create a new scheduler with no armed entries.
    pub fn new(gateway: SharedGateway) -> Self {
        Self {
            gateway,
            entries: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Arm (or keep) the step timer for a rollout.
    ///
    /// An existing entry with an identical (schedule, old, new) triple is
    /// left untouched. Any difference cancels the old entry and registers
    /// a new timer bound to the identity only; live data is re-fetched on
    /// each fire.
    pub async fn arm(
        &self,
        id: &RolloutId,
        schedule: &str,
        old_workload: &str,
        new_workload: &str,
    ) -> SchedulerResult<()> {
        let mut entries = self.entries.write().await;

        if let Some(entry) = entries.get(id) {
            if entry.matches(schedule, old_workload, new_workload) {
                return Ok(());
            }
        }

        // Parse before tearing anything down so a bad expression leaves
        // an existing entry running.
        let parsed = parse_schedule(schedule)?;

        if let Some(stale) = entries.remove(id) {
            debug!(%id, "replacing step timer with changed parameters");
            stale.cancel().await;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let gateway = self.gateway.clone();
        let fire_id = id.clone();
        let handle = tokio::spawn(async move {
            run_timer_loop(gateway, fire_id, parsed, shutdown_rx).await;
        });

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            id.clone(),
            SchedulerEntry {
                schedule: schedule.to_string(),
                old_workload: old_workload.to_string(),
                new_workload: new_workload.to_string(),
                seq,
                shutdown_tx,
                handle,
            },
        );
        info!(%id, %schedule, "step timer armed");
        Ok(())
    }

    /// Cancel and remove the entry for a rollout. Safe to call when no
    /// entry exists.
    pub async fn disarm(&self, id: &RolloutId) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.remove(id) {
            entry.cancel().await;
            info!(%id, "step timer disarmed");
        }
    }

    /// Cancel all entries (for graceful shutdown).
    pub async fn shutdown(&self) {
        let mut entries = self.entries.write().await;
        for (id, entry) in entries.drain() {
            entry.cancel().await;
            debug!(%id, "step timer stopped");
        }
        info!("all step timers stopped");
    }

    /// Whether a rollout currently has an armed entry.
    pub async fn is_armed(&self, id: &RolloutId) -> bool {
        self.entries.read().await.contains_key(id)
    }

    /// The creation sequence of a rollout's entry, if armed. A deduped
    /// re-arm leaves the sequence unchanged; a replacement bumps it.
    pub async fn armed_seq(&self, id: &RolloutId) -> Option<u64> {
        self.entries.read().await.get(id).map(|e| e.seq)
    }

    /// Identities with an armed entry.
    pub async fn active_entries(&self) -> Vec<RolloutId> {
        self.entries.read().await.keys().cloned().collect()
    }
}

/// Timer loop for one rollout: sleep until the next cron occurrence,
/// fire, repeat until shut down.
async fn run_timer_loop(
    gateway: SharedGateway,
    id: RolloutId,
    schedule: cron::Schedule,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!(%id, "schedule has no future occurrence, timer exiting");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                advance_step(&gateway, &id).await;
            }
            _ = shutdown.changed() => {
                debug!(%id, "step timer shut down");
                return;
            }
        }
    }
}

/// One timer fire: advance the rollout's step counter if it has room.
///
/// Every failure mode here is a logged skip — a missing rollout, an
/// inconsistent spec, or a write conflict leaves the record for the next
/// fire or the next reconcile. Nothing in this path panics.
pub async fn advance_step(gateway: &SharedGateway, id: &RolloutId) {
    let rollout = match gateway.get_rollout(id).await {
        Ok(Some(rollout)) => rollout,
        Ok(None) => {
            debug!(%id, "rollout gone, skipping fire");
            return;
        }
        Err(e) => {
            warn!(%id, error = %e, "failed to fetch rollout on fire");
            return;
        }
    };

    if rollout.spec.step_capacity == 0 {
        warn!(%id, "step capacity is zero, skipping fire");
        return;
    }
    let max_step = rollout.max_step();
    if rollout.status.current_step >= max_step {
        debug!(%id, step = rollout.status.current_step, "step counter at maximum");
        return;
    }

    let mut advanced = rollout;
    advanced.status.current_step += 1;
    if let Err(e) = gateway.update_rollout_status(&advanced).await {
        // A conflict means the engine or a command won the race; the
        // record is retried on a later fire.
        debug!(%id, error = %e, "step advance not persisted");
        return;
    }

    // Stamp the advance time on the freshest copy; the status write
    // above bumped the version. The stamp is best-effort: a conflict
    // here is not retried, the next fire re-stamps.
    match gateway.get_rollout(id).await {
        Ok(Some(mut fresh)) => {
            fresh
                .meta
                .annotations
                .insert(ANNOTATION_LAST_ADVANCE.to_string(), Utc::now().to_rfc3339());
            if let Err(e) = gateway.update_rollout(&fresh).await {
                warn!(%id, error = %e, "failed to stamp last-advance annotation");
            }
        }
        Ok(None) => debug!(%id, "rollout gone before last-advance stamp"),
        Err(e) => warn!(%id, error = %e, "failed to re-fetch rollout for stamp"),
    }

    info!(%id, step = advanced.status.current_step, "advanced rollout step");
}
