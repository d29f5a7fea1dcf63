//! Crash detection — roll back when the new workload's pods restart.
//!
//! Detection is a plain existence check: any container restart count
//! above zero on any pod the new workload selects triggers rollback.
//! There is no threshold and no debounce; restarts that predate the
//! shift count too.

use chrono::Utc;
use tracing::{debug, warn};

use shiftgrid_scheduler::StepScheduler;
use shiftgrid_state::{GatewayError, RolloutId, RolloutState, SharedGateway, Workload};

use crate::error::EngineResult;

/// Outcome of one detection pass.
pub(crate) enum Detection {
    /// No restart observed; continue the normal trigger.
    Healthy,
    /// Rollback applied; the trigger ends here.
    RolledBack,
    /// Rollback lost a write race; retry on the next trigger.
    Conflicted,
}

/// Inspect the new workload's pods and roll the shift back if any
/// container has restarted.
pub(crate) async fn detect_and_rollback(
    gateway: &SharedGateway,
    scheduler: &StepScheduler,
    id: &RolloutId,
    new_workload: &Workload,
) -> EngineResult<Detection> {
    let pods = match gateway
        .list_pods(&new_workload.namespace, &new_workload.selector)
        .await
    {
        Ok(pods) => pods,
        Err(e) => {
            // Detection is advisory; the next trigger looks again.
            warn!(%id, error = %e, "failed to list pods, skipping crash detection");
            return Ok(Detection::Healthy);
        }
    };

    let Some(crashed) = pods.iter().find(|p| p.has_restarts()) else {
        return Ok(Detection::Healthy);
    };

    // Re-fetch the freshest copy before the status write; the step
    // timer may have advanced the counter since this trigger began.
    let Some(mut rollout) = gateway.get_rollout(id).await? else {
        debug!(%id, "rollout gone before rollback could be recorded");
        return Ok(Detection::RolledBack);
    };

    rollout.status.current_step = 0;
    rollout.status.state = RolloutState::Stopped;
    rollout.status.message = format!(
        "[{}] rolled back: restart observed on pod {}",
        Utc::now().to_rfc3339(),
        crashed.name
    );

    match gateway.update_rollout_status(&rollout).await {
        Ok(()) => {}
        Err(GatewayError::Conflict(e)) => {
            debug!(%id, error = %e, "rollback status write conflicted");
            return Ok(Detection::Conflicted);
        }
        Err(e) => return Err(e.into()),
    }

    scheduler.disarm(id).await;
    warn!(%id, pod = %crashed.name, "new workload restarted, rollout rolled back");
    Ok(Detection::RolledBack)
}
