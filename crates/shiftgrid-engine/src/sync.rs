//! Capacity sync — converge both workloads onto the current step's split.
//!
//! The targets are a pure function of the rollout's step counter, so the
//! two writes need no cross-object transaction: a crash between them
//! leaves a split that self-heals on the next trigger.

use tracing::debug;

use shiftgrid_state::{GatewayResult, Rollout, SharedGateway, Workload, capacity_split};

/// Bring both workloads to their target capacities and make sure each
/// carries this rollout's ownership link. Returns whether any write
/// happened; a repeat call with an unchanged step counter writes nothing.
pub(crate) async fn sync_capacities(
    gateway: &SharedGateway,
    rollout: &Rollout,
    old_workload: &mut Workload,
    new_workload: &mut Workload,
) -> GatewayResult<bool> {
    let id = rollout.id();
    let (old_target, new_target) = capacity_split(
        rollout.spec.total_capacity,
        rollout.spec.step_capacity,
        rollout.status.current_step,
    );

    let mut updated = false;
    for (workload, target) in [(&mut *old_workload, old_target), (&mut *new_workload, new_target)] {
        let mut changed = workload.add_rollout_link(&id);
        if workload.capacity != target {
            workload.capacity = target;
            changed = true;
        }
        if changed {
            gateway.update_workload(workload).await?;
            debug!(%id, workload = %workload.name, capacity = target, "workload synced");
            updated = true;
        }
    }

    Ok(updated)
}
