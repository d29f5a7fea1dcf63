//! One-shot imperative commands.
//!
//! A command rides in on the command annotation and preempts the normal
//! convergence step for that trigger. The status change is persisted
//! first; the marker is then cleared from the freshest copy in a
//! separate write, so a crash in between re-applies an idempotent
//! command instead of losing it.

use tracing::{debug, info};

use shiftgrid_state::{ANNOTATION_COMMAND, Command, Rollout, RolloutState};

use crate::engine::{ConvergenceEngine, Outcome, Write};
use crate::error::EngineResult;

impl ConvergenceEngine {
    pub(crate) async fn apply_command(
        &self,
        mut rollout: Rollout,
        raw: &str,
    ) -> EngineResult<Outcome> {
        let id = rollout.id();

        match Command::parse(raw) {
            Some(Command::Apply) => {
                rollout.status.state = RolloutState::Running;
            }
            Some(Command::Rollback) => {
                rollout.status.current_step = 0;
                rollout.status.state = RolloutState::Stopped;
                self.scheduler.disarm(&id).await;
            }
            Some(Command::Stop) => {
                rollout.status.state = RolloutState::Stopped;
                self.scheduler.disarm(&id).await;
            }
            Some(Command::Completion) => {
                rollout.status.state = RolloutState::Complete;
                rollout.status.current_step = rollout.max_step();
                self.scheduler.disarm(&id).await;
            }
            None => {
                debug!(%id, command = raw, "ignoring unknown command");
            }
        }

        if let Write::Conflict = self
            .classify(self.gateway.update_rollout_status(&rollout).await, &id, "command status")?
        {
            // The marker stays in place; the command re-applies next trigger.
            return Ok(Outcome::requeue());
        }

        // Clear the marker exactly once, on the freshest copy.
        let Some(mut fresh) = self.gateway.get_rollout(&id).await? else {
            return Ok(Outcome::done());
        };
        fresh.meta.annotations.remove(ANNOTATION_COMMAND);
        match self.classify(self.gateway.update_rollout(&fresh).await, &id, "command marker")? {
            Write::Applied => {
                info!(%id, command = raw, "command applied");
                Ok(Outcome::done())
            }
            Write::Conflict => Ok(Outcome::requeue()),
        }
    }
}
