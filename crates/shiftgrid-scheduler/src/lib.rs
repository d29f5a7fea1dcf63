//! ShiftGrid step scheduler — cron-armed rollout step advancement.
//!
//! Maintains one recurring timer per active rollout, keyed by identity.
//! Each fire re-fetches the rollout through the gateway and, when the
//! step counter has room, bumps it by one. Firing is fully decoupled
//! from the convergence engine's trigger cycle; the timer is the only
//! path that advances the step during normal operation.
//!
//! # Components
//!
//! - **`schedule`** — 5-field cron normalization and parsing
//! - **`scheduler`** — the identity-keyed timer registry

pub mod error;
pub mod schedule;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use schedule::parse_schedule;
pub use scheduler::{StepScheduler, advance_step};
