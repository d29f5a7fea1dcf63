//! Step scheduler error types.

use thiserror::Error;

/// Result type alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur when arming a schedule.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidSchedule { expr: String, reason: String },
}
