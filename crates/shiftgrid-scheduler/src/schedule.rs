//! Cron expression normalization and parsing.
//!
//! Rollout specs carry standard 5-field cron expressions
//! (minute hour day-of-month month day-of-week). The `cron` crate wants
//! a seconds field, so 5-field input is normalized by prepending `0`.
//! 6- and 7-field expressions pass through untouched.

use std::str::FromStr;

use cron::Schedule;

use crate::error::{SchedulerError, SchedulerResult};

/// Parse a cron expression, normalizing 5-field input.
pub fn parse_schedule(expr: &str) -> SchedulerResult<Schedule> {
    let normalized = normalize(expr);
    Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidSchedule {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

fn normalize(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}
