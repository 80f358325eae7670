//! Retry timing for failed executions.
//!
//! The backoff curve is linear: `retry_backoff_seconds * attempts`. Linear
//! keeps the next run time auditable straight from the stored columns and
//! satisfies the monotonicity the dispatcher relies on.

use chrono::{DateTime, Duration, Utc};

use super::utils::truncate_text;

/// Ceiling applied to `last_error` and attempt error text.
pub(crate) const LAST_ERROR_MAX_LEN: usize = 500;

/// What to do with a job after a failed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another run at the given time.
    RetryAt(DateTime<Utc>),
    /// Attempts are exhausted; the job is terminally failed.
    GiveUp,
}

/// Computes the next eligible run time after a failure, or signals terminal
/// failure once `attempts` (already incremented for the failed try) reaches
/// `max_attempts`.
pub fn next_retry(
    now: DateTime<Utc>,
    attempts: u32,
    max_attempts: u32,
    retry_backoff_seconds: u32,
) -> RetryDecision {
    if attempts >= max_attempts {
        return RetryDecision::GiveUp;
    }
    let delay = i64::from(retry_backoff_seconds) * i64::from(attempts.max(1));
    RetryDecision::RetryAt(now + Duration::seconds(delay))
}

pub(crate) fn truncate_error(message: &str) -> String {
    truncate_text(message, LAST_ERROR_MAX_LEN)
}
