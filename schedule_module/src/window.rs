//! Scheduling-window validation gated by subscription tier.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Minimum lead time between "now" and a job's run time.
pub const MIN_LEAD_TIME_SECS: i64 = 30;

/// Subscription tier of the job owner, resolved upstream of this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Creator,
    Studio,
}

impl PlanTier {
    /// Furthest ahead a job may be scheduled on this tier. Zero disables
    /// scheduling entirely.
    pub fn max_schedule_days(&self) -> i64 {
        match self {
            PlanTier::Free => 0,
            PlanTier::Creator => 7,
            PlanTier::Studio => 30,
        }
    }

    /// Lenient parse for upstream-supplied tier strings; unknown values fall
    /// back to the free tier.
    pub fn parse(value: &str) -> PlanTier {
        match value.trim().to_ascii_lowercase().as_str() {
            "creator" => PlanTier::Creator,
            "studio" => PlanTier::Studio,
            _ => PlanTier::Free,
        }
    }
}

/// Why a requested run time was rejected. The message is user-facing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowViolation {
    #[error("scheduled time must be at least 30 seconds in the future")]
    LeadTimeTooShort,
    #[error("the current plan does not include scheduling")]
    SchedulingUnavailable,
    #[error("scheduled time exceeds the {max_days}-day limit for the current plan")]
    HorizonExceeded { max_days: i64 },
}

/// Accepts or rejects a desired run time for the given tier.
pub fn validate_run_at(
    run_at: DateTime<Utc>,
    tier: PlanTier,
    now: DateTime<Utc>,
) -> Result<(), WindowViolation> {
    if run_at < now + Duration::seconds(MIN_LEAD_TIME_SECS) {
        return Err(WindowViolation::LeadTimeTooShort);
    }
    let max_days = tier.max_schedule_days();
    if max_days == 0 {
        return Err(WindowViolation::SchedulingUnavailable);
    }
    if run_at > now + Duration::days(max_days) {
        return Err(WindowViolation::HorizonExceeded { max_days });
    }
    Ok(())
}
