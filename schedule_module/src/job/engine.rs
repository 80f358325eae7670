use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration as StdDuration;
use tracing::info;
use uuid::Uuid;

use crate::sanitize::sanitize_payload;
use crate::window::{validate_run_at, PlanTier};

use super::executor::ExecutionError;
use super::retry::{next_retry, truncate_error, RetryDecision};
use super::store::SqliteJobStore;
use super::types::{
    ClaimedJob, CreateJobRequest, JobAction, JobRecord, JobStatus, PostStatus, ScheduleError,
    ScheduleJob, ScheduledPost, PUBLISH_POST_JOB_TYPE,
};

/// Default lease timeout; a worker that goes silent for this long loses its
/// claim to the next dispatcher pass.
pub const DEFAULT_LEASE_TIMEOUT_SECS: u64 = 600;

/// Listing defaults and bounds; callers may ask for fewer, never more.
pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 200;

/// Outcome of reporting an execution result back to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    Succeeded,
    RetryAt(DateTime<Utc>),
    Failed,
    /// The job was cancelled or rescheduled mid-flight; the reported result
    /// was discarded rather than overwriting the newer state.
    Discarded,
}

/// The scheduled-job engine. All coordination between API callers and
/// dispatchers goes through the store this wraps; the engine itself holds no
/// cross-request state.
pub struct JobEngine {
    store: SqliteJobStore,
    lease_timeout: Duration,
}

impl JobEngine {
    pub fn open(
        path: impl Into<PathBuf>,
        lease_timeout: StdDuration,
    ) -> Result<Self, ScheduleError> {
        let store = SqliteJobStore::new(path)?;
        let lease_timeout = Duration::from_std(lease_timeout)
            .map_err(|_| ScheduleError::Validation("lease timeout out of range".to_string()))?;
        Ok(Self {
            store,
            lease_timeout,
        })
    }

    /// Validates, sanitizes, and persists a new job (with its post, when the
    /// job type carries one) in one transaction. The job starts `pending`
    /// with a free lease slot and zero attempts.
    pub fn create_job(
        &self,
        tier: PlanTier,
        request: CreateJobRequest,
    ) -> Result<JobRecord, ScheduleError> {
        let now = Utc::now();
        if request.user_id.trim().is_empty() {
            return Err(ScheduleError::Validation("userId is required".to_string()));
        }
        if request.job_type.trim().is_empty() {
            return Err(ScheduleError::Validation("jobType is required".to_string()));
        }
        if request.max_attempts == 0 {
            return Err(ScheduleError::Validation(
                "maxAttempts must be at least 1".to_string(),
            ));
        }
        if request.retry_backoff_seconds == 0 {
            return Err(ScheduleError::Validation(
                "retryBackoffSeconds must be at least 1".to_string(),
            ));
        }
        if request.job_type == PUBLISH_POST_JOB_TYPE && request.post.is_none() {
            return Err(ScheduleError::Validation(
                "publish-post jobs require a post".to_string(),
            ));
        }
        validate_run_at(request.run_at, tier, now)?;

        let post = match &request.post {
            Some(new_post) => {
                if new_post.title.trim().is_empty() {
                    return Err(ScheduleError::Validation("post title is required".to_string()));
                }
                if new_post.target.trim().is_empty() {
                    return Err(ScheduleError::Validation(
                        "post target is required".to_string(),
                    ));
                }
                Some(ScheduledPost {
                    id: Uuid::new_v4(),
                    user_id: request.user_id.clone(),
                    title: new_post.title.trim().to_string(),
                    caption: new_post.caption.clone(),
                    target: new_post.target.trim().to_string(),
                    media_urls: new_post.media_urls.clone(),
                    nsfw: new_post.nsfw,
                    spoiler: new_post.spoiler,
                    status: PostStatus::Pending,
                    scheduled_for: request.run_at,
                    created_at: now,
                    updated_at: now,
                })
            }
            None => None,
        };

        let job = ScheduleJob {
            id: Uuid::new_v4(),
            user_id: request.user_id.clone(),
            scheduled_post_id: post.as_ref().map(|post| post.id),
            job_type: request.job_type.clone(),
            status: JobStatus::Pending,
            run_at: request.run_at,
            retry_at: None,
            priority: request.priority,
            locked_at: None,
            locked_by: None,
            attempts: 0,
            max_attempts: request.max_attempts,
            retry_backoff_seconds: request.retry_backoff_seconds,
            last_error: None,
            last_run_at: None,
            payload: sanitize_payload(&request.payload),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_job(&job, post.as_ref())?;
        info!(
            "created job {} ({}) for user {} running at {}",
            job.id, job.job_type, job.user_id, job.run_at
        );
        self.load_owned(&request.user_id, job.id)
    }

    pub fn get_job(&self, user_id: &str, job_id: Uuid) -> Result<JobRecord, ScheduleError> {
        self.load_owned(user_id, job_id)
    }

    pub fn list_jobs(
        &self,
        user_id: &str,
        statuses: &[JobStatus],
        limit: usize,
    ) -> Result<Vec<JobRecord>, ScheduleError> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        self.store.list_records(user_id, statuses, limit)
    }

    /// Applies a user-initiated action. Reschedule is re-validated against
    /// the owner's scheduling window; cancel and reschedule are rejected
    /// with a conflict on terminal jobs.
    pub fn apply_action(
        &self,
        user_id: &str,
        job_id: Uuid,
        tier: PlanTier,
        action: JobAction,
    ) -> Result<JobRecord, ScheduleError> {
        let record = self.load_owned(user_id, job_id)?;
        let now = Utc::now();
        match action {
            JobAction::Cancel { reason } => {
                if record.job.status.is_terminal() {
                    return Err(ScheduleError::Conflict(format!(
                        "job is already {}",
                        record.job.status
                    )));
                }
                if !self.store.cancel_job(job_id, now)? {
                    return Err(ScheduleError::Conflict(
                        "job reached a terminal status first".to_string(),
                    ));
                }
                match reason {
                    Some(reason) => info!("job {} cancelled by owner: {}", job_id, reason),
                    None => info!("job {} cancelled by owner", job_id),
                }
            }
            JobAction::Reschedule { run_at } => {
                if record.job.status.is_terminal() {
                    return Err(ScheduleError::Conflict(format!(
                        "job is already {}",
                        record.job.status
                    )));
                }
                validate_run_at(run_at, tier, now)?;
                if !self.store.reschedule_job(job_id, run_at, now)? {
                    return Err(ScheduleError::Conflict(
                        "job reached a terminal status first".to_string(),
                    ));
                }
                info!("job {} rescheduled to {}", job_id, run_at);
            }
            JobAction::ForceRun => {
                self.store.force_run_job(job_id, now)?;
                info!("job {} queued for immediate run", job_id);
            }
        }
        self.load_owned(user_id, job_id)
    }

    /// Claims at most one due job for `worker_id`; `None` means nothing is
    /// claimable right now (or another dispatcher won the race).
    pub fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>, ScheduleError> {
        self.store.claim_due_job(worker_id, now, self.lease_timeout)
    }

    /// Opens the attempt record for a claimed job.
    pub fn start_attempt(
        &self,
        claimed: &ClaimedJob,
        started_at: DateTime<Utc>,
    ) -> Result<i64, ScheduleError> {
        self.store.record_attempt_start(claimed.job.id, started_at)
    }

    /// Closes an attempt record with its error or result payload.
    pub fn finish_attempt(
        &self,
        attempt_id: i64,
        finished_at: DateTime<Utc>,
        error: Option<&str>,
        result: Option<&Value>,
    ) -> Result<(), ScheduleError> {
        self.store
            .finish_attempt(attempt_id, finished_at, error, result)
    }

    pub fn report_success(
        &self,
        claimed: &ClaimedJob,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome, ScheduleError> {
        let attempts = incremented_attempts(&claimed.job);
        let applied = self
            .store
            .complete_job(claimed.job.id, &claimed.worker_id, attempts, now)?;
        if applied {
            Ok(ReportOutcome::Succeeded)
        } else {
            Ok(ReportOutcome::Discarded)
        }
    }

    /// Applies the retry policy to a failed execution. Fatal failures skip
    /// the remaining attempts and go terminal immediately.
    pub fn report_failure(
        &self,
        claimed: &ClaimedJob,
        error: &ExecutionError,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome, ScheduleError> {
        let attempts = incremented_attempts(&claimed.job);
        let message = truncate_error(&error.to_string());
        let decision = match error {
            ExecutionError::Fatal(_) => RetryDecision::GiveUp,
            ExecutionError::Transient(_) => next_retry(
                now,
                attempts,
                claimed.job.max_attempts,
                claimed.job.retry_backoff_seconds,
            ),
        };
        match decision {
            RetryDecision::RetryAt(retry_at) => {
                let applied = self.store.retry_job(
                    claimed.job.id,
                    &claimed.worker_id,
                    attempts,
                    retry_at,
                    &message,
                    now,
                )?;
                if applied {
                    Ok(ReportOutcome::RetryAt(retry_at))
                } else {
                    Ok(ReportOutcome::Discarded)
                }
            }
            RetryDecision::GiveUp => {
                let applied = self.store.fail_job(
                    claimed.job.id,
                    &claimed.worker_id,
                    attempts,
                    &message,
                    now,
                )?;
                if applied {
                    Ok(ReportOutcome::Failed)
                } else {
                    Ok(ReportOutcome::Discarded)
                }
            }
        }
    }

    fn load_owned(&self, user_id: &str, job_id: Uuid) -> Result<JobRecord, ScheduleError> {
        match self.store.load_record(job_id)? {
            Some(record) if record.job.user_id == user_id => Ok(record),
            // Foreign-owned jobs are indistinguishable from missing ones.
            _ => Err(ScheduleError::NotFound(job_id)),
        }
    }
}

/// Attempts are clamped at `max_attempts` so a force-run of an exhausted job
/// cannot push the counter past its ceiling.
fn incremented_attempts(job: &ScheduleJob) -> u32 {
    (job.attempts + 1).min(job.max_attempts)
}
