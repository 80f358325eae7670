use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::window::WindowViolation;

/// Job type tag used for publish jobs created through the HTTP API.
pub const PUBLISH_POST_JOB_TYPE: &str = "publish-post";

/// Defaults applied when a creation request leaves retry tuning unset.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_SECONDS: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<JobStatus> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "queued" => Some(JobStatus::Queued),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses never transition automatically again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarser status mirrored onto the linked post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Pending,
    Cancelled,
    Sent,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Pending => "pending",
            PostStatus::Cancelled => "cancelled",
            PostStatus::Sent => "sent",
            PostStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<PostStatus> {
        match value {
            "pending" => Some(PostStatus::Pending),
            "cancelled" => Some(PostStatus::Cancelled),
            "sent" => Some(PostStatus::Sent),
            "failed" => Some(PostStatus::Failed),
            _ => None,
        }
    }
}

/// A durable unit of deferred work.
#[derive(Debug, Clone)]
pub struct ScheduleJob {
    pub id: Uuid,
    pub user_id: String,
    pub scheduled_post_id: Option<Uuid>,
    pub job_type: String,
    pub status: JobStatus,
    pub run_at: DateTime<Utc>,
    pub retry_at: Option<DateTime<Utc>>,
    pub priority: i64,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub retry_backoff_seconds: u32,
    pub last_error: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub payload: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The concrete action data a publish job carries.
#[derive(Debug, Clone)]
pub struct ScheduledPost {
    pub id: Uuid,
    pub user_id: String,
    pub title: String,
    pub caption: String,
    pub target: String,
    pub media_urls: Vec<String>,
    pub nsfw: bool,
    pub spoiler: bool,
    pub status: PostStatus,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable record of one execution try.
#[derive(Debug, Clone)]
pub struct ScheduleJobAttempt {
    pub id: i64,
    pub job_id: Uuid,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// A job loaded together with its linked post and recent attempts.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job: ScheduleJob,
    pub post: Option<ScheduledPost>,
    pub attempts: Vec<ScheduleJobAttempt>,
}

/// A job handed to a worker by a successful claim.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: ScheduleJob,
    pub post: Option<ScheduledPost>,
    pub worker_id: String,
}

/// Creation input, validated and sanitized by the engine before persistence.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub user_id: String,
    pub job_type: String,
    pub run_at: DateTime<Utc>,
    pub priority: i64,
    pub max_attempts: u32,
    pub retry_backoff_seconds: u32,
    pub payload: Value,
    pub post: Option<NewPostRequest>,
}

#[derive(Debug, Clone)]
pub struct NewPostRequest {
    pub title: String,
    pub caption: String,
    pub target: String,
    pub media_urls: Vec<String>,
    pub nsfw: bool,
    pub spoiler: bool,
}

/// User-initiated update applied to an existing job.
#[derive(Debug, Clone)]
pub enum JobAction {
    Cancel { reason: Option<String> },
    Reschedule { run_at: DateTime<Utc> },
    ForceRun,
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("uuid parse error: {0}")]
    UuidParse(#[from] uuid::Error),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    Window(#[from] WindowViolation),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("job {0} not found")]
    NotFound(Uuid),
}
