//! The stable external representation of jobs consumed by UI and API
//! layers. Timestamps serialize as ISO-8601, `status` round-trips the closed
//! enum exactly, and attempt history is newest-first and capped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::types::{JobRecord, JobStatus, PostStatus, ScheduleJobAttempt, ScheduledPost};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: Uuid,
    pub job_type: String,
    pub status: JobStatus,
    pub priority: i64,
    pub run_at: DateTime<Utc>,
    pub retry_at: Option<DateTime<Utc>>,
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
    pub scheduled_post: Option<PostView>,
    pub attempt_history: Vec<AttemptView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostView {
    pub id: Uuid,
    pub title: String,
    pub caption: String,
    pub target: String,
    pub scheduled_for: DateTime<Utc>,
    pub status: PostStatus,
    pub nsfw: bool,
    pub spoiler: bool,
    pub media_urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptView {
    pub id: i64,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl JobView {
    pub fn from_record(record: &JobRecord) -> JobView {
        let job = &record.job;
        JobView {
            id: job.id,
            job_type: job.job_type.clone(),
            status: job.status,
            priority: job.priority,
            run_at: job.run_at,
            retry_at: job.retry_at,
            locked_at: job.locked_at,
            locked_by: job.locked_by.clone(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            retry_backoff_seconds: job.retry_backoff_seconds,
            last_error: job.last_error.clone(),
            last_run_at: job.last_run_at,
            payload: job.payload.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            scheduled_post: record.post.as_ref().map(PostView::from_post),
            attempt_history: record.attempts.iter().map(AttemptView::from_attempt).collect(),
        }
    }
}

impl PostView {
    fn from_post(post: &ScheduledPost) -> PostView {
        PostView {
            id: post.id,
            title: post.title.clone(),
            caption: post.caption.clone(),
            target: post.target.clone(),
            scheduled_for: post.scheduled_for,
            status: post.status,
            nsfw: post.nsfw,
            spoiler: post.spoiler,
            media_urls: post.media_urls.clone(),
        }
    }
}

impl AttemptView {
    fn from_attempt(attempt: &ScheduleJobAttempt) -> AttemptView {
        AttemptView {
            id: attempt.id,
            attempt_number: attempt.attempt_number,
            started_at: attempt.started_at,
            finished_at: attempt.finished_at,
            error: attempt.error.clone(),
            result: attempt.result.clone(),
            created_at: attempt.created_at,
        }
    }
}
