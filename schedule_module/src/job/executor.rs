use serde_json::Value;
use tracing::info;

use super::types::{ScheduleJob, ScheduledPost};

/// How an execution failed. Transient failures are retried until attempts
/// run out; fatal failures move the job straight to `failed`.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("fatal failure: {0}")]
    Fatal(String),
}

/// Seam to the external platform. The engine never performs the publish side
/// effect itself; an executor does, outside any store transaction, and
/// reports the outcome back through the dispatcher.
pub trait JobExecutor: Send + Sync {
    /// Runs the job's side effect. The returned value is stored as the
    /// attempt's result payload.
    fn execute(
        &self,
        job: &ScheduleJob,
        post: Option<&ScheduledPost>,
    ) -> Result<Value, ExecutionError>;
}

/// Stand-in executor that logs and succeeds. Used by tests and by the
/// service until a platform publisher is wired in.
#[derive(Debug, Default, Clone)]
pub struct NoopExecutor;

impl JobExecutor for NoopExecutor {
    fn execute(
        &self,
        job: &ScheduleJob,
        post: Option<&ScheduledPost>,
    ) -> Result<Value, ExecutionError> {
        if let Some(post) = post {
            info!(
                "noop executor: would publish post {} to {} for job {}",
                post.id, post.target, job.id
            );
        } else {
            info!("noop executor: job {} has no post attached", job.id);
        }
        Ok(Value::Object(serde_json::Map::new()))
    }
}
