mod dispatcher;
mod engine;
mod executor;
mod retry;
mod store;
mod types;
mod utils;
mod view;

pub use dispatcher::Dispatcher;
pub use engine::{
    JobEngine, ReportOutcome, DEFAULT_LEASE_TIMEOUT_SECS, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT,
};
pub use executor::{ExecutionError, JobExecutor, NoopExecutor};
pub use retry::{next_retry, RetryDecision};
pub use types::{
    ClaimedJob, CreateJobRequest, JobAction, JobRecord, JobStatus, NewPostRequest, PostStatus,
    ScheduleError, ScheduleJob, ScheduleJobAttempt, ScheduledPost, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_RETRY_BACKOFF_SECONDS, PUBLISH_POST_JOB_TYPE,
};
pub use view::{AttemptView, JobView, PostView};

#[cfg(test)]
mod tests;
