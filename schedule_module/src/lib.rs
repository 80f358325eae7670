pub mod sanitize;
pub mod window;

mod job;

pub mod service;

pub use job::{
    AttemptView, ClaimedJob, CreateJobRequest, Dispatcher, ExecutionError, JobAction, JobEngine,
    JobExecutor, JobRecord, JobStatus, JobView, NewPostRequest, NoopExecutor, PostStatus, PostView,
    ReportOutcome, ScheduleError, ScheduleJob, ScheduleJobAttempt, ScheduledPost,
    DEFAULT_LEASE_TIMEOUT_SECS, DEFAULT_LIST_LIMIT, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_RETRY_BACKOFF_SECONDS, MAX_LIST_LIMIT, PUBLISH_POST_JOB_TYPE,
};
