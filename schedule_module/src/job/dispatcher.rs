use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::engine::{JobEngine, ReportOutcome};
use super::executor::JobExecutor;
use super::types::{ClaimedJob, ScheduleError};

/// Polls the store for due jobs and runs them through an executor. Multiple
/// dispatchers may run concurrently (threads or processes); they coordinate
/// only through the store's claim operation.
pub struct Dispatcher<E: JobExecutor> {
    engine: Arc<JobEngine>,
    executor: E,
    worker_id: String,
}

impl<E: JobExecutor> Dispatcher<E> {
    pub fn new(engine: Arc<JobEngine>, executor: E, worker_id: impl Into<String>) -> Self {
        Self {
            engine,
            executor,
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claims and executes due jobs until the store has nothing claimable,
    /// then sleeps `poll_interval`. Store errors are logged and retried on
    /// the next pass rather than killing the worker.
    pub fn run_loop(&self, poll_interval: Duration, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            match self.drain_due() {
                Ok(count) if count > 0 => {
                    info!("worker {} executed {} job(s)", self.worker_id, count);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("worker {} dispatch pass failed: {}", self.worker_id, err);
                }
            }
            std::thread::sleep(poll_interval);
        }
    }

    /// Runs every currently claimable job once. Returns how many were
    /// executed.
    pub fn drain_due(&self) -> Result<usize, ScheduleError> {
        let mut executed = 0usize;
        while let Some(claimed) = self.engine.claim_next(&self.worker_id, Utc::now())? {
            self.run_claimed(claimed)?;
            executed += 1;
        }
        Ok(executed)
    }

    fn run_claimed(&self, claimed: ClaimedJob) -> Result<(), ScheduleError> {
        let job_id = claimed.job.id;
        let attempt_id = self.engine.start_attempt(&claimed, Utc::now())?;
        // The side effect runs outside any store transaction; the lease is
        // what prevents a second worker from executing the same job.
        let outcome = self.executor.execute(&claimed.job, claimed.post.as_ref());
        let finished_at = Utc::now();
        match outcome {
            Ok(result) => {
                self.engine
                    .finish_attempt(attempt_id, finished_at, None, Some(&result))?;
                match self.engine.report_success(&claimed, finished_at)? {
                    ReportOutcome::Succeeded => {
                        info!("job {} succeeded on worker {}", job_id, self.worker_id);
                    }
                    ReportOutcome::Discarded => {
                        warn!(
                            "job {} result discarded; status changed while worker {} was executing",
                            job_id, self.worker_id
                        );
                    }
                    other => {
                        warn!("job {} unexpected success outcome: {:?}", job_id, other);
                    }
                }
            }
            Err(err) => {
                self.engine
                    .finish_attempt(attempt_id, finished_at, Some(&err.to_string()), None)?;
                match self.engine.report_failure(&claimed, &err, finished_at)? {
                    ReportOutcome::RetryAt(retry_at) => {
                        info!(
                            "job {} failed on worker {}; retrying at {}: {}",
                            job_id, self.worker_id, retry_at, err
                        );
                    }
                    ReportOutcome::Failed => {
                        warn!(
                            "job {} failed terminally on worker {}: {}",
                            job_id, self.worker_id, err
                        );
                    }
                    ReportOutcome::Discarded => {
                        warn!(
                            "job {} failure discarded; status changed while worker {} was executing",
                            job_id, self.worker_id
                        );
                    }
                    other => {
                        warn!("job {} unexpected failure outcome: {:?}", job_id, other);
                    }
                }
            }
        }
        Ok(())
    }
}
