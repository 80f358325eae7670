use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::time::Duration as StdDuration;
use uuid::Uuid;

use super::types::{
    ClaimedJob, JobRecord, JobStatus, PostStatus, ScheduleError, ScheduleJob, ScheduleJobAttempt,
    ScheduledPost,
};
use super::utils::{
    bool_to_int, format_datetime, join_media_urls, parse_datetime, parse_optional_datetime,
    payload_from_column, payload_to_column, split_media_urls,
};

mod schema;

use schema::JOBS_SCHEMA;

/// Attempts loaded per job, most recent first.
pub(crate) const ATTEMPT_HISTORY_LIMIT: usize = 10;

const JOB_COLUMNS: &str = "id, user_id, scheduled_post_id, job_type, status, run_at, retry_at, \
     priority, locked_at, locked_by, attempts, max_attempts, retry_backoff_seconds, last_error, \
     last_run_at, payload, created_at, updated_at";

#[derive(Debug)]
pub(crate) struct SqliteJobStore {
    path: PathBuf,
}

impl SqliteJobStore {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Result<Self, ScheduleError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection, ScheduleError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(StdDuration::from_secs(5))?;
        conn.execute_batch(JOBS_SCHEMA)?;
        Ok(conn)
    }

    /// Persists a job and its linked post as one transaction.
    pub(crate) fn insert_job(
        &self,
        job: &ScheduleJob,
        post: Option<&ScheduledPost>,
    ) -> Result<(), ScheduleError> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        if let Some(post) = post {
            tx.execute(
                "INSERT INTO scheduled_posts (id, user_id, title, caption, target, media_urls, nsfw, spoiler, status, scheduled_for, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    post.id.to_string(),
                    post.user_id,
                    post.title,
                    post.caption,
                    post.target,
                    join_media_urls(&post.media_urls),
                    bool_to_int(post.nsfw),
                    bool_to_int(post.spoiler),
                    post.status.as_str(),
                    format_datetime(post.scheduled_for),
                    format_datetime(post.created_at),
                    format_datetime(post.updated_at),
                ],
            )?;
        }
        tx.execute(
            "INSERT INTO schedule_jobs (id, user_id, scheduled_post_id, job_type, status, run_at, retry_at, priority, locked_at, locked_by, attempts, max_attempts, retry_backoff_seconds, last_error, last_run_at, payload, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                job.id.to_string(),
                job.user_id,
                job.scheduled_post_id.map(|id| id.to_string()),
                job.job_type,
                job.status.as_str(),
                format_datetime(job.run_at),
                job.retry_at.map(format_datetime),
                job.priority,
                job.locked_at.map(format_datetime),
                job.locked_by.as_deref(),
                i64::from(job.attempts),
                i64::from(job.max_attempts),
                i64::from(job.retry_backoff_seconds),
                job.last_error.as_deref(),
                job.last_run_at.map(format_datetime),
                payload_to_column(&job.payload),
                format_datetime(job.created_at),
                format_datetime(job.updated_at),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Loads a job with its post and recent attempts, newest attempt first.
    pub(crate) fn load_record(&self, job_id: Uuid) -> Result<Option<JobRecord>, ScheduleError> {
        let conn = self.open()?;
        load_record_conn(&conn, &job_id.to_string())
    }

    pub(crate) fn list_records(
        &self,
        user_id: &str,
        statuses: &[JobStatus],
        limit: usize,
    ) -> Result<Vec<JobRecord>, ScheduleError> {
        let conn = self.open()?;
        let mut sql = format!(
            "SELECT {JOB_COLUMNS} FROM schedule_jobs WHERE user_id = ?1"
        );
        if !statuses.is_empty() {
            let filter = statuses
                .iter()
                .map(|status| format!("'{}'", status.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" AND status IN ({filter})"));
        }
        sql.push_str(" ORDER BY status ASC, run_at ASC, priority DESC LIMIT ?2");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id, limit as i64], read_job_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(job_from_row(row?)?);
        }
        let mut records = Vec::with_capacity(jobs.len());
        for job in jobs {
            let post = match &job.scheduled_post_id {
                Some(post_id) => load_post_conn(&conn, &post_id.to_string())?,
                None => None,
            };
            let attempts = load_attempts_conn(&conn, &job.id.to_string())?;
            records.push(JobRecord {
                job,
                post,
                attempts,
            });
        }
        Ok(records)
    }

    /// Claims at most one due, unlocked job for `worker_id`.
    ///
    /// Candidate selection and the guarded update run inside a single
    /// immediate transaction; losing the race to another dispatcher yields
    /// `None`, never an error. A lease is live while `locked_at` is within
    /// `lease_timeout` of `now`; expired leases are reclaimed here, which is
    /// also how force-run and crashed-worker jobs get picked up.
    pub(crate) fn claim_due_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_timeout: Duration,
    ) -> Result<Option<ClaimedJob>, ScheduleError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let lease_floor = format_datetime(now - lease_timeout);
        let candidate = tx
            .query_row(
                "SELECT id, status FROM schedule_jobs
                 WHERE ((status = 'pending' AND run_at <= ?1) OR status = 'queued')
                   AND (locked_at IS NULL OR locked_at < ?2)
                 ORDER BY status ASC, run_at ASC, priority DESC
                 LIMIT 1",
                params![format_datetime(now), lease_floor],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        let (job_id_raw, status_raw) = match candidate {
            Some(candidate) => candidate,
            None => return Ok(None),
        };
        let updated = tx.execute(
            "UPDATE schedule_jobs
             SET status = 'queued', locked_at = ?2, locked_by = ?3, retry_at = NULL, updated_at = ?2
             WHERE id = ?1 AND status = ?4 AND (locked_at IS NULL OR locked_at < ?5)",
            params![
                job_id_raw,
                format_datetime(now),
                worker_id,
                status_raw,
                lease_floor
            ],
        )?;
        if updated == 0 {
            // Another dispatcher won the conditional update.
            return Ok(None);
        }
        let record = load_record_conn(&tx, &job_id_raw)?.ok_or_else(|| {
            ScheduleError::Storage(format!("claimed job {job_id_raw} disappeared"))
        })?;
        tx.commit()?;
        Ok(Some(ClaimedJob {
            job: record.job,
            post: record.post,
            worker_id: worker_id.to_string(),
        }))
    }

    /// Cancels a claimable job. Returns false when the guarded update did
    /// not apply (the job had already reached a terminal status).
    pub(crate) fn cancel_job(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<bool, ScheduleError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let applied = tx.execute(
            "UPDATE schedule_jobs
             SET status = 'cancelled', locked_at = NULL, locked_by = NULL, retry_at = NULL, updated_at = ?2
             WHERE id = ?1 AND status IN ('pending', 'queued')",
            params![job_id.to_string(), format_datetime(now)],
        )?;
        if applied > 0 {
            update_linked_post(&tx, job_id, PostStatus::Cancelled, None, now)?;
        }
        tx.commit()?;
        Ok(applied > 0)
    }

    /// Moves a non-terminal job back to `pending` at a new run time.
    pub(crate) fn reschedule_job(
        &self,
        job_id: Uuid,
        new_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, ScheduleError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let applied = tx.execute(
            "UPDATE schedule_jobs
             SET status = 'pending', run_at = ?2, retry_at = NULL, locked_at = NULL, locked_by = NULL, updated_at = ?3
             WHERE id = ?1 AND status IN ('pending', 'queued')",
            params![
                job_id.to_string(),
                format_datetime(new_run_at),
                format_datetime(now)
            ],
        )?;
        if applied > 0 {
            update_linked_post(&tx, job_id, PostStatus::Pending, Some(new_run_at), now)?;
        }
        tx.commit()?;
        Ok(applied > 0)
    }

    /// Queues a job for immediate execution, bypassing the due-time check.
    pub(crate) fn force_run_job(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, ScheduleError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let applied = tx.execute(
            "UPDATE schedule_jobs
             SET status = 'queued', run_at = ?2, retry_at = NULL, locked_at = NULL, locked_by = NULL, updated_at = ?2
             WHERE id = ?1",
            params![job_id.to_string(), format_datetime(now)],
        )?;
        if applied > 0 {
            update_linked_post(&tx, job_id, PostStatus::Pending, Some(now), now)?;
        }
        tx.commit()?;
        Ok(applied > 0)
    }

    /// Records the start of one execution try. The attempt number is
    /// assigned inside the insert from the current maximum, which together
    /// with the unique constraint keeps numbering contiguous per job.
    pub(crate) fn record_attempt_start(
        &self,
        job_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<i64, ScheduleError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO schedule_job_attempts (job_id, attempt_number, started_at, created_at)
             SELECT ?1, COALESCE(MAX(attempt_number), 0) + 1, ?2, ?2
             FROM schedule_job_attempts WHERE job_id = ?1",
            params![job_id.to_string(), format_datetime(started_at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub(crate) fn finish_attempt(
        &self,
        attempt_id: i64,
        finished_at: DateTime<Utc>,
        error: Option<&str>,
        result: Option<&Value>,
    ) -> Result<(), ScheduleError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE schedule_job_attempts
             SET finished_at = ?1, error = ?2, result = ?3
             WHERE id = ?4",
            params![
                format_datetime(finished_at),
                error,
                result.map(|value| value.to_string()),
                attempt_id
            ],
        )?;
        Ok(())
    }

    /// Marks a leased job succeeded. Returns false when the lease guard
    /// fails, meaning the job was cancelled or rescheduled mid-flight and
    /// the result must be discarded.
    pub(crate) fn complete_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, ScheduleError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let applied = tx.execute(
            "UPDATE schedule_jobs
             SET status = 'succeeded', attempts = ?3, locked_at = NULL, locked_by = NULL, retry_at = NULL, last_run_at = ?4, updated_at = ?4
             WHERE id = ?1 AND status = 'queued' AND locked_by = ?2",
            params![
                job_id.to_string(),
                worker_id,
                i64::from(attempts),
                format_datetime(now)
            ],
        )?;
        if applied > 0 {
            update_linked_post(&tx, job_id, PostStatus::Sent, None, now)?;
        }
        tx.commit()?;
        Ok(applied > 0)
    }

    /// Marks a leased job terminally failed. Same lease guard as
    /// [`Self::complete_job`].
    pub(crate) fn fail_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, ScheduleError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let applied = tx.execute(
            "UPDATE schedule_jobs
             SET status = 'failed', attempts = ?3, last_error = ?4, locked_at = NULL, locked_by = NULL, retry_at = NULL, last_run_at = ?5, updated_at = ?5
             WHERE id = ?1 AND status = 'queued' AND locked_by = ?2",
            params![
                job_id.to_string(),
                worker_id,
                i64::from(attempts),
                error,
                format_datetime(now)
            ],
        )?;
        if applied > 0 {
            update_linked_post(&tx, job_id, PostStatus::Failed, None, now)?;
        }
        tx.commit()?;
        Ok(applied > 0)
    }

    /// Returns a leased job to `pending` for a retry at `retry_at`. Same
    /// lease guard as [`Self::complete_job`]; the linked post stays pending.
    pub(crate) fn retry_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        attempts: u32,
        retry_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, ScheduleError> {
        let conn = self.open()?;
        let applied = conn.execute(
            "UPDATE schedule_jobs
             SET status = 'pending', attempts = ?3, run_at = ?4, retry_at = ?4, last_error = ?5, locked_at = NULL, locked_by = NULL, last_run_at = ?6, updated_at = ?6
             WHERE id = ?1 AND status = 'queued' AND locked_by = ?2",
            params![
                job_id.to_string(),
                worker_id,
                i64::from(attempts),
                format_datetime(retry_at),
                error,
                format_datetime(now)
            ],
        )?;
        Ok(applied > 0)
    }
}

fn update_linked_post(
    conn: &Connection,
    job_id: Uuid,
    status: PostStatus,
    scheduled_for: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(), ScheduleError> {
    match scheduled_for {
        Some(scheduled_for) => {
            conn.execute(
                "UPDATE scheduled_posts
                 SET status = ?1, scheduled_for = ?2, updated_at = ?3
                 WHERE id = (SELECT scheduled_post_id FROM schedule_jobs WHERE id = ?4)",
                params![
                    status.as_str(),
                    format_datetime(scheduled_for),
                    format_datetime(now),
                    job_id.to_string()
                ],
            )?;
        }
        None => {
            conn.execute(
                "UPDATE scheduled_posts
                 SET status = ?1, updated_at = ?2
                 WHERE id = (SELECT scheduled_post_id FROM schedule_jobs WHERE id = ?3)",
                params![status.as_str(), format_datetime(now), job_id.to_string()],
            )?;
        }
    }
    Ok(())
}

fn load_record_conn(conn: &Connection, job_id_raw: &str) -> Result<Option<JobRecord>, ScheduleError> {
    let row = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM schedule_jobs WHERE id = ?1"),
            params![job_id_raw],
            read_job_row,
        )
        .optional()?;
    let job = match row {
        Some(row) => job_from_row(row)?,
        None => return Ok(None),
    };
    let post = match &job.scheduled_post_id {
        Some(post_id) => load_post_conn(conn, &post_id.to_string())?,
        None => None,
    };
    let attempts = load_attempts_conn(conn, job_id_raw)?;
    Ok(Some(JobRecord {
        job,
        post,
        attempts,
    }))
}

fn load_post_conn(conn: &Connection, post_id_raw: &str) -> Result<Option<ScheduledPost>, ScheduleError> {
    let row = conn
        .query_row(
            "SELECT id, user_id, title, caption, target, media_urls, nsfw, spoiler, status, scheduled_for, created_at, updated_at
             FROM scheduled_posts WHERE id = ?1",
            params![post_id_raw],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, String>(11)?,
                ))
            },
        )
        .optional()?;
    let (
        id_raw,
        user_id,
        title,
        caption,
        target,
        media_urls_raw,
        nsfw_raw,
        spoiler_raw,
        status_raw,
        scheduled_for_raw,
        created_at_raw,
        updated_at_raw,
    ) = match row {
        Some(row) => row,
        None => return Ok(None),
    };
    let status = PostStatus::parse(&status_raw)
        .ok_or_else(|| ScheduleError::Storage(format!("unknown post status {status_raw}")))?;
    Ok(Some(ScheduledPost {
        id: Uuid::parse_str(&id_raw)?,
        user_id,
        title,
        caption,
        target,
        media_urls: split_media_urls(&media_urls_raw),
        nsfw: nsfw_raw != 0,
        spoiler: spoiler_raw != 0,
        status,
        scheduled_for: parse_datetime(&scheduled_for_raw)?,
        created_at: parse_datetime(&created_at_raw)?,
        updated_at: parse_datetime(&updated_at_raw)?,
    }))
}

fn load_attempts_conn(
    conn: &Connection,
    job_id_raw: &str,
) -> Result<Vec<ScheduleJobAttempt>, ScheduleError> {
    let mut stmt = conn.prepare(
        "SELECT id, job_id, attempt_number, started_at, finished_at, error, result, created_at
         FROM schedule_job_attempts
         WHERE job_id = ?1
         ORDER BY attempt_number DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![job_id_raw, ATTEMPT_HISTORY_LIMIT as i64], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, String>(7)?,
        ))
    })?;
    let mut attempts = Vec::new();
    for row in rows {
        let (id, job_id_col, attempt_number, started_at_raw, finished_at_raw, error, result_raw, created_at_raw) =
            row?;
        attempts.push(ScheduleJobAttempt {
            id,
            job_id: Uuid::parse_str(&job_id_col)?,
            attempt_number: attempt_number as u32,
            started_at: parse_datetime(&started_at_raw)?,
            finished_at: parse_optional_datetime(finished_at_raw.as_deref())?,
            error,
            result: result_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
            created_at: parse_datetime(&created_at_raw)?,
        });
    }
    Ok(attempts)
}

struct JobRow {
    id: String,
    user_id: String,
    scheduled_post_id: Option<String>,
    job_type: String,
    status: String,
    run_at: String,
    retry_at: Option<String>,
    priority: i64,
    locked_at: Option<String>,
    locked_by: Option<String>,
    attempts: i64,
    max_attempts: i64,
    retry_backoff_seconds: i64,
    last_error: Option<String>,
    last_run_at: Option<String>,
    payload: String,
    created_at: String,
    updated_at: String,
}

fn read_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        scheduled_post_id: row.get(2)?,
        job_type: row.get(3)?,
        status: row.get(4)?,
        run_at: row.get(5)?,
        retry_at: row.get(6)?,
        priority: row.get(7)?,
        locked_at: row.get(8)?,
        locked_by: row.get(9)?,
        attempts: row.get(10)?,
        max_attempts: row.get(11)?,
        retry_backoff_seconds: row.get(12)?,
        last_error: row.get(13)?,
        last_run_at: row.get(14)?,
        payload: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

fn job_from_row(row: JobRow) -> Result<ScheduleJob, ScheduleError> {
    let status = JobStatus::parse(&row.status)
        .ok_or_else(|| ScheduleError::Storage(format!("unknown job status {}", row.status)))?;
    let scheduled_post_id = match row.scheduled_post_id.as_deref() {
        Some(raw) => Some(Uuid::parse_str(raw)?),
        None => None,
    };
    Ok(ScheduleJob {
        id: Uuid::parse_str(&row.id)?,
        user_id: row.user_id,
        scheduled_post_id,
        job_type: row.job_type,
        status,
        run_at: parse_datetime(&row.run_at)?,
        retry_at: parse_optional_datetime(row.retry_at.as_deref())?,
        priority: row.priority,
        locked_at: parse_optional_datetime(row.locked_at.as_deref())?,
        locked_by: row.locked_by,
        attempts: row.attempts as u32,
        max_attempts: row.max_attempts as u32,
        retry_backoff_seconds: row.retry_backoff_seconds as u32,
        last_error: row.last_error,
        last_run_at: parse_optional_datetime(row.last_run_at.as_deref())?,
        payload: payload_from_column(&row.payload),
        created_at: parse_datetime(&row.created_at)?,
        updated_at: parse_datetime(&row.updated_at)?,
    })
}
