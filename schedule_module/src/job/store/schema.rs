pub(super) const JOBS_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS scheduled_posts (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    caption TEXT NOT NULL,
    target TEXT NOT NULL,
    media_urls TEXT NOT NULL,
    nsfw INTEGER NOT NULL DEFAULT 0,
    spoiler INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    scheduled_for TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schedule_jobs (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    scheduled_post_id TEXT REFERENCES scheduled_posts(id),
    job_type TEXT NOT NULL,
    status TEXT NOT NULL,
    run_at TEXT NOT NULL,
    retry_at TEXT,
    priority INTEGER NOT NULL DEFAULT 0,
    locked_at TEXT,
    locked_by TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    retry_backoff_seconds INTEGER NOT NULL,
    last_error TEXT,
    last_run_at TEXT,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_schedule_jobs_due
    ON schedule_jobs (status, run_at);

CREATE INDEX IF NOT EXISTS idx_schedule_jobs_user
    ON schedule_jobs (user_id, status);

CREATE TABLE IF NOT EXISTS schedule_job_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL REFERENCES schedule_jobs(id) ON DELETE CASCADE,
    attempt_number INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    error TEXT,
    result TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (job_id, attempt_number)
);
"#;
