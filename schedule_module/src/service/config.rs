use std::env;
use std::path::PathBuf;
use std::time::Duration;

use super::BoxError;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    /// Path of the sqlite job store shared by the API and the dispatchers.
    pub jobs_db_path: PathBuf,
    pub dispatcher_poll_interval: Duration,
    /// Dispatcher threads started alongside the HTTP server.
    pub dispatcher_workers: usize,
    /// How long a worker may hold a claim before it is reclaimable.
    pub lease_timeout: Duration,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, BoxError> {
        dotenvy::dotenv().ok();

        let host = env::var("SCHEDULE_SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("SCHEDULE_SERVICE_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(9005);
        let jobs_db_path = env::var("JOBS_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("state").join("jobs.db"));
        let dispatcher_poll_interval = env::var("DISPATCHER_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(1));
        let dispatcher_workers = env::var("DISPATCHER_WORKERS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(2);
        let lease_timeout = env::var("SCHEDULE_LEASE_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(crate::job::DEFAULT_LEASE_TIMEOUT_SECS));

        Ok(Self {
            host,
            port,
            jobs_db_path,
            dispatcher_poll_interval,
            dispatcher_workers,
            lease_timeout,
        })
    }
}
