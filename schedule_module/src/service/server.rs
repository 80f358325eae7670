use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::job::JobEngine;

use super::config::ServiceConfig;
use super::dispatch::start_dispatcher_threads;
use super::jobs::{apply_job_action, create_job, get_job, list_jobs};
use super::state::AppState;
use super::BoxError;

pub async fn run_server(
    config: ServiceConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    let config = Arc::new(config);
    let engine = Arc::new(JobEngine::open(
        &config.jobs_db_path,
        config.lease_timeout,
    )?);

    let mut dispatcher_control = start_dispatcher_threads(&config, engine.clone());

    let state = AppState {
        engine: engine.clone(),
    };

    let host: IpAddr = config
        .host
        .parse()
        .map_err(|_| format!("invalid host: {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    info!("schedule service listening on {}", addr);

    let app = Router::new()
        .route("/health", get(health))
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/action", post(apply_job_action))
        .with_state(state)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    dispatcher_control.stop_and_join();
    serve_result?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
