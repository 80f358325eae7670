use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::task;
use tracing::error;
use uuid::Uuid;

use crate::job::{
    CreateJobRequest, JobAction, JobStatus, JobView, NewPostRequest, ScheduleError,
    DEFAULT_LIST_LIMIT, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BACKOFF_SECONDS, MAX_LIST_LIMIT,
    PUBLISH_POST_JOB_TYPE,
};
use crate::window::PlanTier;

use super::state::AppState;

/// Identity resolved upstream of this service and forwarded as headers.
fn resolve_identity(headers: &HeaderMap) -> Result<(String, PlanTier), Response> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let user_id = match user_id {
        Some(user_id) => user_id.to_string(),
        None => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "missing x-user-id header" })),
            )
                .into_response());
        }
    };
    let tier = headers
        .get("x-user-plan")
        .and_then(|value| value.to_str().ok())
        .map(PlanTier::parse)
        .unwrap_or(PlanTier::Free);
    Ok((user_id, tier))
}

fn error_response(err: ScheduleError) -> Response {
    match &err {
        ScheduleError::Validation(message) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": message })),
        )
            .into_response(),
        ScheduleError::Window(violation) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": violation.to_string() })),
        )
            .into_response(),
        ScheduleError::Conflict(message) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": message })),
        )
            .into_response(),
        ScheduleError::NotFound(_) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "job not found" })),
        )
            .into_response(),
        _ => {
            error!("job store operation failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

fn parse_run_at(raw: &str) -> Result<DateTime<Utc>, Response> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|_| {
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({ "error": "runAt must be an ISO-8601 timestamp" })),
            )
                .into_response()
        })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateJobParams {
    job_type: Option<String>,
    run_at: String,
    #[serde(default)]
    priority: i64,
    max_attempts: Option<u32>,
    retry_backoff_seconds: Option<u32>,
    payload: Option<Value>,
    post: Option<PostParams>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PostParams {
    title: String,
    #[serde(default)]
    caption: String,
    target: String,
    #[serde(default)]
    media_urls: Vec<String>,
    #[serde(default)]
    nsfw: bool,
    #[serde(default)]
    spoiler: bool,
}

/// POST /jobs
pub(super) async fn create_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<CreateJobParams>,
) -> Response {
    let (user_id, tier) = match resolve_identity(&headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    let run_at = match parse_run_at(&params.run_at) {
        Ok(run_at) => run_at,
        Err(response) => return response,
    };
    let request = CreateJobRequest {
        user_id,
        job_type: params
            .job_type
            .unwrap_or_else(|| PUBLISH_POST_JOB_TYPE.to_string()),
        run_at,
        priority: params.priority,
        max_attempts: params.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
        retry_backoff_seconds: params
            .retry_backoff_seconds
            .unwrap_or(DEFAULT_RETRY_BACKOFF_SECONDS),
        payload: params.payload.unwrap_or(Value::Null),
        post: params.post.map(|post| NewPostRequest {
            title: post.title,
            caption: post.caption,
            target: post.target,
            media_urls: post.media_urls,
            nsfw: post.nsfw,
            spoiler: post.spoiler,
        }),
    };

    let engine = state.engine.clone();
    let created = task::spawn_blocking(move || engine.create_job(tier, request)).await;
    match created {
        Ok(Ok(record)) => (
            StatusCode::CREATED,
            Json(JobView::from_record(&record)),
        )
            .into_response(),
        Ok(Err(err)) => error_response(err),
        Err(err) => {
            error!("create job task panicked: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct ListJobsParams {
    status: Option<String>,
    limit: Option<usize>,
}

/// GET /jobs?status=pending,queued&limit=50
pub(super) async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListJobsParams>,
) -> Response {
    let (user_id, _tier) = match resolve_identity(&headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    let mut statuses = Vec::new();
    if let Some(raw) = params.status.as_deref() {
        for token in raw.split(',').map(str::trim).filter(|token| !token.is_empty()) {
            match JobStatus::parse(token) {
                Some(status) => statuses.push(status),
                None => {
                    return (
                        StatusCode::UNPROCESSABLE_ENTITY,
                        Json(serde_json::json!({
                            "error": format!("unknown status filter '{token}'")
                        })),
                    )
                        .into_response();
                }
            }
        }
    }
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let engine = state.engine.clone();
    let listed =
        task::spawn_blocking(move || engine.list_jobs(&user_id, &statuses, limit)).await;
    match listed {
        Ok(Ok(records)) => {
            let jobs = records
                .iter()
                .map(JobView::from_record)
                .collect::<Vec<_>>();
            Json(serde_json::json!({ "jobs": jobs })).into_response()
        }
        Ok(Err(err)) => error_response(err),
        Err(err) => {
            error!("list jobs task panicked: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

/// GET /jobs/:id
pub(super) async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Response {
    let (user_id, _tier) = match resolve_identity(&headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    let engine = state.engine.clone();
    let loaded = task::spawn_blocking(move || engine.get_job(&user_id, job_id)).await;
    match loaded {
        Ok(Ok(record)) => Json(JobView::from_record(&record)).into_response(),
        Ok(Err(err)) => error_response(err),
        Err(err) => {
            error!("get job task panicked: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct JobActionParams {
    action: String,
    run_at: Option<String>,
    reason: Option<String>,
}

/// POST /jobs/:id/action
pub(super) async fn apply_job_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
    Json(params): Json<JobActionParams>,
) -> Response {
    let (user_id, tier) = match resolve_identity(&headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };
    let action = match params.action.as_str() {
        "cancel" => JobAction::Cancel {
            reason: params.reason,
        },
        "reschedule" => {
            let raw = match params.run_at.as_deref() {
                Some(raw) => raw,
                None => {
                    return (
                        StatusCode::UNPROCESSABLE_ENTITY,
                        Json(serde_json::json!({ "error": "reschedule requires runAt" })),
                    )
                        .into_response();
                }
            };
            match parse_run_at(raw) {
                Ok(run_at) => JobAction::Reschedule { run_at },
                Err(response) => return response,
            }
        }
        "force-run" => JobAction::ForceRun,
        other => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({
                    "error": format!("unknown action '{other}'")
                })),
            )
                .into_response();
        }
    };

    let engine = state.engine.clone();
    let updated =
        task::spawn_blocking(move || engine.apply_action(&user_id, job_id, tier, action)).await;
    match updated {
        Ok(Ok(record)) => Json(JobView::from_record(&record)).into_response(),
        Ok(Err(err)) => error_response(err),
        Err(err) => {
            error!("job action task panicked: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}
