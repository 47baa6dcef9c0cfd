//! Route handlers.

use std::time::Duration;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::error;
use uuid::Uuid;

use crate::api::AppState;
use crate::dispatcher::Submission;
use crate::error::JobError;

const DEFAULT_LIST_LIMIT: usize = 10;
const MAX_LIST_LIMIT: usize = 500;

/// Error response: `{"ok": false, "detail": ...}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "not found")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "ok": false, "detail": self.detail })),
        )
            .into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match &e {
            JobError::Validation(_) | JobError::UnknownTask { .. } => {
                Self::bad_request(e.to_string())
            }
            JobError::NotFound { .. } => Self::not_found(),
            JobError::QueueFull { .. } => Self::new(StatusCode::TOO_MANY_REQUESTS, e.to_string()),
            _ => {
                error!(error = %e, "Request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let status = match rejection.status() {
            StatusCode::UNPROCESSABLE_ENTITY => StatusCode::BAD_REQUEST,
            other => other,
        };
        Self::new(status, rejection.body_text())
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

/// Unparsable ids cannot name a job.
fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ApiError::not_found())
}

fn truthy(raw: Option<&str>) -> bool {
    raw.is_some_and(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "app": "velu",
        "tasks": state.dispatcher.registry().list(),
    }))
}

pub async fn ready(State(state): State<AppState>) -> Response {
    match state.dispatcher.ping().await {
        Ok(()) => Json(json!({ "ok": true, "db": { "reachable": true } })).into_response(),
        Err(e) => {
            error!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "ok": false,
                    "db": { "reachable": false, "error": e.to_string() },
                })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub task: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

pub async fn submit_task(
    State(state): State<AppState>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let job = state
        .dispatcher
        .submit_with(
            Submission::new(body.task, body.payload)
                .with_priority(body.priority)
                .with_timeout_secs(body.timeout_secs),
        )
        .await?;

    Ok(Json(json!({
        "ok": true,
        "job_id": job.id,
        "received": { "task": job.task, "payload": job.payload },
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<String>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let limit = match query.limit.as_deref().map(str::trim) {
        None | Some("") => DEFAULT_LIST_LIMIT,
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| ApiError::bad_request("limit must be a non-negative integer"))?,
    }
    .clamp(1, MAX_LIST_LIMIT);

    let items = state.dispatcher.list_recent(limit).await?;
    Ok(Json(json!({ "ok": true, "items": items })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ResultQuery {
    pub expand: Option<String>,
    pub follow: Option<String>,
}

pub async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ResultQuery>,
) -> ApiResult {
    let id = parse_id(&id)?;
    let follow = match query.follow.as_deref().map(str::trim) {
        None | Some("") => Duration::ZERO,
        Some(raw) => {
            let secs = raw
                .parse::<f64>()
                .ok()
                .filter(|s| s.is_finite())
                .ok_or_else(|| ApiError::bad_request("follow must be a number of seconds"))?;
            let cap = state.dispatcher.max_follow().as_secs_f64();
            Duration::from_secs_f64(secs.clamp(0.0, cap))
        }
    };

    let view = state
        .dispatcher
        .view(id, truthy(query.expand.as_deref()), follow)
        .await?;
    Ok(Json(json!({ "ok": true, "item": view })))
}

pub async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let id = parse_id(&id)?;
    let job = state.dispatcher.cancel(id).await?;
    Ok(Json(json!({ "ok": true, "item": job })))
}
