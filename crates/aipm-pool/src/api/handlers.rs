//! Request handlers.

use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::completion::CompletionKind;
use crate::pool::{SessionStatus, TaskRequest, TaskResult};
use crate::session::{SessionId, SessionState};

// ============================================================================
// /execute
// ============================================================================

/// Body of `POST /execute`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub prompt: Option<String>,
    pub context: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Body returned by `POST /execute`, for successes and failures alike.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub success: bool,
    pub task_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub possibly_incomplete: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
}

impl From<TaskResult> for ExecuteResponse {
    fn from(result: TaskResult) -> Self {
        match result {
            Ok(done) => Self {
                success: true,
                task_id: done.task_id,
                session_id: Some(done.session_id),
                output: done.output,
                completion: Some(done.completion),
                possibly_incomplete: Some(done.possibly_incomplete),
                duration_ms: Some(millis(done.elapsed)),
                queued_ms: Some(millis(done.queued_for)),
                error: None,
                error_kind: None,
            },
            Err(failure) => Self {
                success: false,
                task_id: failure.task_id,
                session_id: failure.session_id,
                output: failure.output,
                completion: None,
                possibly_incomplete: None,
                duration_ms: None,
                queued_ms: None,
                error: Some(failure.error.to_string()),
                error_kind: Some(failure.error.kind()),
            },
        }
    }
}

/// Run a prompt on the next free session and wait for its result.
pub async fn execute(
    State(state): State<AppState>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> ApiResult<Json<ExecuteResponse>> {
    let Json(request) = payload.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;

    let prompt = request
        .prompt
        .filter(|prompt| !prompt.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("prompt is required"))?;

    let mut task = TaskRequest::new(prompt);
    if let Some(context) = request.context {
        task = task.with_context(context);
    }
    if let Some(ms) = request.timeout_ms.filter(|ms| *ms > 0) {
        task = task.with_timeout(Duration::from_millis(ms));
    }

    let handle = state.pool.submit(task).await;
    info!(task_id = %handle.id(), "Task submitted");
    let response = ExecuteResponse::from(handle.wait().await);
    info!(
        task_id = %response.task_id,
        success = response.success,
        "Task resolved"
    );
    Ok(Json(response))
}

// ============================================================================
// /health
// ============================================================================

/// Pool health and per-session detail.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// "ok" when every session is up, "degraded" while any is restarting.
    pub status: &'static str,
    pub version: &'static str,
    /// Tasks currently running.
    pub active: usize,
    /// Tasks waiting for a session.
    pub queued: usize,
    pub idle: usize,
    pub restarting: usize,
    pub max_concurrency: usize,
    pub uptime_secs: u64,
    pub started_at: DateTime<Utc>,
    pub sessions: Vec<SessionHealth>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHealth {
    pub id: SessionId,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub generation: u64,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silent_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_runtime_secs: Option<u64>,
}

impl From<&SessionStatus> for SessionHealth {
    fn from(session: &SessionStatus) -> Self {
        Self {
            id: session.id,
            state: session.state,
            pid: session.pid,
            generation: session.generation,
            restart_count: session.restart_count,
            current_task: session.current_task,
            silent_secs: session.silent_for.map(|d| d.as_secs()),
            task_runtime_secs: session.task_runtime.map(|d| d.as_secs()),
        }
    }
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = state.pool.status().await;
    Json(HealthResponse {
        status: if status.restarting == 0 { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        active: status.busy,
        queued: status.queued,
        idle: status.idle,
        restarting: status.restarting,
        max_concurrency: status.pool_size,
        uptime_secs: status.uptime.as_secs(),
        started_at: state.started_at,
        sessions: status.sessions.iter().map(SessionHealth::from).collect(),
    })
}

// ============================================================================
// CORS preflight and fallback
// ============================================================================

pub async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

pub async fn fallback(method: Method, uri: Uri) -> Response {
    if method == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }
    ApiError::not_found(uri.path().to_string()).into_response()
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
