//! REST API handlers.
//!
//! Each handler calls into the [`Scheduler`](gilliam_scheduler::Scheduler)
//! and returns the `{ success, data, error }` JSON envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::error;

use gilliam_scheduler::{SchedulerError, SchedulerResult};
use gilliam_state::{NodeSpec, Tick, WorkUnitSpec};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// HTTP status for a scheduler error.
pub fn status_for(err: &SchedulerError) -> StatusCode {
    match err {
        SchedulerError::WorkUnitNotFound(_)
        | SchedulerError::NodeNotFound(_)
        | SchedulerError::LeaseNotFound(_) => StatusCode::NOT_FOUND,
        SchedulerError::LeaseExpired { .. }
        | SchedulerError::InvalidTransition { .. }
        | SchedulerError::AlreadyLeased { .. } => StatusCode::CONFLICT,
        SchedulerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond<T: Serialize>(result: SchedulerResult<T>, status: StatusCode) -> Response {
    match result {
        Ok(data) => (status, ApiResponse::ok(data)).into_response(),
        Err(e) => {
            let code = status_for(&e);
            if code.is_server_error() {
                error!(error = %e, "request failed");
            }
            error_response(&e.to_string(), code).into_response()
        }
    }
}

// ── Health ─────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok(serde_json::json!({ "status": "ok" }))
}

// ── Work units ─────────────────────────────────────────────────

/// GET /api/v1/work
pub async fn list_work(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.scheduler.list_work_units().await)
}

/// POST /api/v1/work
pub async fn submit_work(
    State(state): State<ApiState>,
    Json(spec): Json<WorkUnitSpec>,
) -> impl IntoResponse {
    respond(state.scheduler.submit(spec).await, StatusCode::ACCEPTED)
}

/// GET /api/v1/work/{id}
pub async fn get_work(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    respond(state.scheduler.work_unit(&id).await, StatusCode::OK)
}

/// DELETE /api/v1/work/{id}
pub async fn withdraw_work(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.scheduler.withdraw(&id).await, StatusCode::OK)
}

/// POST /api/v1/work/{id}/running
pub async fn work_running(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.scheduler.mark_running(&id).await, StatusCode::OK)
}

/// POST /api/v1/work/{id}/complete
pub async fn work_complete(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.scheduler.complete(&id).await, StatusCode::OK)
}

/// Failure report body.
#[derive(Debug, Deserialize)]
pub struct FailRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /api/v1/work/{id}/fail
pub async fn work_failed(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<FailRequest>,
) -> impl IntoResponse {
    let reason = req
        .reason
        .unwrap_or_else(|| "reported failed by node".to_string());
    respond(state.scheduler.report_failure(&id, reason).await, StatusCode::OK)
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.scheduler.list_nodes())
}

/// POST /api/v1/nodes
pub async fn register_node(
    State(state): State<ApiState>,
    Json(spec): Json<NodeSpec>,
) -> impl IntoResponse {
    respond(state.scheduler.register_node(spec).await, StatusCode::CREATED)
}

/// GET /api/v1/nodes/{id}
pub async fn get_node(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    respond(state.scheduler.node(&id), StatusCode::OK)
}

/// DELETE /api/v1/nodes/{id}
pub async fn deregister_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.scheduler.deregister_node(&id).await, StatusCode::OK)
}

/// POST /api/v1/nodes/{id}/heartbeat
pub async fn heartbeat(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    respond(state.scheduler.heartbeat(&id).await, StatusCode::OK)
}

// ── Leases ─────────────────────────────────────────────────────

/// GET /api/v1/leases
pub async fn list_leases(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.scheduler.list_leases().await)
}

/// GET /api/v1/leases/{id}
pub async fn get_lease(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    respond(state.scheduler.lease(&id).await, StatusCode::OK)
}

/// Renewal request body. Without `ttl` the configured default applies.
#[derive(Debug, Deserialize)]
pub struct RenewRequest {
    #[serde(default)]
    pub ttl: Option<Tick>,
}

/// POST /api/v1/leases/{id}/renew
pub async fn renew_lease(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<RenewRequest>,
) -> impl IntoResponse {
    respond(state.scheduler.renew_lease(&id, req.ttl).await, StatusCode::OK)
}

// ── Reconciliation ─────────────────────────────────────────────

/// POST /api/v1/cycle
pub async fn run_cycle(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.scheduler.run_cycle().await)
}
