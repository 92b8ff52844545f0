// ABOUTME: HTTP JSON API over the request registry and cron scheduler
// ABOUTME: The gateway-layer collaborator: channel adapters and tooling call these endpoints

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::runner::ProcessAgentRunner;
use crosswire_core::cron::{CronService, JobDelivery, JobPatch, JobPayload, JobRecord, JobSchedule, NewJob, SessionTarget};
use crosswire_core::dispatch::SystemEvent;
use crosswire_core::error::{ErrorKind, RegistryError};
use crosswire_core::metrics;
use crosswire_core::requests::{NewRequest, RequestPriority, RequestRecord, RequestRegistry};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RequestRegistry>,
    pub cron: Arc<CronService>,
    pub runner: Arc<ProcessAgentRunner>,
    pub api_key: Option<String>,
    pub metrics_handle: Arc<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn error_response(err: &RegistryError) -> (StatusCode, Json<ApiError>) {
    let status = match err.kind() {
        ErrorKind::Capacity | ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::WaitTimeout => StatusCode::REQUEST_TIMEOUT,
        ErrorKind::Aborted | ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(ApiError {
            error: err.kind().as_str().to_string(),
            message: err.message().to_string(),
        }),
    )
}

/// Mutating endpoints require the shared key when one is configured
fn check_api_key(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<ApiError>)> {
    let Some(expected) = &state.api_key else {
        return Ok(());
    };
    let provided = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    if provided == Some(expected.as_str()) {
        return Ok(());
    }
    tracing::warn!("API authentication failed");
    metrics::record_http_request("auth", "failed");
    Err((
        StatusCode::UNAUTHORIZED,
        Json(ApiError {
            error: "unauthorized".to_string(),
            message: "Invalid or missing API key".to_string(),
        }),
    ))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/events", get(list_events_handler))
        .route("/requests", post(create_request_handler))
        .route("/requests/pending", get(list_pending_handler))
        .route("/requests/{id}", get(get_request_handler))
        .route("/requests/{id}/resolve", post(resolve_request_handler))
        .route("/requests/{id}/wait", post(wait_request_handler))
        .route("/sessions/{key}/cancel-requests", post(cancel_child_handler))
        .route("/sessions/{key}/orphan-requests", post(orphan_parent_handler))
        .route("/jobs", post(create_job_handler).get(list_jobs_handler))
        .route(
            "/jobs/{id}",
            get(get_job_handler)
                .patch(patch_job_handler)
                .delete(delete_job_handler),
        )
        .route("/jobs/{id}/run", post(run_job_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateRequestBody {
    pub child_session_key: String,
    pub parent_session_key: String,
    pub message: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub priority: Option<RequestPriority>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CreateRequestResponse {
    pub request_id: String,
}

async fn create_request_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateRequestBody>,
) -> ApiResult<CreateRequestResponse> {
    check_api_key(&state, &headers)?;

    let request_id = state
        .registry
        .create_request(NewRequest {
            child_session_key: body.child_session_key,
            parent_session_key: body.parent_session_key,
            message: body.message,
            context: body.context,
            priority: body.priority,
            timeout_ms: body.timeout_ms,
        })
        .await
        .map_err(|e| {
            metrics::record_http_request("create_request", "rejected");
            error_response(&e)
        })?;

    metrics::record_http_request("create_request", "success");
    Ok(Json(CreateRequestResponse { request_id }))
}

async fn get_request_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<RequestRecord> {
    match state.registry.get(&id) {
        Some(record) => Ok(Json(record)),
        None => Err(error_response(&RegistryError::new(
            ErrorKind::NotFound,
            format!("unknown request: {}", id),
        ))),
    }
}

#[derive(Debug, Deserialize)]
pub struct ResolveBody {
    pub response: String,
    pub resolved_by_session_key: String,
}

async fn resolve_request_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ResolveBody>,
) -> ApiResult<RequestRecord> {
    check_api_key(&state, &headers)?;

    let record = state
        .registry
        .resolve_request(&id, &body.response, &body.resolved_by_session_key)
        .await
        .map_err(|e| {
            metrics::record_http_request("resolve_request", "rejected");
            error_response(&e)
        })?;
    metrics::record_http_request("resolve_request", "success");
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct WaitBody {
    #[serde(default = "default_wait_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_wait_timeout_ms() -> u64 {
    30_000
}

async fn wait_request_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<WaitBody>,
) -> ApiResult<RequestRecord> {
    let record = state
        .registry
        .wait_for_resolution(&id, body.timeout_ms, None)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub child: Option<String>,
}

async fn list_pending_handler(
    State(state): State<AppState>,
    Query(query): Query<PendingQuery>,
) -> ApiResult<Vec<RequestRecord>> {
    let records = match (&query.parent, &query.child) {
        (Some(parent), _) => state.registry.list_pending_for_parent(parent),
        (None, Some(child)) => state.registry.list_pending_for_child(child),
        (None, None) => {
            return Err(error_response(&RegistryError::new(
                ErrorKind::InvalidInput,
                "provide a 'parent' or 'child' query parameter",
            )))
        }
    };
    Ok(Json(records))
}

#[derive(Debug, Serialize)]
pub struct BulkFinishResponse {
    pub finished: usize,
}

async fn cancel_child_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> ApiResult<BulkFinishResponse> {
    check_api_key(&state, &headers)?;
    let finished = state.registry.cancel_requests_for_child(&key).await;
    Ok(Json(BulkFinishResponse { finished }))
}

async fn orphan_parent_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> ApiResult<BulkFinishResponse> {
    check_api_key(&state, &headers)?;
    let finished = state.registry.orphan_requests_for_parent(&key).await;
    Ok(Json(BulkFinishResponse { finished }))
}

// =============================================================================
// Jobs
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateJobBody {
    pub name: String,
    pub schedule: JobSchedule,
    pub session_target: SessionTarget,
    pub payload: JobPayload,
    #[serde(default)]
    pub delivery: Option<JobDelivery>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

async fn create_job_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateJobBody>,
) -> ApiResult<JobRecord> {
    check_api_key(&state, &headers)?;

    let record = state
        .cron
        .create_job(NewJob {
            name: body.name,
            schedule: body.schedule,
            session_target: body.session_target,
            payload: body.payload,
            delivery: body.delivery,
            enabled: body.enabled,
        })
        .await
        .map_err(|e| error_response(&e))?;
    metrics::record_http_request("create_job", "success");
    Ok(Json(record))
}

async fn list_jobs_handler(State(state): State<AppState>) -> Json<Vec<JobRecord>> {
    Json(state.cron.list_jobs())
}

async fn get_job_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<JobRecord> {
    match state.cron.get_job(&id) {
        Some(record) => Ok(Json(record)),
        None => Err(error_response(&RegistryError::new(
            ErrorKind::NotFound,
            format!("unknown job: {}", id),
        ))),
    }
}

async fn patch_job_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(patch): Json<JobPatch>,
) -> ApiResult<JobRecord> {
    check_api_key(&state, &headers)?;
    let record = state
        .cron
        .apply_job_patch(&id, patch)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(record))
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: bool,
}

async fn delete_job_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<DeletedResponse> {
    check_api_key(&state, &headers)?;
    state
        .cron
        .delete_job(&id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(DeletedResponse { deleted: true }))
}

async fn run_job_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<crosswire_core::dispatch::JobRunOutcome> {
    check_api_key(&state, &headers)?;
    let outcome = state
        .cron
        .execute_job(&id, true)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(outcome))
}

// =============================================================================
// Introspection
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn list_events_handler(State(state): State<AppState>) -> Json<Vec<SystemEvent>> {
    Json(state.runner.recent_events())
}

/// Handle GET /metrics - returns Prometheus text format
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics_handle.render()
}
