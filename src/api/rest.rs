//! REST API Handlers
//!
//! Thin HTTP surface over the orchestrator: volume lifecycle requests,
//! backend reports and read-only queries.

use crate::domain::ids::generate_id;
use crate::domain::ports::{
    BackendId, BackendKind, CapabilityRequirements, CapabilitySet, CapacityReport, Connector,
};
use crate::error::{Error, Result};
use crate::orchestrator::{Orchestrator, VolumeOperation, VolumeRequest};
use crate::registry::BackendReport;
use axum::{
    extract::{DefaultBodyLimit, Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Volume create request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVolumeBody {
    /// Defaults to a generated id
    #[serde(default)]
    pub request_id: Option<String>,
    pub name: String,
    /// Size (e.g., "10Gi", "512Mi", "1073741824")
    pub size: String,
    #[serde(default)]
    pub capabilities: CapabilityRequirements,
    /// Retry a volume left in `error_creating`
    #[serde(default)]
    pub volume_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendVolumeBody {
    #[serde(default)]
    pub request_id: Option<String>,
    pub new_size: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotBody {
    #[serde(default)]
    pub request_id: Option<String>,
    pub name: String,
}

/// New volume cloned from a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneVolumeBody {
    #[serde(default)]
    pub request_id: Option<String>,
    pub name: String,
    /// Defaults to the snapshot's size
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub volume_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachBody {
    #[serde(default)]
    pub request_id: Option<String>,
    pub connector: Connector,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachBody {
    #[serde(default)]
    pub request_id: Option<String>,
    pub attachment_id: String,
}

/// Capacity and capability report pushed by a backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportBody {
    pub kind: BackendKind,
    pub capacity: CapacityReport,
    #[serde(default)]
    pub capabilities: CapabilitySet,
    #[serde(default)]
    pub reserved_percentage: u8,
    pub sequence_no: u64,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
}

// =============================================================================
// Error Mapping
// =============================================================================

/// HTTP status for an orchestrator error
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::FlowNotStarted { source, .. } => status_for(source),
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::VolumeNotFound { .. }
        | Error::SnapshotNotFound { .. }
        | Error::FlowNotFound { .. }
        | Error::BackendNotFound { .. } => StatusCode::NOT_FOUND,
        Error::InvalidTransition { .. }
        | Error::Busy { .. }
        | Error::Conflict { .. }
        | Error::FencingTokenRejected { .. }
        | Error::StaleReport { .. }
        | Error::FlowCancelled { .. } => StatusCode::CONFLICT,
        Error::NoCapableBackend { .. } | Error::CapacityExhausted { .. } => {
            StatusCode::INSUFFICIENT_STORAGE
        }
        Error::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: Error) -> Response {
    let status = status_for(&e);
    if status.is_server_error() {
        error!(error = %e, "Request failed");
    } else {
        debug!(error = %e, "Request rejected");
    }

    (
        status,
        Json(ApiErrorResponse {
            error: e.code().into(),
            message: e.to_string(),
        }),
    )
        .into_response()
}

fn respond<T: Serialize>(status: StatusCode, result: Result<T>) -> Response {
    match result {
        Ok(body) => (status, Json(body)).into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<Orchestrator>,
    max_body_size: usize,
}

impl RestRouter {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            max_body_size: 1024 * 1024,
        }
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator,
        };

        Router::new()
            // Volume endpoints
            .route("/v1/volumes", post(create_volume).get(list_volumes))
            .route("/v1/volumes/:id", get(get_volume).delete(delete_volume))
            .route("/v1/volumes/:id/extend", post(extend_volume))
            .route(
                "/v1/volumes/:id/snapshots",
                post(snapshot_volume).get(list_snapshots),
            )
            .route("/v1/volumes/:id/attach", post(attach_volume))
            .route("/v1/volumes/:id/detach", post(detach_volume))
            .route("/v1/snapshots/:id/volumes", post(clone_volume))
            // Requests and flows
            .route("/v1/requests/:id/cancel", post(cancel_request))
            .route("/v1/flows/:id", get(get_flow))
            // Backend endpoints
            .route("/v1/backends", get(list_backends))
            .route("/v1/backends/:id/report", post(report_backend))
            // Status
            .route("/v1/status", get(get_status))
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(DefaultBodyLimit::max(self.max_body_size))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

impl AppState {
    async fn run(&self, request_id: Option<String>, operation: VolumeOperation) -> Response {
        let request = VolumeRequest::new(
            request_id.unwrap_or_else(|| generate_id("req")),
            operation,
        );
        let status = match request.operation {
            VolumeOperation::Create { .. } | VolumeOperation::CreateFromSnapshot { .. } => {
                StatusCode::CREATED
            }
            _ => StatusCode::OK,
        };
        respond(status, self.orchestrator.handle(request).await)
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn create_volume(
    State(state): State<AppState>,
    Json(body): Json<CreateVolumeBody>,
) -> Response {
    info!(name = %body.name, size = %body.size, "Create volume requested");

    let size_bytes = match parse_capacity(&body.size) {
        Ok(bytes) => bytes,
        Err(e) => return error_response(e),
    };

    state
        .run(
            body.request_id,
            VolumeOperation::Create {
                name: body.name,
                size_bytes,
                capabilities: body.capabilities,
                volume_id: body.volume_id,
            },
        )
        .await
}

async fn list_volumes(State(state): State<AppState>) -> Response {
    respond(StatusCode::OK, state.orchestrator.list_volumes().await)
}

async fn get_volume(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(StatusCode::OK, state.orchestrator.get_volume(&id).await)
}

async fn delete_volume(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    state
        .run(None, VolumeOperation::Delete { volume_id: id })
        .await
}

async fn extend_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ExtendVolumeBody>,
) -> Response {
    let new_size_bytes = match parse_capacity(&body.new_size) {
        Ok(bytes) => bytes,
        Err(e) => return error_response(e),
    };

    state
        .run(
            body.request_id,
            VolumeOperation::Extend {
                volume_id: id,
                new_size_bytes,
            },
        )
        .await
}

async fn snapshot_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SnapshotBody>,
) -> Response {
    state
        .run(
            body.request_id,
            VolumeOperation::Snapshot {
                volume_id: id,
                name: body.name,
            },
        )
        .await
}

async fn clone_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CloneVolumeBody>,
) -> Response {
    info!(snapshot_id = %id, name = %body.name, "Clone volume requested");

    let size_bytes = match body.size.as_deref().map(parse_capacity).transpose() {
        Ok(size_bytes) => size_bytes,
        Err(e) => return error_response(e),
    };

    state
        .run(
            body.request_id,
            VolumeOperation::CreateFromSnapshot {
                name: body.name,
                snapshot_id: id,
                size_bytes,
                volume_id: body.volume_id,
            },
        )
        .await
}

async fn list_snapshots(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(StatusCode::OK, state.orchestrator.list_snapshots(&id).await)
}

async fn attach_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AttachBody>,
) -> Response {
    state
        .run(
            body.request_id,
            VolumeOperation::Attach {
                volume_id: id,
                connector: body.connector,
            },
        )
        .await
}

async fn detach_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DetachBody>,
) -> Response {
    state
        .run(
            body.request_id,
            VolumeOperation::Detach {
                volume_id: id,
                attachment_id: body.attachment_id,
            },
        )
        .await
}

async fn cancel_request(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.orchestrator.cancel(&id) {
        StatusCode::ACCEPTED.into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ApiErrorResponse {
                error: "request_not_found".into(),
                message: format!("Request {} is not in flight", id),
            }),
        )
            .into_response()
    }
}

async fn get_flow(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    respond(StatusCode::OK, state.orchestrator.get_flow(&id).await)
}

async fn list_backends(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.orchestrator.list_backends()))
}

async fn report_backend(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReportBody>,
) -> Response {
    let report = BackendReport {
        backend_id: BackendId::new(id),
        kind: body.kind,
        capacity: body.capacity,
        capabilities: body.capabilities,
        reserved_percentage: body.reserved_percentage,
        sequence_no: body.sequence_no,
    };

    match state.orchestrator.ingest_report(report) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_status(State(state): State<AppState>) -> Response {
    respond(StatusCode::OK, state.orchestrator.status().await)
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.orchestrator.registry().stats();
    if stats.fresh_backends > 0 {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no fresh backend reports")
    }
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Parse a size string (e.g., "100Gi", "1Ti") to bytes
pub fn parse_capacity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Validation("empty size".into()));
    }

    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let num_str = &s[..num_end];
    let unit_str = s[num_end..].trim();

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::Validation(format!("invalid size number: {}", num_str)))?;

    let multiplier: u64 = match unit_str.to_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KI" | "KIB" => 1024,
        "M" | "MB" | "MI" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GI" | "GIB" => 1024 * 1024 * 1024,
        "T" | "TB" | "TI" | "TIB" => 1024 * 1024 * 1024 * 1024,
        _ => return Err(Error::Validation(format!("unknown size unit: {}", unit_str))),
    };

    Ok((num * multiplier as f64) as u64)
}
