//! Edge REST API Routes
//!
//! Batch lifecycle events posted by edge agents. Every call is logged once
//! per `event_id`; replays are acknowledged with `duplicate: true`.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use rfidgate_core::RfidResult;
use rfidgate_events::{BatchService, EdgeAck, EdgeRequest};

use crate::error::{ApiError, ApiResult};
use crate::services::record_edge_outcome;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EdgeResponse {
    pub ok: bool,
    pub event_id: String,
    pub duplicate: bool,
}

fn respond(op: &str, result: RfidResult<EdgeAck>) -> ApiResult<Json<EdgeResponse>> {
    record_edge_outcome(op, result.as_ref().map(|ack| ack.duplicate));
    let ack = result?;
    Ok(Json(EdgeResponse {
        ok: true,
        event_id: ack.event_id,
        duplicate: ack.duplicate,
    }))
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

/// POST /api/v1/edge/batch-start - Start a batch on a device
#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/api/v1/edge/batch-start",
    tag = "Edge",
    request_body = EdgeRequest,
    responses(
        (status = 200, description = "Event accepted or replayed", body = EdgeResponse),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 409, description = "Sequence or batch conflict", body = ApiError),
    ),
    security(("ingest_token" = []))
))]
pub async fn batch_start(
    State(batches): State<BatchService>,
    Json(req): Json<EdgeRequest>,
) -> ApiResult<impl IntoResponse> {
    respond("batch_start", batches.batch_start(req).await)
}

/// POST /api/v1/edge/batch-stop - Stop the running batch
#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/api/v1/edge/batch-stop",
    tag = "Edge",
    request_body = EdgeRequest,
    responses(
        (status = 200, description = "Event accepted or replayed", body = EdgeResponse),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 409, description = "Sequence or batch conflict", body = ApiError),
    ),
    security(("ingest_token" = []))
))]
pub async fn batch_stop(
    State(batches): State<BatchService>,
    Json(req): Json<EdgeRequest>,
) -> ApiResult<impl IntoResponse> {
    respond("batch_stop", batches.batch_stop(req).await)
}

/// POST /api/v1/edge/product-switch - Switch the product of a running batch
#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/api/v1/edge/product-switch",
    tag = "Edge",
    request_body = EdgeRequest,
    responses(
        (status = 200, description = "Event accepted or replayed", body = EdgeResponse),
        (status = 400, description = "Invalid request or unknown product", body = ApiError),
        (status = 409, description = "Sequence or batch conflict", body = ApiError),
    ),
    security(("ingest_token" = []))
))]
pub async fn product_switch(
    State(batches): State<BatchService>,
    Json(req): Json<EdgeRequest>,
) -> ApiResult<impl IntoResponse> {
    respond("product_switch", batches.product_switch(req).await)
}

/// POST /api/v1/edge/device-status - Report device status
#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/api/v1/edge/device-status",
    tag = "Edge",
    request_body = EdgeRequest,
    responses(
        (status = 200, description = "Event accepted or replayed", body = EdgeResponse),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 409, description = "Sequence conflict", body = ApiError),
    ),
    security(("ingest_token" = []))
))]
pub async fn device_status(
    State(batches): State<BatchService>,
    Json(req): Json<EdgeRequest>,
) -> ApiResult<impl IntoResponse> {
    respond("device_status", batches.device_status(req).await)
}

/// POST /api/v1/edge/event-report - Free-form event from the device
#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/api/v1/edge/event-report",
    tag = "Edge",
    request_body = EdgeRequest,
    responses(
        (status = 200, description = "Event accepted or replayed", body = EdgeResponse),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 409, description = "Sequence or batch conflict", body = ApiError),
    ),
    security(("ingest_token" = []))
))]
pub async fn event_report(
    State(batches): State<BatchService>,
    Json(req): Json<EdgeRequest>,
) -> ApiResult<impl IntoResponse> {
    respond("event_report", batches.event_report(req).await)
}

/// GET /api/v1/edge/state/{device_id} - Current batch state of a device
#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/api/v1/edge/state/{device_id}",
    tag = "Edge",
    params(("device_id" = String, Path, description = "Device identifier")),
    responses(
        (status = 200, description = "Batch state", body = rfidgate_core::BatchState),
        (status = 404, description = "Device never seen", body = ApiError),
    ),
    security(("ingest_token" = []))
))]
pub async fn get_batch_state(
    State(batches): State<BatchService>,
    Path(device_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let state = batches
        .get_batch_state(&device_id)
        .await?
        .ok_or_else(|| ApiError::entity_not_found("batch_state", &device_id))?;
    Ok(Json(state))
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/batch-start", post(batch_start))
        .route("/batch-stop", post(batch_stop))
        .route("/product-switch", post(product_switch))
        .route("/device-status", post(device_status))
        .route("/event-report", post(event_report))
        .route("/state/:device_id", get(get_batch_state))
}
