//! Ingest REST API Routes
//!
//! Reader and scale agents post here; dashboards read the live side
//! (scale weight, antenna statistics, saved tags) back out.

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use rfidgate_core::AntennaStat;

use crate::error::ApiResult;
use crate::services::{
    ClearSavedTagsQuery, IngestService, IngestTagsRequest, IngestTagsResponse, SavedTagService,
    SavedTagsQuery, SavedTagsResponse, ScaleIngestRequest, ScaleIngestResponse,
    ScaleWeightResponse,
};
use crate::state::AppState;

#[derive(Debug, Clone, Default, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::IntoParams))]
pub struct ScaleWeightQuery {
    pub device: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AntennaStatsResponse {
    pub ok: bool,
    pub items: Vec<AntennaStat>,
}

// ============================================================================
// INGEST HANDLERS
// ============================================================================

/// POST /api/v1/ingest/tags - Ingest a batch of raw reads
#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/api/v1/ingest/tags",
    tag = "Ingest",
    request_body = IngestTagsRequest,
    responses(
        (status = 200, description = "Reads ingested", body = IngestTagsResponse),
        (status = 400, description = "Invalid request", body = crate::error::ApiError),
        (status = 401, description = "Missing or wrong ingest token", body = crate::error::ApiError),
        (status = 409, description = "Sequence conflict", body = crate::error::ApiError),
    ),
    security(("ingest_token" = []))
))]
pub async fn ingest_tags(
    State(ingest): State<IngestService>,
    Json(req): Json<IngestTagsRequest>,
) -> ApiResult<impl IntoResponse> {
    let response = ingest.ingest_tags(req).await?;
    Ok(Json(response))
}

/// POST /api/v1/ingest/scale - Ingest one scale reading
#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/api/v1/ingest/scale",
    tag = "Ingest",
    request_body = ScaleIngestRequest,
    responses(
        (status = 200, description = "Reading accepted", body = ScaleIngestResponse),
        (status = 400, description = "Missing or invalid weight", body = crate::error::ApiError),
        (status = 401, description = "Missing or wrong ingest token", body = crate::error::ApiError),
        (status = 409, description = "Sequence conflict", body = crate::error::ApiError),
    ),
    security(("ingest_token" = []))
))]
pub async fn ingest_scale(
    State(ingest): State<IngestService>,
    Json(req): Json<ScaleIngestRequest>,
) -> ApiResult<impl IntoResponse> {
    let response = ingest.ingest_scale(req).await?;
    Ok(Json(response))
}

// ============================================================================
// READ-SIDE HANDLERS
// ============================================================================

/// GET /api/v1/scale/weight - Latest reading for a device, or of any scale
#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/api/v1/scale/weight",
    tag = "Ingest",
    params(ScaleWeightQuery),
    responses(
        (status = 200, description = "Cached reading, if any", body = ScaleWeightResponse),
    ),
))]
pub async fn scale_weight(
    State(ingest): State<IngestService>,
    Query(query): Query<ScaleWeightQuery>,
) -> impl IntoResponse {
    Json(ingest.scale_weight(query.device.as_deref()))
}

/// GET /api/v1/antenna/stats - Live per-antenna read counts
#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/api/v1/antenna/stats",
    tag = "Ingest",
    responses(
        (status = 200, description = "Antenna statistics", body = AntennaStatsResponse),
    ),
))]
pub async fn antenna_stats(State(ingest): State<IngestService>) -> impl IntoResponse {
    Json(AntennaStatsResponse {
        ok: true,
        items: ingest.antenna_stats(),
    })
}

/// GET /api/v1/saved-tags - Saved tag tallies
#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/api/v1/saved-tags",
    tag = "Ingest",
    params(SavedTagsQuery),
    responses(
        (status = 200, description = "Saved tags", body = SavedTagsResponse),
        (status = 400, description = "Invalid date", body = crate::error::ApiError),
    ),
))]
pub async fn list_saved_tags(
    State(saved): State<SavedTagService>,
    Query(query): Query<SavedTagsQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(saved.list(&query).await?))
}

/// DELETE /api/v1/saved-tags - Clear all tallies, or one day's
#[cfg_attr(feature = "openapi", utoipa::path(
    delete,
    path = "/api/v1/saved-tags",
    tag = "Ingest",
    params(ClearSavedTagsQuery),
    responses(
        (status = 200, description = "Tallies cleared"),
        (status = 400, description = "Invalid date", body = crate::error::ApiError),
    ),
))]
pub async fn clear_saved_tags(
    State(saved): State<SavedTagService>,
    Query(query): Query<ClearSavedTagsQuery>,
) -> ApiResult<impl IntoResponse> {
    saved.clear(query.date.as_deref()).await?;
    tracing::info!(date = ?query.date, "Saved tags cleared");
    Ok(Json(json!({ "ok": true })))
}

// ============================================================================
// ROUTERS
// ============================================================================

/// Agent-facing ingest routes. Mounted behind the ingest token check.
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/tags", post(ingest_tags))
        .route("/scale", post(ingest_scale))
}

/// Dashboard-facing read-outs.
pub fn create_readout_router() -> Router<AppState> {
    Router::new()
        .route("/scale/weight", get(scale_weight))
        .route("/antenna/stats", get(antenna_stats))
        .route("/saved-tags", get(list_saved_tags).delete(clear_saved_tags))
}
