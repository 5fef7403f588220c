//! Tag REST API Routes
//!
//! Print lifecycle of item tags: create, mark printed, retry after an error,
//! the lookups the label station and dashboards use, and per-EPC notes.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use rfidgate_core::TrackedTag;
use rfidgate_fulfillment::{CreateTagRequest, CreatedTag, PrintReport, TagInfo, TagRegistry};

use crate::error::{ApiError, ApiResult};
use crate::services::{
    SetTagNoteRequest, TagNoteResponse, TagNoteService, TagNotesQuery, TagNotesResponse,
};
use crate::state::AppState;
use crate::telemetry::with_metrics;

// ============================================================================
// QUERY / RESPONSE TYPES
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::IntoParams))]
pub struct RecentTagsQuery {
    /// 5..=200, default 50
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::IntoParams))]
pub struct TagEpcsQuery {
    /// Comma-separated statuses; defaults to Printed, Processing, Consumed
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TagInfoRequest {
    #[serde(default)]
    pub epcs: Vec<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TagListResponse<T> {
    pub ok: bool,
    pub count: usize,
    pub items: Vec<T>,
}

impl<T> TagListResponse<T> {
    fn new(items: Vec<T>) -> Self {
        Self {
            ok: true,
            count: items.len(),
            items,
        }
    }
}

fn parse_statuses(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

/// POST /api/v1/tags - Create a tag for an item quantity
#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/api/v1/tags",
    tag = "Tags",
    request_body = CreateTagRequest,
    responses(
        (status = 201, description = "Tag created", body = CreatedTag),
        (status = 200, description = "Tag already created for this client_request_id", body = CreatedTag),
        (status = 400, description = "Invalid request or unknown item", body = ApiError),
    ),
))]
pub async fn create_tag(
    State(tags): State<TagRegistry>,
    Json(req): Json<CreateTagRequest>,
) -> ApiResult<impl IntoResponse> {
    let created = tags.create_item_tag(req).await?;
    let status = if created.existing {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(created)))
}

/// GET /api/v1/tags - Most recently modified tags
#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/api/v1/tags",
    tag = "Tags",
    params(RecentTagsQuery),
    responses(
        (status = 200, description = "Recent tags", body = TagListResponse<TrackedTag>),
    ),
))]
pub async fn list_recent_tags(
    State(tags): State<TagRegistry>,
    Query(query): Query<RecentTagsQuery>,
) -> ApiResult<impl IntoResponse> {
    let items = tags.list_recent(query.limit).await?;
    Ok(Json(TagListResponse::new(items)))
}

/// POST /api/v1/tags/{epc}/printed - Confirm the label came off the printer
#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/api/v1/tags/{epc}/printed",
    tag = "Tags",
    params(("epc" = String, Path, description = "Tag EPC")),
    responses(
        (status = 200, description = "Tag marked printed", body = PrintReport),
        (status = 404, description = "Tag not found", body = ApiError),
    ),
))]
pub async fn mark_printed(
    State(tags): State<TagRegistry>,
    Path(epc): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let report = tags.mark_tag_printed(&epc).await?;
    with_metrics(|m| m.record_print_draft(report.stock_doc_created, report.stock_doc_error.is_some()));
    Ok(Json(report))
}

/// POST /api/v1/tags/{epc}/retry - Return an errored tag to Printed
#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/api/v1/tags/{epc}/retry",
    tag = "Tags",
    params(("epc" = String, Path, description = "Tag EPC")),
    responses(
        (status = 200, description = "Tag reset", body = TrackedTag),
        (status = 404, description = "Tag not found", body = ApiError),
        (status = 409, description = "Tag is not in Error", body = ApiError),
    ),
))]
pub async fn retry_tag(
    State(tags): State<TagRegistry>,
    Path(epc): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let tag = tags.retry_tag(&epc).await?;
    Ok(Json(tag))
}

/// GET /api/v1/tags/epcs - EPCs in the given statuses
#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/api/v1/tags/epcs",
    tag = "Tags",
    params(TagEpcsQuery),
    responses(
        (status = 200, description = "Matching EPCs", body = TagListResponse<String>),
        (status = 400, description = "Unknown status", body = ApiError),
    ),
))]
pub async fn list_tag_epcs(
    State(tags): State<TagRegistry>,
    Query(query): Query<TagEpcsQuery>,
) -> ApiResult<impl IntoResponse> {
    let statuses = parse_statuses(query.status.as_deref());
    let items = tags.list_epcs(&statuses, query.limit).await?;
    Ok(Json(TagListResponse::new(items)))
}

/// POST /api/v1/tags/info - Status and document links per EPC
#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/api/v1/tags/info",
    tag = "Tags",
    request_body = TagInfoRequest,
    responses(
        (status = 200, description = "Known tags in request order", body = TagListResponse<TagInfo>),
    ),
))]
pub async fn tag_info(
    State(tags): State<TagRegistry>,
    Json(req): Json<TagInfoRequest>,
) -> ApiResult<impl IntoResponse> {
    let items = tags.epc_info(&req.epcs, req.limit).await?;
    Ok(Json(TagListResponse::new(items)))
}

/// GET /api/v1/tags/notes - Notes for the given EPCs, or all notes
#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/api/v1/tags/notes",
    tag = "Tags",
    params(TagNotesQuery),
    responses(
        (status = 200, description = "Notes keyed by EPC", body = TagNotesResponse),
    ),
))]
pub async fn list_tag_notes(
    State(notes): State<TagNoteService>,
    Query(query): Query<TagNotesQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(notes.list(&query).await?))
}

/// PUT /api/v1/tags/notes/{epc} - Set or clear the note on an EPC
#[cfg_attr(feature = "openapi", utoipa::path(
    put,
    path = "/api/v1/tags/notes/{epc}",
    tag = "Tags",
    params(("epc" = String, Path, description = "Tag EPC")),
    request_body = SetTagNoteRequest,
    responses(
        (status = 200, description = "Note written, or deleted when blank", body = TagNoteResponse),
        (status = 400, description = "EPC has no hex digits", body = ApiError),
    ),
))]
pub async fn set_tag_note(
    State(notes): State<TagNoteService>,
    Path(epc): Path<String>,
    Json(req): Json<SetTagNoteRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(notes.set(&epc, &req).await?))
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_tag).get(list_recent_tags))
        .route("/epcs", get(list_tag_epcs))
        .route("/info", post(tag_info))
        .route("/notes", get(list_tag_notes))
        .route("/notes/:epc", put(set_tag_note))
        .route("/:epc/printed", post(mark_printed))
        .route("/:epc/retry", post(retry_tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_statuses() {
        assert!(parse_statuses(None).is_empty());
        assert_eq!(
            parse_statuses(Some("Printed, Consumed,,")),
            vec!["Printed".to_string(), "Consumed".to_string()]
        );
    }
}
