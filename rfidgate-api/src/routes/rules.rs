//! Antenna rule administration, plus the read-only delivery settings listing
//! operators check rules against.

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use rfidgate_core::{AntennaRule, DeliverySettings};
use rfidgate_fulfillment::{RuleService, UpsertRuleRequest};
use rfidgate_storage::ItemCatalog;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Clone, Default, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::IntoParams))]
pub struct DeleteRuleQuery {
    /// Device key; omitted means the `any` rule
    pub device: Option<String>,
    #[serde(alias = "ant_id")]
    #[cfg_attr(feature = "openapi", param(value_type = Option<u8>))]
    pub antenna_id: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct RuleListResponse {
    pub ok: bool,
    pub items: Vec<AntennaRule>,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct RuleResponse {
    pub ok: bool,
    pub rule: AntennaRule,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct RuleDeletedResponse {
    pub ok: bool,
    pub deleted: bool,
}

/// Cap on the delivery settings listing.
pub const DELIVERY_SETTINGS_LIMIT: usize = 500;

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct DeliverySettingsResponse {
    pub ok: bool,
    pub items: Vec<DeliverySettings>,
}

/// GET /api/v1/antenna/rules - Rules ordered by (device, antenna)
#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/api/v1/antenna/rules",
    tag = "Rules",
    responses(
        (status = 200, description = "Antenna rules", body = RuleListResponse),
    ),
))]
pub async fn list_rules(State(rules): State<RuleService>) -> ApiResult<impl IntoResponse> {
    let items = rules.list().await?;
    Ok(Json(RuleListResponse { ok: true, items }))
}

/// PUT /api/v1/antenna/rules - Create or replace the rule for (device, antenna)
#[cfg_attr(feature = "openapi", utoipa::path(
    put,
    path = "/api/v1/antenna/rules",
    tag = "Rules",
    request_body = UpsertRuleRequest,
    responses(
        (status = 200, description = "Rule stored", body = RuleResponse),
        (status = 400, description = "Antenna out of range", body = ApiError),
    ),
))]
pub async fn upsert_rule(
    State(rules): State<RuleService>,
    Json(req): Json<UpsertRuleRequest>,
) -> ApiResult<impl IntoResponse> {
    let rule = rules.upsert(req).await?;
    Ok(Json(RuleResponse { ok: true, rule }))
}

/// DELETE /api/v1/antenna/rules - Remove the rule for (device, antenna)
#[cfg_attr(feature = "openapi", utoipa::path(
    delete,
    path = "/api/v1/antenna/rules",
    tag = "Rules",
    params(DeleteRuleQuery),
    responses(
        (status = 200, description = "Whether a rule was removed", body = RuleDeletedResponse),
        (status = 400, description = "Antenna out of range", body = ApiError),
    ),
))]
pub async fn delete_rule(
    State(rules): State<RuleService>,
    Query(query): Query<DeleteRuleQuery>,
) -> ApiResult<impl IntoResponse> {
    let deleted = rules
        .delete(query.device.as_deref(), query.antenna_id.as_ref())
        .await?;
    Ok(Json(RuleDeletedResponse { ok: true, deleted }))
}

/// GET /api/v1/delivery-settings - Per-item delivery note settings
#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/api/v1/delivery-settings",
    tag = "Rules",
    responses(
        (status = 200, description = "Settings ordered by item code", body = DeliverySettingsResponse),
    ),
))]
pub async fn list_delivery_settings(
    State(catalog): State<Arc<dyn ItemCatalog>>,
) -> ApiResult<impl IntoResponse> {
    let items = catalog.delivery_settings_list(DELIVERY_SETTINGS_LIMIT).await?;
    Ok(Json(DeliverySettingsResponse { ok: true, items }))
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route(
            "/antenna/rules",
            get(list_rules).put(upsert_rule).delete(delete_rule),
        )
        .route("/delivery-settings", get(list_delivery_settings))
}
