//! OpenAPI Specification for the RFIDGATE API
//!
//! Generated by utoipa from the route annotations and the request and
//! response types.

use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::error::{ApiError, ErrorCode};
use crate::middleware::INGEST_TOKEN_HEADER;
use crate::routes::health::{ComponentHealth, HealthDetails, HealthResponse, HealthStatus};
use crate::routes::{agents, edge, health, ingest, rules, tags};
use crate::services::{
    IngestTagsRequest, IngestTagsResponse, SavedTagsResponse, ScaleIngestRequest,
    ScaleIngestResponse, ScaleWeightResponse, SetTagNoteRequest, TagNoteResponse,
    TagNotesResponse,
};

use rfidgate_agents::{
    AgentCommand, AgentReply, CommandResult, EnqueueRequest, RegisterRequest, ReplyRequest,
    ResultState,
};
use rfidgate_core::{
    AgentInfo, AntennaRule, AntennaStat, BatchState, BatchStatus, DeliverySettings, SavedTag,
    ScaleReading, TagStatus, TrackedTag,
};
use rfidgate_events::EdgeRequest;
use rfidgate_fulfillment::{
    CreateTagRequest, CreatedTag, EpcOutcome, EpcReport, FulfillmentReport, PrintReport, TagInfo,
    UpsertRuleRequest,
};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "RFIDGATE API",
        version = "0.1.0",
        description = "RFID gate ingestion, batch tracking and ERP fulfillment for warehouse docks",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "http://localhost:8787", description = "Local Development")
    ),
    tags(
        (name = "Ingest", description = "Reader and scale ingestion, live read-outs and saved tags"),
        (name = "Edge", description = "Batch lifecycle events from edge agents"),
        (name = "Tags", description = "Tag print lifecycle and lookups"),
        (name = "Rules", description = "Per-antenna fulfillment rules"),
        (name = "Agents", description = "Agent heartbeats and the command queue"),
        (name = "Health", description = "Liveness and readiness checks"),
        (name = "Observability", description = "Prometheus metrics")
    ),
    paths(
        // === Ingest Routes ===
        ingest::ingest_tags,
        ingest::ingest_scale,
        ingest::scale_weight,
        ingest::antenna_stats,
        ingest::list_saved_tags,
        ingest::clear_saved_tags,
        // === Edge Routes ===
        edge::batch_start,
        edge::batch_stop,
        edge::product_switch,
        edge::device_status,
        edge::event_report,
        edge::get_batch_state,
        // === Tag Routes ===
        tags::create_tag,
        tags::list_recent_tags,
        tags::mark_printed,
        tags::retry_tag,
        tags::list_tag_epcs,
        tags::tag_info,
        tags::list_tag_notes,
        tags::set_tag_note,
        // === Rule Routes ===
        rules::list_rules,
        rules::upsert_rule,
        rules::delete_rule,
        rules::list_delivery_settings,
        // === Agent Routes ===
        agents::register_agent,
        agents::list_agents,
        agents::enqueue,
        agents::poll,
        agents::reply,
        agents::result,
        // === Health & Metrics ===
        health::ping,
        health::readiness,
        crate::telemetry::metrics::metrics_handler,
    ),
    components(
        schemas(
            ApiError,
            ErrorCode,
            IngestTagsRequest,
            IngestTagsResponse,
            ScaleIngestRequest,
            ScaleIngestResponse,
            ScaleWeightResponse,
            ScaleReading,
            AntennaStat,
            ingest::AntennaStatsResponse,
            SavedTag,
            SavedTagsResponse,
            EdgeRequest,
            edge::EdgeResponse,
            BatchState,
            BatchStatus,
            FulfillmentReport,
            EpcReport,
            EpcOutcome,
            CreateTagRequest,
            CreatedTag,
            PrintReport,
            TagInfo,
            TrackedTag,
            TagStatus,
            tags::TagInfoRequest,
            SetTagNoteRequest,
            TagNoteResponse,
            TagNotesResponse,
            AntennaRule,
            UpsertRuleRequest,
            rules::RuleListResponse,
            rules::RuleResponse,
            rules::RuleDeletedResponse,
            DeliverySettings,
            rules::DeliverySettingsResponse,
            AgentInfo,
            RegisterRequest,
            EnqueueRequest,
            ReplyRequest,
            AgentCommand,
            AgentReply,
            CommandResult,
            ResultState,
            agents::PollRequest,
            agents::RegisterResponse,
            agents::AgentListResponse,
            agents::EnqueueResponse,
            agents::PollResponse,
            agents::ReplyResponse,
            agents::ResultResponse,
            HealthResponse,
            HealthStatus,
            HealthDetails,
            ComponentHealth,
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Registers the ingest token header scheme.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "ingest_token",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new(INGEST_TOKEN_HEADER))),
            );
        }
    }
}

impl ApiDoc {
    /// Generate OpenAPI spec as pretty-printed JSON string.
    pub fn to_json() -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&Self::openapi())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_generation() -> Result<(), String> {
        let openapi = ApiDoc::openapi();
        assert_eq!(openapi.info.title, "RFIDGATE API");

        for path in [
            "/api/v1/ingest/tags",
            "/api/v1/edge/batch-start",
            "/api/v1/edge/state/{device_id}",
            "/api/v1/tags/{epc}/printed",
            "/api/v1/agents/result/{request_id}",
            "/api/v1/tags/notes/{epc}",
            "/api/v1/delivery-settings",
            "/health/ready",
        ] {
            assert!(openapi.paths.paths.contains_key(path), "missing path {}", path);
        }

        let components = openapi
            .components
            .as_ref()
            .ok_or_else(|| "OpenAPI components missing".to_string())?;
        assert!(components.security_schemes.contains_key("ingest_token"));
        assert!(components.schemas.contains_key("EdgeRequest"));
        Ok(())
    }

    #[test]
    fn test_openapi_json_serialization() -> Result<(), String> {
        let json = ApiDoc::to_json().map_err(|e| format!("Failed to serialize OpenAPI: {}", e))?;
        let value: serde_json::Value =
            serde_json::from_str(&json).map_err(|e| format!("Generated JSON invalid: {}", e))?;
        assert!(value["openapi"].as_str().is_some_and(|v| v.starts_with("3.")));
        Ok(())
    }
}
