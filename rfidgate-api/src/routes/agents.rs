//! Agent REST API Routes
//!
//! Heartbeats from edge agents and the command queue between operators and
//! agents. Agents long-poll for commands and post replies; operators enqueue
//! and read results.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use rfidgate_agents::{
    AgentCommand, AgentQueue, AgentRegistry, CommandResult, EnqueueRequest, RegisterRequest,
    ReplyRequest, ResultState,
};
use rfidgate_core::AgentInfo;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::telemetry::with_metrics;

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PollRequest {
    pub agent_id: Option<String>,
    /// 1..=25, default 5
    #[cfg_attr(feature = "openapi", schema(value_type = Option<i64>))]
    pub max_items: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct RegisterResponse {
    pub ok: bool,
    pub agent: AgentInfo,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AgentListResponse {
    pub ok: bool,
    pub ttl_sec: u64,
    pub items: Vec<AgentInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EnqueueResponse {
    pub ok: bool,
    pub request_id: String,
    pub timeout_sec: i64,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PollResponse {
    pub ok: bool,
    pub agent_id: String,
    pub commands: Vec<AgentCommand>,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ReplyResponse {
    pub ok: bool,
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ResultResponse {
    pub ok: bool,
    #[serde(flatten)]
    pub result: CommandResult,
}

// ============================================================================
// REGISTRY HANDLERS
// ============================================================================

/// POST /api/v1/agents/register - Agent heartbeat
#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/api/v1/agents/register",
    tag = "Agents",
    request_body = RegisterRequest,
    responses(
        (status = 200, description = "Heartbeat recorded", body = RegisterResponse),
        (status = 401, description = "Missing or wrong ingest token", body = ApiError),
    ),
    security(("ingest_token" = []))
))]
pub async fn register_agent(
    State(registry): State<AgentRegistry>,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    let remote_addr = peer.map(|ConnectInfo(addr)| addr.ip().to_string());
    let agent = registry.register(req, remote_addr.as_deref());
    Ok(Json(RegisterResponse { ok: true, agent }))
}

/// GET /api/v1/agents - Agents seen within the heartbeat TTL
#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/api/v1/agents",
    tag = "Agents",
    responses(
        (status = 200, description = "Live agents, most recent first", body = AgentListResponse),
    ),
))]
pub async fn list_agents(State(registry): State<AgentRegistry>) -> impl IntoResponse {
    Json(AgentListResponse {
        ok: true,
        ttl_sec: registry.ttl_secs(),
        items: registry.list(),
    })
}

// ============================================================================
// QUEUE HANDLERS
// ============================================================================

/// POST /api/v1/agents/enqueue - Queue a command for an agent
#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/api/v1/agents/enqueue",
    tag = "Agents",
    request_body = EnqueueRequest,
    responses(
        (status = 200, description = "Command queued", body = EnqueueResponse),
        (status = 400, description = "Missing agent or command", body = ApiError),
    ),
))]
pub async fn enqueue(
    State(queue): State<AgentQueue>,
    Json(req): Json<EnqueueRequest>,
) -> ApiResult<impl IntoResponse> {
    let queued = queue.enqueue(req).await?;
    with_metrics(|m| m.record_agent_commands("enqueue", 1));
    Ok(Json(EnqueueResponse {
        ok: true,
        request_id: queued.request_id,
        timeout_sec: queued.timeout_sec,
    }))
}

/// POST /api/v1/agents/poll - Lease pending commands
#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/api/v1/agents/poll",
    tag = "Agents",
    request_body = PollRequest,
    responses(
        (status = 200, description = "Leased commands, oldest first", body = PollResponse),
        (status = 400, description = "Missing agent_id", body = ApiError),
        (status = 401, description = "Missing or wrong ingest token", body = ApiError),
    ),
    security(("ingest_token" = []))
))]
pub async fn poll(
    State(queue): State<AgentQueue>,
    Json(req): Json<PollRequest>,
) -> ApiResult<impl IntoResponse> {
    let (agent_id, commands) = queue
        .poll(req.agent_id.as_deref(), req.max_items.as_ref())
        .await?;
    with_metrics(|m| m.record_agent_commands("lease", commands.len()));
    Ok(Json(PollResponse {
        ok: true,
        agent_id,
        commands,
    }))
}

/// POST /api/v1/agents/reply - Report the outcome of a command
#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/api/v1/agents/reply",
    tag = "Agents",
    request_body = ReplyRequest,
    responses(
        (status = 200, description = "Reply recorded or already final", body = ReplyResponse),
        (status = 400, description = "Invalid reply", body = ApiError),
        (status = 404, description = "Unknown request", body = ApiError),
    ),
    security(("ingest_token" = []))
))]
pub async fn reply(
    State(queue): State<AgentQueue>,
    Json(req): Json<ReplyRequest>,
) -> ApiResult<impl IntoResponse> {
    let ack = queue.reply(req).await?;
    if ack.applied {
        with_metrics(|m| m.record_agent_commands("reply", 1));
    }
    Ok(Json(ReplyResponse {
        ok: true,
        applied: ack.applied,
    }))
}

/// GET /api/v1/agents/result/{request_id} - Outcome of a queued command
#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/api/v1/agents/result/{request_id}",
    tag = "Agents",
    params(("request_id" = String, Path, description = "Request id returned by enqueue")),
    responses(
        (status = 200, description = "pending, done or expired", body = ResultResponse),
    ),
))]
pub async fn result(
    State(queue): State<AgentQueue>,
    Path(request_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let result = queue.result(Some(&request_id)).await?;
    if result.state == ResultState::Expired {
        tracing::debug!(request_id = %request_id, "Result requested for unknown command");
    }
    Ok(Json(ResultResponse { ok: true, result }))
}

// ============================================================================
// ROUTERS
// ============================================================================

/// Agent-facing routes. Mounted behind the ingest token check.
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/agents/register", post(register_agent))
        .route("/agents/poll", post(poll))
        .route("/agents/reply", post(reply))
}

/// Operator-facing routes.
pub fn create_operator_router() -> Router<AppState> {
    Router::new()
        .route("/agents", get(list_agents))
        .route("/agents/enqueue", post(enqueue))
        .route("/agents/result/:request_id", get(result))
}
