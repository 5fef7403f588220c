//! Agent command queue.
//!
//! Requests move `Queued -> Sent -> Done | Failed`. A poll only hands out the
//! requests whose lease it actually won, so two agents polling the same queue
//! never receive the same command. A Sent request whose lease lapses becomes
//! pollable again; there is no explicit cancel.

use chrono::Duration;
use rfidgate_core::normalize::{
    clean_text, sanitize_agent_id, truncate_chars, value_as_bool, value_as_i64, MAX_ERROR_LEN,
};
use rfidgate_core::{
    AgentCompletion, AgentRequest, AgentRequestStatus, Clock, EntityType, RealtimeEvent,
    RealtimePublisher, RfidConfig, RfidResult, StorageError, TokenSource, ValidationError,
};
use rfidgate_storage::RecordStore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_ITEMS: usize = 5;
pub const MAX_POLL_ITEMS: usize = 25;
pub const MAX_COMMAND_LEN: usize = 64;
pub const TIMEOUT_ERROR: &str = "timeout";

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EnqueueRequest {
    pub agent_id: Option<String>,
    pub command: Option<String>,
    /// Object, JSON-encoded object, or a scalar wrapped as `{"value": x}`.
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub args: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<i64>))]
    pub timeout_sec: Option<Value>,
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Enqueued {
    pub request_id: String,
    pub timeout_sec: i64,
}

/// A leased command as handed to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AgentCommand {
    pub request_id: String,
    pub agent_id: String,
    pub cmd: String,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub args: Value,
    pub requested_by: Option<String>,
    /// Enqueue time, milliseconds since the epoch.
    pub ts: i64,
    pub timeout_sec: i64,
}

impl From<AgentRequest> for AgentCommand {
    fn from(request: AgentRequest) -> Self {
        Self {
            ts: request.request_ts.timestamp_millis(),
            request_id: request.request_id,
            agent_id: request.agent_id,
            cmd: request.command,
            args: request.args,
            requested_by: request.requested_by,
            timeout_sec: request.timeout_sec,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ReplyRequest {
    pub agent_id: Option<String>,
    pub request_id: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<bool>))]
    pub ok: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Terminal outcome of a command, as reported to the requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AgentReply {
    pub request_id: String,
    pub agent_id: String,
    pub ok: bool,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Reply time, milliseconds since the epoch.
    pub ts: i64,
}

impl AgentReply {
    fn from_request(request: &AgentRequest) -> Self {
        Self {
            request_id: request.request_id.clone(),
            agent_id: request.agent_id.clone(),
            ok: request.status == AgentRequestStatus::Done,
            result: request.result.clone(),
            error: request.error.clone(),
            ts: request
                .replied_at
                .unwrap_or(request.request_ts)
                .timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ReplyAck {
    /// False when the request was already finished; nothing changed.
    pub applied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum ResultState {
    Pending,
    Done,
    /// Unknown request id, most likely aged out of storage.
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CommandResult {
    pub state: ResultState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<AgentReply>,
}

// ============================================================================
// QUEUE
// ============================================================================

fn required_agent_id(raw: Option<&str>) -> Result<String, ValidationError> {
    let agent_id = raw.map(sanitize_agent_id).unwrap_or_default();
    if agent_id.is_empty() {
        return Err(ValidationError::missing("agent_id"));
    }
    Ok(agent_id)
}

fn required_request_id(raw: Option<&str>) -> Result<String, ValidationError> {
    raw.and_then(|s| clean_text(s, 64))
        .ok_or_else(|| ValidationError::missing("request_id"))
}

/// Coerce command args to a JSON object.
pub fn normalize_args(raw: Option<&Value>) -> Value {
    let parsed = match raw {
        None | Some(Value::Null) => return json!({}),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(v) => v,
            Err(_) => return json!({}),
        },
        Some(v) => v.clone(),
    };
    match parsed {
        Value::Object(_) => parsed,
        Value::Null => json!({}),
        other => json!({ "value": other }),
    }
}

#[derive(Clone)]
pub struct AgentQueue {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    tokens: Arc<dyn TokenSource>,
    publisher: Arc<dyn RealtimePublisher>,
    config: RfidConfig,
}

impl AgentQueue {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        tokens: Arc<dyn TokenSource>,
        publisher: Arc<dyn RealtimePublisher>,
        config: RfidConfig,
    ) -> Self {
        Self {
            store,
            clock,
            tokens,
            publisher,
            config,
        }
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> RfidResult<Enqueued> {
        let agent_id = required_agent_id(request.agent_id.as_deref())?;
        let command = request
            .command
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ValidationError::missing("command"))?;
        if command.chars().count() > MAX_COMMAND_LEN {
            return Err(ValidationError::invalid(
                "command",
                format!("at most {} characters", MAX_COMMAND_LEN),
            )
            .into());
        }
        let timeout_sec = self
            .config
            .rpc_timeout_secs(request.timeout_sec.as_ref().and_then(value_as_i64));

        let queued = AgentRequest {
            request_id: self.tokens.request_id(),
            agent_id,
            command: command.to_string(),
            args: normalize_args(request.args.as_ref()),
            requested_by: request.requested_by.as_deref().and_then(|s| clean_text(s, 140)),
            status: AgentRequestStatus::Queued,
            timeout_sec,
            lease_expires_at: None,
            result: None,
            error: None,
            request_ts: self.clock.now(),
            sent_at: None,
            replied_at: None,
        };
        self.store.agent_request_insert(&queued).await?;
        info!(
            request_id = %queued.request_id,
            agent_id = %queued.agent_id,
            command = %queued.command,
            timeout_sec,
            "Agent command queued"
        );
        Ok(Enqueued {
            request_id: queued.request_id,
            timeout_sec,
        })
    }

    /// Lease up to `max_items` commands for `agent_id`, oldest first. Each
    /// lease lasts the request's `timeout_sec`.
    pub async fn poll(
        &self,
        raw_agent_id: Option<&str>,
        max_items: Option<&Value>,
    ) -> RfidResult<(String, Vec<AgentCommand>)> {
        let agent_id = required_agent_id(raw_agent_id)?;
        let limit = max_items
            .and_then(value_as_i64)
            .map(|n| n.clamp(1, MAX_POLL_ITEMS as i64) as usize)
            .unwrap_or(DEFAULT_POLL_ITEMS);

        let now = self.clock.now();
        let candidates = self
            .store
            .agent_request_list_pollable(&agent_id, now, limit)
            .await?;

        let mut leased = Vec::with_capacity(candidates.len());
        for request in candidates {
            let lease_until = now + Duration::seconds(request.timeout_sec);
            if self
                .store
                .agent_request_lease(&request.request_id, now, lease_until)
                .await?
            {
                leased.push(AgentCommand::from(request));
            } else {
                debug!(request_id = %request.request_id, "Lease lost to another poller");
            }
        }
        if !leased.is_empty() {
            debug!(agent_id = %agent_id, count = leased.len(), "Agent commands leased");
        }
        Ok((agent_id, leased))
    }

    /// Record the agent's answer. Only the first reply to a request counts.
    pub async fn reply(&self, request: ReplyRequest) -> RfidResult<ReplyAck> {
        let agent_id = required_agent_id(request.agent_id.as_deref())?;
        let request_id = required_request_id(request.request_id.as_deref())?;
        let Some(queued) = self.store.agent_request_get(&request_id).await? else {
            return Err(StorageError::NotFound {
                entity_type: EntityType::AgentRequest,
                key: request_id,
            }
            .into());
        };
        if queued.agent_id != agent_id {
            return Err(ValidationError::invalid(
                "agent_id",
                format!("request {} belongs to another agent", request_id),
            )
            .into());
        }

        let ok = request
            .ok
            .as_ref()
            .and_then(value_as_bool)
            .unwrap_or(request.error.is_none());
        let completion = AgentCompletion {
            status: if ok {
                AgentRequestStatus::Done
            } else {
                AgentRequestStatus::Failed
            },
            result: if ok { request.result.clone() } else { None },
            error: (!ok).then(|| truncate_chars(request.error.as_deref().unwrap_or(""), MAX_ERROR_LEN)),
            replied_at: self.clock.now(),
        };
        let applied = self
            .store
            .agent_request_complete(&request_id, &completion)
            .await?;
        if !applied {
            debug!(request_id = %request_id, "Reply for finished request ignored");
            return Ok(ReplyAck { applied });
        }

        info!(request_id = %request_id, agent_id = %agent_id, ok, "Agent command replied");
        let finished = AgentRequest {
            status: completion.status,
            result: completion.result,
            error: completion.error,
            replied_at: Some(completion.replied_at),
            lease_expires_at: None,
            ..queued
        };
        self.notify(&finished);
        Ok(ReplyAck { applied })
    }

    /// Current state of a request. Requests past their timeout are failed
    /// with `"timeout"` on read.
    pub async fn result(&self, raw_request_id: Option<&str>) -> RfidResult<CommandResult> {
        let request_id = required_request_id(raw_request_id)?;
        let Some(mut request) = self.store.agent_request_get(&request_id).await? else {
            return Ok(CommandResult {
                state: ResultState::Expired,
                reply: None,
            });
        };

        if !request.status.is_terminal() && request.is_timed_out(self.clock.now()) {
            self.expire(&request).await?;
            match self.store.agent_request_get(&request_id).await? {
                Some(current) => request = current,
                None => {
                    return Ok(CommandResult {
                        state: ResultState::Expired,
                        reply: None,
                    })
                }
            }
        }

        if request.status.is_terminal() {
            Ok(CommandResult {
                state: ResultState::Done,
                reply: Some(AgentReply::from_request(&request)),
            })
        } else {
            Ok(CommandResult {
                state: ResultState::Pending,
                reply: None,
            })
        }
    }

    async fn expire(&self, request: &AgentRequest) -> RfidResult<()> {
        let completion = AgentCompletion {
            status: AgentRequestStatus::Failed,
            result: None,
            error: Some(TIMEOUT_ERROR.to_string()),
            replied_at: self.clock.now(),
        };
        if self
            .store
            .agent_request_complete(&request.request_id, &completion)
            .await?
        {
            warn!(
                request_id = %request.request_id,
                agent_id = %request.agent_id,
                timeout_sec = request.timeout_sec,
                "Agent command timed out"
            );
        }
        Ok(())
    }

    fn notify(&self, request: &AgentRequest) {
        let reply = match serde_json::to_value(AgentReply::from_request(request)) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(request_id = %request.request_id, error = %e, "Agent reply not serializable");
                return;
            }
        };
        let published = self.publisher.publish(RealtimeEvent::AgentReply {
            requested_by: request.requested_by.clone(),
            reply,
        });
        if let Err(e) = published {
            warn!(request_id = %request.request_id, error = %e, "Agent reply broadcast failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_args() {
        assert_eq!(normalize_args(None), json!({}));
        assert_eq!(normalize_args(Some(&json!({"n": 1}))), json!({"n": 1}));
        assert_eq!(normalize_args(Some(&json!("{\"n\": 2}"))), json!({"n": 2}));
        assert_eq!(normalize_args(Some(&json!("[1,2]"))), json!({"value": [1, 2]}));
        assert_eq!(normalize_args(Some(&json!(7))), json!({"value": 7}));
        assert_eq!(normalize_args(Some(&json!("not json"))), json!({}));
    }

    #[test]
    fn test_result_state_wire_names() {
        let result = CommandResult {
            state: ResultState::Expired,
            reply: None,
        };
        assert_eq!(serde_json::to_value(result).unwrap(), json!({"state": "expired"}));
    }
}
