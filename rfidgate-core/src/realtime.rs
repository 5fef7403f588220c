//! Realtime broadcast seam.
//!
//! Publishing is fire-and-forget: callers log failures and carry on.

use crate::{ScaleReading, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Events pushed to UI subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RealtimeEvent {
    /// Aggregated tag reads from one ingest call.
    TagBatch {
        device: String,
        ts: Option<i64>,
        tags: Vec<Value>,
    },
    ScaleWeight { reading: ScaleReading },
    /// Reply to a queued agent command, addressed to whoever enqueued it.
    AgentReply {
        requested_by: Option<String>,
        reply: Value,
    },
    BatchStateChanged {
        device_id: String,
        event_id: String,
        at: Timestamp,
    },
}

impl RealtimeEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            RealtimeEvent::TagBatch { .. } => "tag_batch",
            RealtimeEvent::ScaleWeight { .. } => "scale_weight",
            RealtimeEvent::AgentReply { .. } => "agent_reply",
            RealtimeEvent::BatchStateChanged { .. } => "batch_state_changed",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("Realtime channel closed")]
    Closed,

    #[error("Realtime publish failed: {reason}")]
    Failed { reason: String },
}

pub trait RealtimePublisher: Send + Sync {
    /// Returns the number of subscribers reached. Zero subscribers is not a
    /// failure.
    fn publish(&self, event: RealtimeEvent) -> Result<usize, PublishError>;
}

/// Publisher that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPublisher;

impl RealtimePublisher for NullPublisher {
    fn publish(&self, _event: RealtimeEvent) -> Result<usize, PublishError> {
        Ok(0)
    }
}
