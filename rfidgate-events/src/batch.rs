//! Edge endpoints: batch start/stop, product switch, device status and
//! event reports.

use crate::log::{EdgeEventInput, EdgeEventLog, IngestOutcome};
use crate::transition::BatchOp;
use rfidgate_core::normalize::{
    clean_text, normalize_batch_id, normalize_device_id, normalize_event_id, normalize_seq,
};
use rfidgate_core::{
    BatchState, BatchStatus, RealtimeEvent, RealtimePublisher, RfidResult, ValidationError,
};
use rfidgate_storage::ItemCatalog;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;

const MAX_PRODUCT_LEN: usize = 140;
const MAX_REASON_LEN: usize = 140;

/// Body shared by every edge endpoint. Each endpoint reads the fields it
/// needs and ignores the rest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EdgeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, alias = "device", skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<i64>))]
    pub seq: Option<Value>,
    #[serde(default, alias = "item_code", skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_product: Option<String>,
    #[serde(default, alias = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EdgeAck {
    pub event_id: String,
    pub duplicate: bool,
}

impl From<IngestOutcome> for EdgeAck {
    fn from(outcome: IngestOutcome) -> Self {
        EdgeAck {
            event_id: outcome.event_id().to_string(),
            duplicate: outcome.is_duplicate(),
        }
    }
}

struct Envelope {
    event_id: String,
    device_id: String,
    batch_id: Option<String>,
    seq: Option<i64>,
}

/// Batch state machine front door.
#[derive(Clone)]
pub struct BatchService {
    log: EdgeEventLog,
    catalog: Arc<dyn ItemCatalog>,
    publisher: Arc<dyn RealtimePublisher>,
}

impl BatchService {
    pub fn new(
        log: EdgeEventLog,
        catalog: Arc<dyn ItemCatalog>,
        publisher: Arc<dyn RealtimePublisher>,
    ) -> Self {
        Self {
            log,
            catalog,
            publisher,
        }
    }

    pub async fn batch_start(&self, req: EdgeRequest) -> RfidResult<EdgeAck> {
        let env = envelope(&req, true, true)?;
        let product = optional_text(req.product_id.as_deref(), MAX_PRODUCT_LEN);
        if let Some(product) = &product {
            self.require_item(product).await?;
        }
        let config = parse_object(req.config.as_ref());
        let op = BatchOp::Start {
            batch_id: batch_of(&env),
            product,
            config,
        };
        let payload = request_payload(&req);
        self.run(env, "batch_start", payload, op).await
    }

    pub async fn batch_stop(&self, req: EdgeRequest) -> RfidResult<EdgeAck> {
        let env = envelope(&req, true, true)?;
        let op = BatchOp::Stop {
            batch_id: batch_of(&env),
        };
        let payload = request_payload(&req);
        self.run(env, "batch_stop", payload, op).await
    }

    pub async fn product_switch(&self, req: EdgeRequest) -> RfidResult<EdgeAck> {
        let env = envelope(&req, true, true)?;
        let product = optional_text(req.product_id.as_deref(), MAX_PRODUCT_LEN)
            .ok_or_else(|| ValidationError::missing("product_id"))?;
        self.require_item(&product).await?;
        let op = BatchOp::ProductSwitch {
            batch_id: batch_of(&env),
            product,
        };
        let payload = request_payload(&req);
        self.run(env, "product_switch", payload, op).await
    }

    pub async fn device_status(&self, req: EdgeRequest) -> RfidResult<EdgeAck> {
        let env = envelope(&req, false, false)?;
        let status = match optional_text(req.status.as_deref(), 16) {
            Some(raw) => Some(parse_status(&raw)?),
            None => None,
        };
        let current_product = optional_text(req.current_product.as_deref(), MAX_PRODUCT_LEN);
        let pending_product = optional_text(req.pending_product.as_deref(), MAX_PRODUCT_LEN);
        for product in current_product.iter().chain(pending_product.iter()) {
            self.require_item(product).await?;
        }
        let op = BatchOp::DeviceStatus {
            status,
            batch_id: env.batch_id.clone(),
            current_product,
            pending_product,
            pause_reason: optional_text(req.pause_reason.as_deref(), MAX_REASON_LEN),
        };
        let payload = request_payload(&req);
        self.run(env, "device_status", payload, op).await
    }

    pub async fn event_report(&self, req: EdgeRequest) -> RfidResult<EdgeAck> {
        let env = envelope(&req, true, true)?;
        let event_type = optional_text(req.event_type.as_deref(), 64)
            .ok_or_else(|| ValidationError::missing("event_type"))?;
        let mut payload = parse_object(req.payload.as_ref()).unwrap_or_else(|| Value::Object(Map::new()));
        let product = ["product_id", "item_code"]
            .iter()
            .find_map(|k| payload.get(*k).and_then(|v| v.as_str()))
            .and_then(|s| optional_text(Some(s), MAX_PRODUCT_LEN))
            .or_else(|| optional_text(req.product_id.as_deref(), MAX_PRODUCT_LEN));
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("event_type".to_string(), Value::String(event_type));
        }
        let op = BatchOp::Report {
            batch_id: batch_of(&env),
            product,
        };
        self.run(env, "event_report", payload, op).await
    }

    /// Current state for a device; `None` before its first event.
    pub async fn get_batch_state(&self, device_id: &str) -> RfidResult<Option<BatchState>> {
        let device_id = normalize_device_id(device_id)
            .ok_or_else(|| ValidationError::missing("device_id"))?;
        self.log.batch_state(&device_id).await
    }

    async fn run(
        &self,
        env: Envelope,
        event_type: &str,
        payload: Value,
        op: BatchOp,
    ) -> RfidResult<EdgeAck> {
        let input = EdgeEventInput {
            event_id: env.event_id,
            device_id: env.device_id,
            batch_id: env.batch_id,
            seq: env.seq,
            event_type: event_type.to_string(),
            payload,
        };
        let outcome = self.log.ingest(input, &op).await?;
        if let IngestOutcome::Accepted { event, .. } = &outcome {
            let published = self.publisher.publish(RealtimeEvent::BatchStateChanged {
                device_id: event.device_id.clone(),
                event_id: event.event_id.clone(),
                at: event.received_at,
            });
            if let Err(e) = published {
                warn!(event_id = %event.event_id, error = %e, "Batch state broadcast failed");
            }
        }
        Ok(outcome.into())
    }

    async fn require_item(&self, item_code: &str) -> RfidResult<()> {
        if self.catalog.item(item_code).await?.is_none() {
            return Err(ValidationError::UnknownItem {
                item_code: item_code.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

fn envelope(req: &EdgeRequest, need_batch: bool, need_seq: bool) -> Result<Envelope, ValidationError> {
    let event_id = req
        .event_id
        .as_deref()
        .and_then(normalize_event_id)
        .ok_or_else(|| ValidationError::missing("event_id"))?;
    let device_id = req
        .device_id
        .as_deref()
        .and_then(normalize_device_id)
        .ok_or_else(|| ValidationError::missing("device_id"))?;
    let batch_id = req.batch_id.as_deref().and_then(normalize_batch_id);
    if need_batch && batch_id.is_none() {
        return Err(ValidationError::missing("batch_id"));
    }
    let seq = normalize_seq(req.seq.as_ref());
    if need_seq && seq.is_none() {
        return Err(ValidationError::missing("seq"));
    }
    Ok(Envelope {
        event_id,
        device_id,
        batch_id,
        seq,
    })
}

fn batch_of(env: &Envelope) -> String {
    env.batch_id.clone().unwrap_or_default()
}

fn optional_text(raw: Option<&str>, max: usize) -> Option<String> {
    raw.and_then(|s| clean_text(s, max))
}

fn parse_status(raw: &str) -> Result<BatchStatus, ValidationError> {
    match raw {
        "Running" => Ok(BatchStatus::Running),
        "Stopped" => Ok(BatchStatus::Stopped),
        "Paused" => Ok(BatchStatus::Paused),
        other => Err(ValidationError::invalid(
            "status",
            format!("expected Running, Stopped or Paused, got {}", other),
        )),
    }
}

/// Objects pass through, JSON strings are parsed, anything else is dropped.
fn parse_object(raw: Option<&Value>) -> Option<Value> {
    match raw? {
        Value::Object(_) => raw.cloned(),
        Value::String(s) => serde_json::from_str::<Value>(s).ok().filter(Value::is_object),
        _ => None,
    }
}

fn request_payload(req: &EdgeRequest) -> Value {
    serde_json::to_value(req).unwrap_or_else(|_| Value::Object(Map::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_requires_ids() {
        let req = EdgeRequest {
            event_id: Some("  ".to_string()),
            device_id: Some("dock-1".to_string()),
            ..Default::default()
        };
        assert_eq!(
            envelope(&req, false, false).err(),
            Some(ValidationError::missing("event_id"))
        );

        let req = EdgeRequest {
            event_id: Some("e1".to_string()),
            device_id: Some("dock-1".to_string()),
            seq: Some(json!("-3")),
            ..Default::default()
        };
        assert!(envelope(&req, false, false).is_ok());
        assert_eq!(
            envelope(&req, false, true).err(),
            Some(ValidationError::missing("seq"))
        );
        assert_eq!(
            envelope(&req, true, false).err(),
            Some(ValidationError::missing("batch_id"))
        );
    }

    #[test]
    fn test_parse_status_is_exact() {
        assert_eq!(parse_status("Paused"), Ok(BatchStatus::Paused));
        assert!(parse_status("paused").is_err());
    }

    #[test]
    fn test_parse_object() {
        assert_eq!(parse_object(Some(&json!({"a": 1}))), Some(json!({"a": 1})));
        assert_eq!(parse_object(Some(&json!("{\"a\":1}"))), Some(json!({"a": 1})));
        assert_eq!(parse_object(Some(&json!("[1]"))), None);
        assert_eq!(parse_object(Some(&json!(3))), None);
        assert_eq!(parse_object(None), None);
    }

    #[test]
    fn test_request_deserializes_aliases() {
        let req: EdgeRequest = serde_json::from_value(json!({
            "event_id": "e1",
            "device": "dock-1",
            "item_code": "ITEM-001",
            "type": "reject",
            "seq": "4"
        }))
        .unwrap();
        assert_eq!(req.device_id.as_deref(), Some("dock-1"));
        assert_eq!(req.product_id.as_deref(), Some("ITEM-001"));
        assert_eq!(req.event_type.as_deref(), Some("reject"));
        assert_eq!(normalize_seq(req.seq.as_ref()), Some(4));
    }
}
