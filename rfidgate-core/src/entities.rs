//! Persisted entities of the ingestion pipeline.

use crate::{
    AgentRequestStatus, BatchStatus, ClaimStatus, DocStatus, DocumentKind, RuleAction, TagStatus,
    Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// EDGE EVENTS
// ============================================================================

/// An ingested edge event. Immutable once inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EdgeEvent {
    pub event_id: String,
    pub device_id: String,
    pub batch_id: Option<String>,
    pub seq: Option<i64>,
    pub event_type: String,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub payload: Value,
    pub payload_hash: String,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub received_at: Timestamp,
}

impl EdgeEvent {
    /// Position of this event within its device/batch stream, when fully known.
    pub fn position(&self) -> Option<SeqPosition> {
        match (&self.batch_id, self.seq) {
            (Some(batch_id), Some(seq)) => Some(SeqPosition {
                device_id: self.device_id.clone(),
                batch_id: batch_id.clone(),
                seq,
            }),
            _ => None,
        }
    }
}

/// The (device, batch, seq) triple that must be unique across events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeqPosition {
    pub device_id: String,
    pub batch_id: String,
    pub seq: i64,
}

impl std::fmt::Display for SeqPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.device_id, self.batch_id, self.seq)
    }
}

// ============================================================================
// BATCH STATE
// ============================================================================

/// Per-device production state. `version` increments on every write and is
/// the guard for conditional updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct BatchState {
    pub device_id: String,
    pub status: BatchStatus,
    pub current_batch_id: Option<String>,
    pub current_product: Option<String>,
    pub pending_product: Option<String>,
    pub pause_reason: Option<String>,
    /// Highest accepted seq, -1 when none.
    pub last_event_seq: i64,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub last_seen_at: Option<Timestamp>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub config: Option<Value>,
    pub version: i64,
}

impl BatchState {
    /// Fresh state for a device that has never been seen.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            status: BatchStatus::Stopped,
            current_batch_id: None,
            current_product: None,
            pending_product: None,
            pause_reason: None,
            last_event_seq: -1,
            last_seen_at: None,
            config: None,
            version: 0,
        }
    }
}

// ============================================================================
// IDEMPOTENCY CLAIMS
// ============================================================================

/// A row asserting ownership of an idempotency key during document creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct IdempotencyClaim {
    /// `"{kind}:{raw_key}"`, the unique key.
    pub key: String,
    pub raw_key: String,
    pub kind: String,
    pub status: ClaimStatus,
    pub owner_doc_type: Option<DocumentKind>,
    pub owner_doc_name: Option<String>,
    pub payload_hash: String,
    pub epc: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub claimed_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    pub last_error: Option<String>,
}

impl IdempotencyClaim {
    /// Owner document name when the claim finished with one.
    pub fn owner(&self) -> Option<&str> {
        self.owner_doc_name.as_deref().filter(|s| !s.is_empty())
    }

    pub fn age_secs(&self, now: Timestamp) -> i64 {
        (now - self.claimed_at).num_seconds()
    }
}

// ============================================================================
// ANTENNA RULES
// ============================================================================

/// Maps one (device, antenna) pair to the fulfillment actions it enables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AntennaRule {
    /// Normalized device key, `"any"` for the fallback tier.
    pub device: String,
    pub antenna_id: u8,
    pub submit_stock: bool,
    pub create_delivery_note: bool,
    pub submit_delivery_note: bool,
}

impl AntennaRule {
    pub fn allows(&self, action: RuleAction) -> bool {
        match action {
            RuleAction::SubmitStock => self.submit_stock,
            RuleAction::CreateDeliveryNote => self.create_delivery_note,
            RuleAction::SubmitDeliveryNote => self.submit_delivery_note,
        }
    }
}

// ============================================================================
// TRACKED TAGS
// ============================================================================

/// A printed RFID tag tied to an item quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TrackedTag {
    pub epc: String,
    pub item_code: String,
    pub item_name: Option<String>,
    pub qty: f64,
    pub uom: String,
    pub consume_antenna_id: u8,
    pub status: TagStatus,
    pub client_request_id: Option<String>,
    pub requested_by: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub printed_at: Option<Timestamp>,
    pub scan_recon_required: bool,
    pub owner_stock_doc: Option<String>,
    pub owner_delivery_doc: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub delivery_submitted_at: Option<Timestamp>,
    pub delivery_device: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub consumed_at: Option<Timestamp>,
    pub consumed_device: Option<String>,
    pub last_error: Option<String>,
    pub last_event_id: Option<String>,
    pub last_batch_id: Option<String>,
    pub last_seq: Option<i64>,
    pub last_device_id: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub modified_at: Timestamp,
}

impl TrackedTag {
    /// Whether the fulfillment pipeline may act on this tag.
    pub fn is_ready_for_fulfillment(&self) -> bool {
        self.status == TagStatus::Printed && self.printed_at.is_some() && !self.scan_recon_required
    }
}

/// Partial update for a tracked tag. `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagUpdate {
    pub status: Option<TagStatus>,
    pub printed_at: Option<Timestamp>,
    pub owner_stock_doc: Option<Option<String>>,
    pub owner_delivery_doc: Option<Option<String>>,
    pub delivery_submitted_at: Option<Timestamp>,
    pub delivery_device: Option<String>,
    pub consumed_at: Option<Timestamp>,
    pub consumed_device: Option<String>,
    pub last_error: Option<Option<String>>,
    pub provenance: Option<Provenance>,
}

impl TagUpdate {
    /// Write the set fields onto `tag` and bump `modified_at`.
    pub fn apply_to(self, tag: &mut TrackedTag, now: Timestamp) {
        if let Some(status) = self.status {
            tag.status = status;
        }
        if let Some(printed_at) = self.printed_at {
            tag.printed_at = Some(printed_at);
        }
        if let Some(owner) = self.owner_stock_doc {
            tag.owner_stock_doc = owner;
        }
        if let Some(owner) = self.owner_delivery_doc {
            tag.owner_delivery_doc = owner;
        }
        if let Some(at) = self.delivery_submitted_at {
            tag.delivery_submitted_at = Some(at);
        }
        if let Some(device) = self.delivery_device {
            tag.delivery_device = Some(device);
        }
        if let Some(at) = self.consumed_at {
            tag.consumed_at = Some(at);
        }
        if let Some(device) = self.consumed_device {
            tag.consumed_device = Some(device);
        }
        if let Some(error) = self.last_error {
            tag.last_error = error;
        }
        if let Some(provenance) = self.provenance {
            tag.last_event_id = provenance.event_id;
            tag.last_batch_id = provenance.batch_id;
            tag.last_seq = provenance.seq;
            tag.last_device_id = provenance.device_id;
        }
        tag.modified_at = now;
    }
}

/// Event fields stamped on a tag whenever fulfillment touches it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub event_id: Option<String>,
    pub batch_id: Option<String>,
    pub seq: Option<i64>,
    pub device_id: Option<String>,
}

// ============================================================================
// AGENT REQUESTS
// ============================================================================

/// One RPC-style command queued for an edge agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AgentRequest {
    pub request_id: String,
    pub agent_id: String,
    pub command: String,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub args: Value,
    pub requested_by: Option<String>,
    pub status: AgentRequestStatus,
    pub timeout_sec: i64,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub lease_expires_at: Option<Timestamp>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub result: Option<Value>,
    pub error: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub request_ts: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub sent_at: Option<Timestamp>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub replied_at: Option<Timestamp>,
}

impl AgentRequest {
    /// Queued, or Sent with a missing or lapsed lease.
    pub fn is_pollable(&self, now: Timestamp) -> bool {
        match self.status {
            AgentRequestStatus::Queued => true,
            AgentRequestStatus::Sent => self.lease_expires_at.map_or(true, |lease| lease <= now),
            _ => false,
        }
    }

    pub fn is_timed_out(&self, now: Timestamp) -> bool {
        (now - self.request_ts).num_seconds() > self.timeout_sec
    }
}

/// Terminal write for an agent request.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCompletion {
    pub status: AgentRequestStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub replied_at: Timestamp,
}

// ============================================================================
// SAVED TAGS
// ============================================================================

/// Accumulated read counts for an EPC, overall or for one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SavedTag {
    pub epc: String,
    pub reads: i64,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub last_seen: Timestamp,
    pub device: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum SavedTagOrder {
    #[default]
    Last,
    Reads,
    Epc,
}

// ============================================================================
// TAG NOTES
// ============================================================================

/// Operator note pinned to an EPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TagNote {
    pub epc: String,
    pub note: String,
    /// Empty when no device was ever given.
    pub device: String,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub updated_at: Timestamp,
}

// ============================================================================
// CATALOG AND DOCUMENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Item {
    pub item_code: String,
    pub item_name: String,
    pub stock_uom: String,
}

/// Where stock issues for an item are booked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockIssueSettings {
    pub item_code: String,
    pub company: String,
    pub warehouse: String,
    pub naming_series: Option<String>,
}

/// How delivery notes for an item are addressed and priced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct DeliverySettings {
    pub item_code: String,
    pub company: String,
    pub customer: String,
    pub warehouse: String,
    pub selling_price_list: Option<String>,
    pub default_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct DocumentLine {
    pub item_code: String,
    pub qty: f64,
    pub uom: String,
    pub stock_uom: String,
    pub conversion_factor: f64,
    pub transfer_qty: f64,
    pub warehouse: String,
    pub rate: Option<f64>,
}

/// Document body before the ledger assigns it a name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct DocumentDraft {
    pub kind: DocumentKind,
    pub company: String,
    pub customer: Option<String>,
    pub selling_price_list: Option<String>,
    pub naming_series: Option<String>,
    pub purpose: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub posting_at: Timestamp,
    pub remarks: String,
    pub lines: Vec<DocumentLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct BusinessDocument {
    pub name: String,
    pub status: DocStatus,
    pub body: DocumentDraft,
}

// ============================================================================
// LIVE READINGS
// ============================================================================

/// Last known scale reading for a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ScaleReading {
    pub device: String,
    pub weight: f64,
    pub unit: String,
    pub stable: Option<bool>,
    pub port: String,
    /// Milliseconds since the epoch.
    pub ts: i64,
}

/// Read statistics for one antenna of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AntennaStat {
    pub device: String,
    pub device_key: String,
    pub ant_id: u8,
    pub reads: i64,
    pub last_seen: i64,
}

/// Heartbeat payload of a registered edge agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AgentInfo {
    pub agent_id: String,
    pub device: String,
    pub ui_urls: Vec<String>,
    pub ui_host: String,
    pub ui_port: Option<i64>,
    pub platform: String,
    pub version: String,
    pub pid: Option<i64>,
    pub remote_addr: Option<String>,
    pub last_seen: i64,
}
