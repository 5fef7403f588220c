//! Per-EPC operator notes.

use rfidgate_core::normalize::{
    normalize_epc, normalize_note, truncate_chars, value_as_i64, value_as_string, MAX_DEVICE_LEN,
};
use rfidgate_core::{Clock, RfidResult, TagNote, ValidationError};
use rfidgate_storage::RecordStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_NOTES_LIMIT: usize = 2000;
pub const MIN_NOTES_LIMIT: usize = 10;
pub const MAX_NOTES_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Default, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::IntoParams))]
pub struct TagNotesQuery {
    /// Comma-separated EPCs; omitted means every note
    pub epcs: Option<String>,
    /// 10..=10000, default 2000
    #[cfg_attr(feature = "openapi", param(value_type = Option<i64>))]
    pub limit: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SetTagNoteRequest {
    /// Blank or missing deletes the note
    pub note: Option<String>,
    pub device: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TagNotesResponse {
    pub ok: bool,
    pub count: usize,
    /// Note text keyed by EPC
    pub notes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TagNoteResponse {
    pub ok: bool,
    pub epc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub deleted: bool,
}

/// Distinct normalized EPCs from a comma-separated list or a JSON array.
pub fn parse_epcs(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Vec::new();
    };
    let parts: Vec<String> = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(values)) => values.iter().filter_map(value_as_string).collect(),
        _ => raw.split(',').map(str::to_string).collect(),
    };
    let mut epcs: Vec<String> = Vec::with_capacity(parts.len());
    for epc in parts.iter().map(|p| normalize_epc(p)) {
        if !epc.is_empty() && !epcs.contains(&epc) {
            epcs.push(epc);
        }
    }
    epcs
}

pub fn parse_notes_limit(raw: Option<&Value>) -> usize {
    raw.and_then(value_as_i64)
        .map(|v| v.clamp(MIN_NOTES_LIMIT as i64, MAX_NOTES_LIMIT as i64) as usize)
        .unwrap_or(DEFAULT_NOTES_LIMIT)
}

#[derive(Clone)]
pub struct TagNoteService {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
}

impl TagNoteService {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn list(&self, query: &TagNotesQuery) -> RfidResult<TagNotesResponse> {
        let epcs = parse_epcs(query.epcs.as_deref());
        let limit = parse_notes_limit(query.limit.as_ref());
        let notes: BTreeMap<String, String> = self
            .store
            .tag_notes_list(&epcs, limit)
            .await?
            .into_iter()
            .map(|n| (n.epc, n.note))
            .collect();
        Ok(TagNotesResponse {
            ok: true,
            count: notes.len(),
            notes,
        })
    }

    /// Write the note for `epc`; a blank note deletes it.
    pub async fn set(&self, epc: &str, request: &SetTagNoteRequest) -> RfidResult<TagNoteResponse> {
        let epc = normalize_epc(epc);
        if epc.is_empty() {
            return Err(ValidationError::invalid("epc", "no hex digits").into());
        }
        let Some(note) = request.note.as_deref().and_then(normalize_note) else {
            let removed = self.store.tag_note_delete(&epc).await?;
            debug!(epc = %epc, removed, "Tag note cleared");
            return Ok(TagNoteResponse {
                ok: true,
                epc,
                note: None,
                deleted: true,
            });
        };
        let device = request.device.as_deref().unwrap_or_default().trim();
        let device = truncate_chars(device, MAX_DEVICE_LEN);
        let written = self
            .store
            .tag_note_upsert(&TagNote {
                epc,
                note,
                device,
                updated_at: self.clock.now(),
            })
            .await?;
        debug!(epc = %written.epc, device = %written.device, "Tag note saved");
        Ok(TagNoteResponse {
            ok: true,
            epc: written.epc,
            note: Some(written.note),
            deleted: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_epcs_accepts_csv_and_json() {
        assert!(parse_epcs(None).is_empty());
        assert_eq!(parse_epcs(Some("aa01, bb-02,,AA01")), vec!["AA01", "BB02"]);
        assert_eq!(parse_epcs(Some(r#"["cc03","zz"]"#)), vec!["CC03"]);
    }

    #[test]
    fn test_parse_notes_limit_clamps() {
        assert_eq!(parse_notes_limit(None), 2000);
        assert_eq!(parse_notes_limit(Some(&json!(1))), 10);
        assert_eq!(parse_notes_limit(Some(&json!("300"))), 300);
        assert_eq!(parse_notes_limit(Some(&json!(99_999))), 10_000);
    }
}
