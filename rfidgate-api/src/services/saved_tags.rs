//! Saved-tag listing and clearing.

use chrono::NaiveDate;
use rfidgate_core::normalize::value_as_i64;
use rfidgate_core::{RfidResult, SavedTag, SavedTagOrder, ValidationError};
use rfidgate_storage::RecordStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const DEFAULT_SAVED_LIMIT: usize = 200;
pub const MIN_SAVED_LIMIT: usize = 50;
pub const MAX_SAVED_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Default, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::IntoParams))]
pub struct SavedTagsQuery {
    /// 50..=10000, default 200
    #[cfg_attr(feature = "openapi", param(value_type = Option<i64>))]
    pub limit: Option<Value>,
    /// `last` (default), `reads` or `epc`
    pub order: Option<String>,
    /// Restrict to one day's tallies (`YYYY-MM-DD`)
    pub date: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::IntoParams))]
pub struct ClearSavedTagsQuery {
    pub date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SavedTagsResponse {
    pub ok: bool,
    pub count: usize,
    pub items: Vec<SavedTag>,
}

pub fn parse_order(raw: Option<&str>) -> SavedTagOrder {
    match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        Some("reads") => SavedTagOrder::Reads,
        Some("epc") => SavedTagOrder::Epc,
        _ => SavedTagOrder::Last,
    }
}

pub fn parse_limit(raw: Option<&Value>) -> usize {
    raw.and_then(value_as_i64)
        .map(|v| v.clamp(MIN_SAVED_LIMIT as i64, MAX_SAVED_LIMIT as i64) as usize)
        .unwrap_or(DEFAULT_SAVED_LIMIT)
}

/// Day from `YYYY-MM-DD`, or from the date part of an ISO datetime. Blank
/// means no day.
pub fn parse_day(raw: Option<&str>) -> Result<Option<NaiveDate>, ValidationError> {
    let raw = match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => raw,
        None => return Ok(None),
    };
    let date_part = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| ValidationError::invalid("date", format!("expected YYYY-MM-DD, got {:?}", raw)))
}

#[derive(Clone)]
pub struct SavedTagService {
    store: Arc<dyn RecordStore>,
}

impl SavedTagService {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn list(&self, query: &SavedTagsQuery) -> RfidResult<SavedTagsResponse> {
        let day = parse_day(query.date.as_deref())?;
        let order = parse_order(query.order.as_deref());
        let limit = parse_limit(query.limit.as_ref());
        let items = self.store.saved_tags_list(day, order, limit).await?;
        Ok(SavedTagsResponse {
            ok: true,
            count: items.len(),
            items,
        })
    }

    pub async fn clear(&self, date: Option<&str>) -> RfidResult<()> {
        let day = parse_day(date)?;
        self.store.saved_tags_clear(day).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_limit_clamps() {
        assert_eq!(parse_limit(None), 200);
        assert_eq!(parse_limit(Some(&json!(5))), 50);
        assert_eq!(parse_limit(Some(&json!("750"))), 750);
        assert_eq!(parse_limit(Some(&json!(1_000_000))), 10_000);
        assert_eq!(parse_limit(Some(&json!("lots"))), 200);
    }

    #[test]
    fn test_parse_order() {
        assert_eq!(parse_order(None), SavedTagOrder::Last);
        assert_eq!(parse_order(Some("READS")), SavedTagOrder::Reads);
        assert_eq!(parse_order(Some("epc")), SavedTagOrder::Epc);
        assert_eq!(parse_order(Some("random")), SavedTagOrder::Last);
    }

    #[test]
    fn test_parse_day() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 1);
        assert_eq!(parse_day(Some("2026-03-01")), Ok(day));
        assert_eq!(parse_day(Some("2026-03-01T08:15:00Z")), Ok(day));
        assert_eq!(parse_day(Some("  ")), Ok(None));
        assert_eq!(parse_day(None), Ok(None));
        assert!(parse_day(Some("yesterday")).is_err());
    }
}
