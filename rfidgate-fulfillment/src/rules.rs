//! Antenna rule administration.

use crate::router::ANY_DEVICE;
use rfidgate_core::normalize::{normalize_device_key, value_as_bool, value_as_i64, MAX_ANTENNA_ID};
use rfidgate_core::{AntennaRule, RfidResult, ValidationError};
use rfidgate_storage::RecordStore;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct UpsertRuleRequest {
    pub device: Option<String>,
    #[serde(alias = "ant_id")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<u8>))]
    pub antenna_id: Option<Value>,
    #[serde(alias = "submit_stock_entry")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<bool>))]
    pub submit_stock: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<bool>))]
    pub create_delivery_note: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<bool>))]
    pub submit_delivery_note: Option<Value>,
}

fn device_or_any(raw: Option<&str>) -> String {
    let key = raw.map(normalize_device_key).unwrap_or_default();
    if key.is_empty() {
        ANY_DEVICE.to_string()
    } else {
        key
    }
}

fn antenna_id(raw: Option<&Value>) -> Result<u8, ValidationError> {
    raw.and_then(value_as_i64)
        .filter(|id| (1..=MAX_ANTENNA_ID).contains(id))
        .map(|id| id as u8)
        .ok_or_else(|| ValidationError::invalid("antenna_id", "must be between 1 and 31"))
}

fn flag(raw: Option<&Value>) -> bool {
    raw.and_then(value_as_bool).unwrap_or(false)
}

#[derive(Clone)]
pub struct RuleService {
    store: Arc<dyn RecordStore>,
}

impl RuleService {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn list(&self) -> RfidResult<Vec<AntennaRule>> {
        let mut rules = self.store.antenna_rule_list().await?;
        rules.sort_by(|a, b| (&a.device, a.antenna_id).cmp(&(&b.device, b.antenna_id)));
        Ok(rules)
    }

    /// Insert or replace the rule for (device, antenna). A delivery note is
    /// only created by an antenna that also consumes stock.
    pub async fn upsert(&self, request: UpsertRuleRequest) -> RfidResult<AntennaRule> {
        let antenna_id = antenna_id(request.antenna_id.as_ref())?;
        let submit_stock = flag(request.submit_stock.as_ref());
        let rule = AntennaRule {
            device: device_or_any(request.device.as_deref()),
            antenna_id,
            submit_stock,
            create_delivery_note: submit_stock && flag(request.create_delivery_note.as_ref()),
            submit_delivery_note: flag(request.submit_delivery_note.as_ref()),
        };
        self.store.antenna_rule_upsert(&rule).await?;
        info!(
            device = %rule.device,
            antenna_id = rule.antenna_id,
            submit_stock = rule.submit_stock,
            create_delivery_note = rule.create_delivery_note,
            submit_delivery_note = rule.submit_delivery_note,
            "Antenna rule saved"
        );
        Ok(rule)
    }

    pub async fn delete(&self, device: Option<&str>, antenna_id: Option<&Value>) -> RfidResult<bool> {
        let antenna_id = self::antenna_id(antenna_id)?;
        let device = device_or_any(device);
        let removed = self.store.antenna_rule_delete(&device, antenna_id).await?;
        if removed {
            info!(device = %device, antenna_id, "Antenna rule deleted");
        }
        Ok(removed)
    }
}
