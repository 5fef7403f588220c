//! Tag registry: creating, printing, retrying and listing tracked tags.

use crate::documents::{DocumentService, TagDocumentInput};
use rfidgate_core::normalize::{
    clean_text, normalize_antenna, normalize_epc, truncate_chars, value_as_f64, MAX_ERROR_LEN,
    MAX_EVENT_ID_LEN,
};
use rfidgate_core::{
    generate_epc, Clock, DocumentKind, EntityType, Provenance, RfidConfig, RfidError, RfidResult,
    StorageError, TagStatus, TagUpdate, Timestamp, TokenSource, TrackedTag, ValidationError,
};
use rfidgate_storage::{constraints, ItemCatalog, RecordStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Fresh EPCs tried before giving up on a tag insert.
pub const MAX_EPC_ATTEMPTS: usize = 12;
pub const MAX_TAG_QTY: f64 = 1_000_000.0;
/// Device recorded on stock drafts created at print time.
pub const PRINT_DEVICE: &str = "print";

const RECENT_LIMIT: (usize, usize, usize) = (5, 200, 30);
const EPC_LIST_LIMIT: (usize, usize, usize) = (100, 100_000, 10_000);
const MAX_EPC_INFO: usize = 5000;

fn clamp_limit(requested: Option<i64>, (min, max, default): (usize, usize, usize)) -> usize {
    requested
        .map(|n| n.clamp(min as i64, max as i64) as usize)
        .unwrap_or(default)
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CreateTagRequest {
    pub item_code: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<f64>))]
    pub qty: Option<Value>,
    pub uom: Option<String>,
    #[serde(alias = "consume_ant_id")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<u8>))]
    pub consume_antenna_id: Option<Value>,
    pub client_request_id: Option<String>,
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CreatedTag {
    pub epc: String,
    /// True when an earlier call with the same `client_request_id` made it.
    pub existing: bool,
    pub tag: TrackedTag,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct PrintReport {
    pub epc: String,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub printed_at: Timestamp,
    pub stock_doc: Option<String>,
    pub stock_doc_created: bool,
    pub stock_doc_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TagInfo {
    pub epc: String,
    pub status: TagStatus,
    pub item_code: String,
    pub item_name: Option<String>,
    pub qty: f64,
    pub uom: String,
    pub stock_doc: Option<String>,
    pub delivery_doc: Option<String>,
}

impl From<TrackedTag> for TagInfo {
    fn from(tag: TrackedTag) -> Self {
        Self {
            epc: tag.epc,
            status: tag.status,
            item_code: tag.item_code,
            item_name: tag.item_name,
            qty: tag.qty,
            uom: tag.uom,
            stock_doc: tag.owner_stock_doc,
            delivery_doc: tag.owner_delivery_doc,
        }
    }
}

#[derive(Clone)]
pub struct TagRegistry {
    store: Arc<dyn RecordStore>,
    catalog: Arc<dyn ItemCatalog>,
    documents: DocumentService,
    clock: Arc<dyn Clock>,
    tokens: Arc<dyn TokenSource>,
    config: RfidConfig,
}

impl TagRegistry {
    pub fn new(
        store: Arc<dyn RecordStore>,
        catalog: Arc<dyn ItemCatalog>,
        documents: DocumentService,
        clock: Arc<dyn Clock>,
        tokens: Arc<dyn TokenSource>,
        config: RfidConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            documents,
            clock,
            tokens,
            config,
        }
    }

    /// Register a new tag in Pending Print with a freshly generated EPC.
    /// Repeating a `client_request_id` returns the tag created the first time.
    pub async fn create_item_tag(&self, request: CreateTagRequest) -> RfidResult<CreatedTag> {
        let item_code = request
            .item_code
            .as_deref()
            .and_then(|s| clean_text(s, 140))
            .ok_or_else(|| ValidationError::missing("item_code"))?;
        let qty = request
            .qty
            .as_ref()
            .and_then(value_as_f64)
            .filter(|q| *q > 0.0)
            .map(|q| q.min(MAX_TAG_QTY))
            .ok_or_else(|| ValidationError::invalid("qty", "must be a positive number"))?;
        let consume_antenna_id = normalize_antenna(request.consume_antenna_id.as_ref());
        let client_request_id = request
            .client_request_id
            .as_deref()
            .and_then(|s| clean_text(s, MAX_EVENT_ID_LEN));

        if let Some(id) = client_request_id.as_deref() {
            if let Some(tag) = self.store.tag_find_by_client_request(id).await? {
                return Ok(CreatedTag {
                    epc: tag.epc.clone(),
                    existing: true,
                    tag,
                });
            }
        }

        let item = self
            .catalog
            .item(&item_code)
            .await?
            .ok_or_else(|| ValidationError::UnknownItem {
                item_code: item_code.clone(),
            })?;
        let uom = request
            .uom
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(item.stock_uom.trim())
            .to_string();
        if uom.is_empty() {
            return Err(ValidationError::invalid("uom", "item has no stock unit").into());
        }

        let now = self.clock.now();
        let mut tag = TrackedTag {
            epc: String::new(),
            item_code: item.item_code.clone(),
            item_name: Some(item.item_name.clone()),
            qty,
            uom,
            consume_antenna_id,
            status: TagStatus::PendingPrint,
            client_request_id,
            requested_by: request.requested_by.as_deref().and_then(|s| clean_text(s, 140)),
            printed_at: None,
            scan_recon_required: false,
            owner_stock_doc: None,
            owner_delivery_doc: None,
            delivery_submitted_at: None,
            delivery_device: None,
            consumed_at: None,
            consumed_device: None,
            last_error: None,
            last_event_id: None,
            last_batch_id: None,
            last_seq: None,
            last_device_id: None,
            created_at: now,
            modified_at: now,
        };

        for _ in 0..MAX_EPC_ATTEMPTS {
            tag.epc = generate_epc(self.tokens.as_ref(), &self.config.epc_prefix);
            match self.store.tag_insert(&tag).await {
                Ok(()) => {
                    info!(epc = %tag.epc, item_code = %tag.item_code, qty = tag.qty, "Tag created");
                    return Ok(CreatedTag {
                        epc: tag.epc.clone(),
                        existing: false,
                        tag,
                    });
                }
                Err(RfidError::Storage(StorageError::DuplicateKey {
                    constraint,
                    ..
                })) if constraint == constraints::TAG_CLIENT_REQUEST => {
                    // Lost a race with the same client request.
                    let id = tag.client_request_id.clone().unwrap_or_default();
                    if let Some(existing) = self.store.tag_find_by_client_request(&id).await? {
                        return Ok(CreatedTag {
                            epc: existing.epc.clone(),
                            existing: true,
                            tag: existing,
                        });
                    }
                }
                Err(RfidError::Storage(StorageError::DuplicateKey {
                    constraint,
                    ..
                })) if constraint == constraints::TAG_EPC => {
                    warn!(epc = %tag.epc, "Generated EPC already taken, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(StorageError::InsertFailed {
            entity_type: EntityType::TrackedTag,
            reason: format!("no unique EPC after {} attempts", MAX_EPC_ATTEMPTS),
        }
        .into())
    }

    /// Record that the label was printed and, when enabled, draft the stock
    /// issue up front. A draft failure is reported, not raised.
    pub async fn mark_tag_printed(&self, raw_epc: &str) -> RfidResult<PrintReport> {
        let epc = normalize_epc(raw_epc);
        if epc.is_empty() {
            return Err(ValidationError::missing("epc").into());
        }
        let tag = self.find(&epc).await?;

        let now = self.clock.now();
        let locked = tag.status.is_claim_blocking();
        let update = TagUpdate {
            status: (!locked).then_some(TagStatus::Printed),
            printed_at: Some(now),
            last_error: Some(None),
            ..Default::default()
        };
        self.store.tag_update(&epc, update, now).await?;

        let mut report = PrintReport {
            epc: epc.clone(),
            printed_at: now,
            stock_doc: tag.owner_stock_doc.clone(),
            stock_doc_created: false,
            stock_doc_error: None,
        };
        if !self.config.draft_on_print || locked || tag.owner_stock_doc.is_some() {
            return Ok(report);
        }

        let provenance = Provenance::default();
        let created = self
            .documents
            .create_stock_issue(TagDocumentInput {
                tag: &tag,
                antenna: tag.consume_antenna_id,
                device: PRINT_DEVICE,
                provenance: &provenance,
                idempotency_key: tag.client_request_id.as_deref(),
            })
            .await;
        match created {
            Ok(claimed) => {
                let update = TagUpdate {
                    owner_stock_doc: Some(Some(claimed.name.clone())),
                    ..Default::default()
                };
                self.store.tag_update(&epc, update, self.clock.now()).await?;
                report.stock_doc = Some(claimed.name);
                report.stock_doc_created = claimed.created;
            }
            Err(e) => {
                let message = truncate_chars(&e.to_string(), MAX_ERROR_LEN);
                warn!(epc = %epc, error = %message, "Stock draft at print time failed");
                let update = TagUpdate {
                    status: Some(TagStatus::Error),
                    last_error: Some(Some(message.clone())),
                    ..Default::default()
                };
                self.store.tag_update(&epc, update, self.clock.now()).await?;
                report.stock_doc_error = Some(message);
            }
        }
        Ok(report)
    }

    /// Put an Error tag back to Printed so the next read retries it. Failed
    /// document claims for the tag's request are released as well.
    pub async fn retry_tag(&self, raw_epc: &str) -> RfidResult<TrackedTag> {
        let epc = normalize_epc(raw_epc);
        if epc.is_empty() {
            return Err(ValidationError::missing("epc").into());
        }
        let tag = self.find(&epc).await?;
        if tag.status != TagStatus::Error {
            return Err(ValidationError::invalid(
                "status",
                format!("only Error tags can be retried, tag is {}", tag.status),
            )
            .into());
        }

        if let Some(key) = tag.client_request_id.as_deref() {
            for kind in [DocumentKind::StockIssue, DocumentKind::DeliveryNote] {
                self.documents.claims().release_failed(kind, key).await?;
            }
        }
        let update = TagUpdate {
            status: Some(TagStatus::Printed),
            last_error: Some(None),
            ..Default::default()
        };
        self.store.tag_update(&epc, update, self.clock.now()).await?;
        info!(epc = %epc, "Tag queued for retry");
        self.find(&epc).await
    }

    pub async fn list_recent(&self, limit: Option<i64>) -> RfidResult<Vec<TrackedTag>> {
        self.store
            .tag_list_recent(clamp_limit(limit, RECENT_LIMIT))
            .await
    }

    /// EPCs in the given statuses. Defaults to every printed status.
    pub async fn list_epcs(
        &self,
        statuses: &[String],
        limit: Option<i64>,
    ) -> RfidResult<Vec<String>> {
        let statuses = if statuses.is_empty() {
            vec![TagStatus::Printed, TagStatus::Processing, TagStatus::Consumed]
        } else {
            statuses
                .iter()
                .map(|s| {
                    TagStatus::from_db_str(s.trim())
                        .map_err(|e| ValidationError::invalid("status", e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        let tags = self
            .store
            .tag_list_by_status(&statuses, clamp_limit(limit, EPC_LIST_LIMIT))
            .await?;
        Ok(tags.into_iter().map(|t| t.epc).collect())
    }

    /// Summaries for the given EPCs, in request order. Unknown EPCs are
    /// skipped.
    pub async fn epc_info(&self, raw_epcs: &[String], limit: Option<i64>) -> RfidResult<Vec<TagInfo>> {
        let mut seen = HashSet::new();
        let epcs: Vec<String> = raw_epcs
            .iter()
            .map(|raw| normalize_epc(raw))
            .filter(|epc| !epc.is_empty() && seen.insert(epc.clone()))
            .collect();
        let limit = limit
            .map(|n| n.clamp(1, MAX_EPC_INFO as i64) as usize)
            .unwrap_or(MAX_EPC_INFO);
        let epcs = &epcs[..epcs.len().min(limit)];
        if epcs.is_empty() {
            return Ok(Vec::new());
        }

        let mut tags = self.store.tag_get_many(epcs).await?;
        tags.sort_by_key(|t| epcs.iter().position(|e| *e == t.epc));
        Ok(tags.into_iter().map(TagInfo::from).collect())
    }

    async fn find(&self, epc: &str) -> RfidResult<TrackedTag> {
        self.store.tag_get(epc).await?.ok_or_else(|| {
            StorageError::NotFound {
                entity_type: EntityType::TrackedTag,
                key: epc.to_string(),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None, RECENT_LIMIT), 30);
        assert_eq!(clamp_limit(Some(1), RECENT_LIMIT), 5);
        assert_eq!(clamp_limit(Some(999), RECENT_LIMIT), 200);
        assert_eq!(clamp_limit(Some(-4), EPC_LIST_LIMIT), 100);
    }

    #[test]
    fn test_create_request_accepts_short_antenna_name() {
        let request: CreateTagRequest = serde_json::from_value(serde_json::json!({
            "item_code": "ITEM-001",
            "qty": "2.5",
            "consume_ant_id": 3
        }))
        .unwrap();
        assert_eq!(request.consume_antenna_id, Some(serde_json::json!(3)));
        assert_eq!(request.qty.as_ref().and_then(value_as_f64), Some(2.5));
    }
}
