//! Tag fulfillment pipeline.
//!
//! Runs after an idempotency-tracked `ingest_tags` call. For every sighted EPC
//! that belongs to a printed tag, the pipeline resolves the consuming antenna,
//! takes the tag's processing claim, creates and submits one stock issue, and
//! optionally a delivery note. Each EPC gets its own entry in the report; a
//! failure is recorded on the tag and never aborts the rest of the batch.

use crate::documents::{DocumentService, TagDocumentInput};
use crate::router::{Route, RuleTable};
use rfidgate_core::normalize::{normalize_device_key, truncate_chars, MAX_DEVICE_LEN, MAX_ERROR_LEN};
use rfidgate_core::{
    Clock, DocStatus, DocumentKind, FulfillmentError, Provenance, RfidConfig, RfidResult,
    RuleAction, TagStatus, TagUpdate, TrackedTag,
};
use rfidgate_storage::RecordStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sightings from one ingest call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FulfillmentRequest {
    pub device: String,
    pub event_id: Option<String>,
    pub batch_id: Option<String>,
    pub seq: Option<i64>,
    /// Antennas (1..=31) that saw each EPC. An empty set means the EPC was
    /// only seen on antenna 0.
    pub sightings: BTreeMap<String, BTreeSet<u8>>,
}

impl FulfillmentRequest {
    fn provenance(&self) -> Provenance {
        Provenance {
            event_id: self.event_id.clone(),
            batch_id: self.batch_id.clone(),
            seq: self.seq,
            device_id: Some(truncate_chars(&self.device, MAX_DEVICE_LEN)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum EpcOutcome {
    /// Not printed yet, already consumed, or waiting for reconciliation.
    NotReady,
    /// No antenna is allowed to consume this tag.
    Unrouted,
    /// Another ingest holds the processing claim.
    Busy,
    Consumed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EpcReport {
    pub epc: String,
    pub outcome: EpcOutcome,
    pub stock_antenna: Option<u8>,
    pub stock_doc: Option<String>,
    pub stock_doc_created: bool,
    pub delivery_note: Option<String>,
    pub delivery_note_created: bool,
    pub delivery_submitted: bool,
    pub error: Option<String>,
}

impl EpcReport {
    fn new(epc: &str, outcome: EpcOutcome) -> Self {
        Self {
            epc: epc.to_string(),
            outcome,
            stock_antenna: None,
            stock_doc: None,
            stock_doc_created: false,
            delivery_note: None,
            delivery_note_created: false,
            delivery_submitted: false,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct FulfillmentReport {
    /// Tags moved to Consumed by this call.
    pub processed: usize,
    pub epcs: Vec<EpcReport>,
}

impl FulfillmentReport {
    pub fn failures(&self) -> usize {
        self.epcs
            .iter()
            .filter(|r| r.outcome == EpcOutcome::Failed)
            .count()
    }

    pub fn stock_docs_created(&self) -> usize {
        self.epcs.iter().filter(|r| r.stock_doc_created).count()
    }

    pub fn delivery_notes_created(&self) -> usize {
        self.epcs.iter().filter(|r| r.delivery_note_created).count()
    }
}

enum StockStep {
    Unrouted,
    Busy,
    Consumed { doc: String, created: bool },
}

/// Per-call context shared by every EPC.
struct Batch<'a> {
    request: &'a FulfillmentRequest,
    device_key: String,
    provenance: Provenance,
    rules: RuleTable,
}

#[derive(Clone)]
pub struct FulfillmentPipeline {
    store: Arc<dyn RecordStore>,
    documents: DocumentService,
    clock: Arc<dyn Clock>,
    config: RfidConfig,
}

impl FulfillmentPipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        documents: DocumentService,
        clock: Arc<dyn Clock>,
        config: RfidConfig,
    ) -> Self {
        Self {
            store,
            documents,
            clock,
            config,
        }
    }

    /// Fulfill every printed tag in `request`. Only storage failures while
    /// loading rules or tags are returned as errors.
    pub async fn process(&self, request: &FulfillmentRequest) -> RfidResult<FulfillmentReport> {
        let mut report = FulfillmentReport::default();
        let event_id = request.event_id.as_deref().filter(|s| !s.is_empty());
        if event_id.is_none() || request.sightings.is_empty() {
            return Ok(report);
        }

        let epcs: Vec<String> = request
            .sightings
            .keys()
            .take(self.config.max_epcs_per_fulfillment)
            .cloned()
            .collect();
        let tags = self.store.tag_get_many(&epcs).await?;
        if tags.is_empty() {
            return Ok(report);
        }

        let batch = Batch {
            request,
            device_key: normalize_device_key(&request.device),
            provenance: request.provenance(),
            rules: RuleTable::new(self.store.antenna_rule_list().await?),
        };

        for tag in &tags {
            let observed = request.sightings.get(&tag.epc).cloned().unwrap_or_default();
            let entry = self.fulfill_tag(&batch, tag, &observed).await;
            if entry.outcome == EpcOutcome::Consumed {
                report.processed += 1;
            }
            report.epcs.push(entry);
        }

        debug!(
            device = %request.device,
            event_id = ?request.event_id,
            processed = report.processed,
            failed = report.failures(),
            "Fulfillment pass finished"
        );
        Ok(report)
    }

    async fn fulfill_tag(&self, batch: &Batch<'_>, tag: &TrackedTag, observed: &BTreeSet<u8>) -> EpcReport {
        if !tag.is_ready_for_fulfillment() {
            return EpcReport::new(&tag.epc, EpcOutcome::NotReady);
        }

        let stock_route = batch.rules.stock_route(
            &batch.device_key,
            observed,
            tag.consume_antenna_id,
            self.config.consume_requires_ant_match,
        );
        let delivery_route =
            batch
                .rules
                .resolve(&batch.device_key, observed, RuleAction::SubmitDeliveryNote);

        let key = idempotency_key(tag, batch.request.event_id.as_deref());
        let mut entry = EpcReport::new(&tag.epc, EpcOutcome::Unrouted);
        entry.stock_antenna = stock_route.as_ref().map(|r| r.antenna);

        let consumed = match self
            .stock_step(batch, tag, stock_route.as_ref(), key.as_deref())
            .await
        {
            Ok(StockStep::Unrouted) => false,
            Ok(StockStep::Busy) => {
                entry.outcome = EpcOutcome::Busy;
                false
            }
            Ok(StockStep::Consumed { doc, created }) => {
                entry.outcome = EpcOutcome::Consumed;
                entry.stock_doc = Some(doc);
                entry.stock_doc_created = created;
                true
            }
            Err(e) => {
                self.record_failure(tag, &e.to_string(), &mut entry).await;
                return entry;
            }
        };

        let delivery = self
            .delivery_step(
                batch,
                tag,
                consumed,
                stock_route.as_ref(),
                delivery_route.as_ref(),
                key.as_deref(),
                &mut entry,
            )
            .await;
        if let Err(e) = delivery {
            self.record_failure(tag, &e.to_string(), &mut entry).await;
        }
        entry
    }

    async fn stock_step(
        &self,
        batch: &Batch<'_>,
        tag: &TrackedTag,
        route: Option<&Route>,
        key: Option<&str>,
    ) -> RfidResult<StockStep> {
        let Some(route) = route else {
            return Ok(StockStep::Unrouted);
        };
        let device = &batch.request.device;
        let mut created = false;

        let doc = match tag.owner_stock_doc.clone() {
            Some(name) => match self.documents.get(DocumentKind::StockIssue, &name).await? {
                Some(doc) if doc.status == DocStatus::Submitted => name,
                Some(doc) if doc.status == DocStatus::Draft => {
                    if !self.claim_for_processing(&tag.epc).await? {
                        return Ok(StockStep::Busy);
                    }
                    self.documents
                        .submit(DocumentKind::StockIssue, &name, route.antenna, device)
                        .await?;
                    name
                }
                Some(_) => return Err(FulfillmentError::DocumentCancelled { name }.into()),
                None => return Err(FulfillmentError::DocumentMissing { name }.into()),
            },
            None => {
                if !self.claim_for_processing(&tag.epc).await? {
                    return Ok(StockStep::Busy);
                }
                let claimed = self
                    .documents
                    .create_stock_issue(TagDocumentInput {
                        tag,
                        antenna: route.antenna,
                        device,
                        provenance: &batch.provenance,
                        idempotency_key: key,
                    })
                    .await?;
                created = claimed.created;
                let name = claimed.name;
                // Persist the owner before submitting so a failed submit is
                // retried against the same draft.
                self.store
                    .tag_update(
                        &tag.epc,
                        TagUpdate {
                            owner_stock_doc: Some(Some(name.clone())),
                            provenance: Some(batch.provenance.clone()),
                            ..Default::default()
                        },
                        self.clock.now(),
                    )
                    .await?;
                self.documents
                    .submit(DocumentKind::StockIssue, &name, route.antenna, device)
                    .await?;
                name
            }
        };

        let now = self.clock.now();
        self.store
            .tag_update(
                &tag.epc,
                TagUpdate {
                    status: Some(TagStatus::Consumed),
                    owner_stock_doc: Some(Some(doc.clone())),
                    consumed_at: Some(now),
                    consumed_device: Some(truncate_chars(device, MAX_DEVICE_LEN)),
                    last_error: Some(None),
                    provenance: Some(batch.provenance.clone()),
                    ..Default::default()
                },
                now,
            )
            .await?;
        info!(
            epc = %tag.epc,
            document = %doc,
            antenna = route.antenna,
            device = %device,
            event_id = ?batch.request.event_id,
            "Tag consumed"
        );
        Ok(StockStep::Consumed { doc, created })
    }

    #[allow(clippy::too_many_arguments)]
    async fn delivery_step(
        &self,
        batch: &Batch<'_>,
        tag: &TrackedTag,
        consumed: bool,
        stock_route: Option<&Route>,
        delivery_route: Option<&Route>,
        key: Option<&str>,
        entry: &mut EpcReport,
    ) -> RfidResult<()> {
        let device = &batch.request.device;
        let mut note = tag.owner_delivery_doc.clone();

        if let Some(route) = stock_route.filter(|r| consumed && r.creates_delivery_note()) {
            if note.is_none() {
                let claimed = self
                    .documents
                    .create_delivery_note(TagDocumentInput {
                        tag,
                        antenna: route.antenna,
                        device,
                        provenance: &batch.provenance,
                        idempotency_key: key,
                    })
                    .await?;
                let name = claimed.name;
                self.store
                    .tag_update(
                        &tag.epc,
                        TagUpdate {
                            owner_delivery_doc: Some(Some(name.clone())),
                            last_error: Some(None),
                            provenance: Some(batch.provenance.clone()),
                            ..Default::default()
                        },
                        self.clock.now(),
                    )
                    .await?;
                entry.delivery_note_created = claimed.created;
                note = Some(name);
            }
        }
        entry.delivery_note = note.clone();

        let (Some(route), Some(name)) = (delivery_route, note) else {
            return Ok(());
        };
        match self.documents.get(DocumentKind::DeliveryNote, &name).await? {
            Some(doc) if doc.status == DocStatus::Draft => {
                self.documents
                    .submit(DocumentKind::DeliveryNote, &name, route.antenna, device)
                    .await?;
                let now = self.clock.now();
                self.store
                    .tag_update(
                        &tag.epc,
                        TagUpdate {
                            delivery_submitted_at: Some(now),
                            delivery_device: Some(truncate_chars(device, MAX_DEVICE_LEN)),
                            last_error: Some(None),
                            provenance: Some(batch.provenance.clone()),
                            ..Default::default()
                        },
                        now,
                    )
                    .await?;
                info!(epc = %tag.epc, document = %name, antenna = route.antenna, "Delivery note submitted");
                entry.delivery_submitted = true;
            }
            Some(doc) if doc.status == DocStatus::Submitted => entry.delivery_submitted = true,
            Some(_) => debug!(epc = %tag.epc, document = %name, "Delivery note cancelled, not submitting"),
            None => return Err(FulfillmentError::DocumentMissing { name }.into()),
        }
        Ok(())
    }

    async fn claim_for_processing(&self, epc: &str) -> RfidResult<bool> {
        let won = self
            .store
            .tag_claim_for_processing(epc, self.clock.now(), self.config.processing_claim_ttl_secs)
            .await?;
        if !won {
            debug!(epc = %epc, "Processing claim held elsewhere");
        }
        Ok(won)
    }

    async fn record_failure(&self, tag: &TrackedTag, message: &str, entry: &mut EpcReport) {
        let message = truncate_chars(message, MAX_ERROR_LEN);
        warn!(epc = %tag.epc, error = %message, "Tag fulfillment failed");
        let update = TagUpdate {
            status: Some(TagStatus::Error),
            last_error: Some(Some(message.clone())),
            ..Default::default()
        };
        if let Err(e) = self.store.tag_update(&tag.epc, update, self.clock.now()).await {
            warn!(epc = %tag.epc, error = %e, "Could not record fulfillment failure on tag");
        }
        entry.outcome = EpcOutcome::Failed;
        entry.error = Some(message);
    }
}

/// The tag's `client_request_id` when it has one, else `"{event_id}:{epc}"`.
pub fn idempotency_key(tag: &TrackedTag, event_id: Option<&str>) -> Option<String> {
    if let Some(id) = tag.client_request_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        return Some(id.to_string());
    }
    event_id
        .filter(|s| !s.is_empty())
        .map(|event_id| format!("{}:{}", event_id, tag.epc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfidgate_test_utils::fixtures;

    #[test]
    fn test_idempotency_key_prefers_client_request() {
        let mut tag = fixtures::printed_tag("AA", 1);
        assert_eq!(idempotency_key(&tag, Some("e1")).as_deref(), Some("e1:AA"));
        assert_eq!(idempotency_key(&tag, None), None);
        tag.client_request_id = Some(" req-7 ".to_string());
        assert_eq!(idempotency_key(&tag, Some("e1")).as_deref(), Some("req-7"));
    }

    #[test]
    fn test_report_counters() {
        let mut consumed = EpcReport::new("AA", EpcOutcome::Consumed);
        consumed.stock_doc_created = true;
        consumed.delivery_note_created = true;
        let report = FulfillmentReport {
            processed: 1,
            epcs: vec![consumed, EpcReport::new("BB", EpcOutcome::Failed)],
        };
        assert_eq!(report.failures(), 1);
        assert_eq!(report.stock_docs_created(), 1);
        assert_eq!(report.delivery_notes_created(), 1);
    }
}
