//! Stock issue and delivery note documents for tracked tags.

use crate::claims::{ClaimRegistry, ClaimRequest, ClaimedDocument};
use rfidgate_core::normalize::{truncate_chars, MAX_DEVICE_LEN};
use rfidgate_core::{
    payload_hash, BusinessDocument, Clock, DocumentDraft, DocumentKind, DocumentLine,
    FulfillmentError, Provenance, RfidResult, TrackedTag,
};
use rfidgate_storage::{DocumentLedger, ItemCatalog};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

pub const STOCK_ISSUE_PURPOSE: &str = "Material Issue";
pub const MAX_CONVERSION_FACTOR: f64 = 1_000_000.0;

/// Everything a document for one tag is built from.
#[derive(Debug, Clone, Copy)]
pub struct TagDocumentInput<'a> {
    pub tag: &'a TrackedTag,
    pub antenna: u8,
    pub device: &'a str,
    pub provenance: &'a Provenance,
    /// Claim key; `None` creates without a claim.
    pub idempotency_key: Option<&'a str>,
}

impl TagDocumentInput<'_> {
    fn device(&self) -> String {
        truncate_chars(self.device, MAX_DEVICE_LEN)
    }

    fn payload_hash(&self) -> String {
        payload_hash(&json!({
            "item_code": self.tag.item_code,
            "qty": self.tag.qty,
            "uom": self.tag.uom,
            "ant_id": self.antenna,
            "device": self.device(),
            "epc": self.tag.epc,
        }))
    }

    fn remarks(&self) -> String {
        audit_remarks(&self.tag.epc, self.antenna, &self.device(), self.provenance)
    }
}

/// `RFID: EPC=.. ANT=.. DEV=..` followed by whichever of `EVENT=`, `BATCH=`
/// and `SEQ=` are known.
pub fn audit_remarks(epc: &str, antenna: u8, device: &str, provenance: &Provenance) -> String {
    let mut remarks = format!("RFID: EPC={} ANT={} DEV={}", epc, antenna, device);
    if let Some(event_id) = provenance.event_id.as_deref().filter(|s| !s.is_empty()) {
        remarks.push_str(&format!(" EVENT={}", event_id));
    }
    if let Some(batch_id) = provenance.batch_id.as_deref().filter(|s| !s.is_empty()) {
        remarks.push_str(&format!(" BATCH={}", batch_id));
    }
    if let Some(seq) = provenance.seq {
        remarks.push_str(&format!(" SEQ={}", seq));
    }
    remarks
}

/// Remark line appended when a document is submitted.
pub fn submit_remark(kind: DocumentKind, antenna: u8, device: &str) -> String {
    let verb = match kind {
        DocumentKind::StockIssue => "consume",
        DocumentKind::DeliveryNote => "delivery",
    };
    format!("RFID {}: ANT={} DEV={}", verb, antenna, device)
}

/// Builds, claims and submits documents through the catalog and ledger.
#[derive(Clone)]
pub struct DocumentService {
    catalog: Arc<dyn ItemCatalog>,
    ledger: Arc<dyn DocumentLedger>,
    claims: ClaimRegistry,
    clock: Arc<dyn Clock>,
}

impl DocumentService {
    pub fn new(
        catalog: Arc<dyn ItemCatalog>,
        ledger: Arc<dyn DocumentLedger>,
        claims: ClaimRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            catalog,
            ledger,
            claims,
            clock,
        }
    }

    pub fn claims(&self) -> &ClaimRegistry {
        &self.claims
    }

    pub async fn get(&self, kind: DocumentKind, name: &str) -> RfidResult<Option<BusinessDocument>> {
        self.ledger.get(kind, name).await
    }

    /// Create (or reuse, under the same key) a stock issue draft.
    pub async fn create_stock_issue(
        &self,
        input: TagDocumentInput<'_>,
    ) -> RfidResult<ClaimedDocument> {
        self.create(DocumentKind::StockIssue, input).await
    }

    /// Create (or reuse, under the same key) a delivery note draft.
    pub async fn create_delivery_note(
        &self,
        input: TagDocumentInput<'_>,
    ) -> RfidResult<ClaimedDocument> {
        self.create(DocumentKind::DeliveryNote, input).await
    }

    async fn create(
        &self,
        kind: DocumentKind,
        input: TagDocumentInput<'_>,
    ) -> RfidResult<ClaimedDocument> {
        check_tag_meta(input.tag)?;
        let hash = input.payload_hash();
        let request = input.idempotency_key.map(|raw_key| ClaimRequest {
            raw_key,
            kind,
            payload_hash: &hash,
            epc: Some(&input.tag.epc),
        });
        self.claims
            .create_once(request, move || async move {
                let draft = match kind {
                    DocumentKind::StockIssue => self.stock_issue_draft(&input).await?,
                    DocumentKind::DeliveryNote => self.delivery_note_draft(&input).await?,
                };
                let doc = self.ledger.insert_draft(draft).await?;
                info!(
                    epc = %input.tag.epc,
                    kind = %kind,
                    document = %doc.name,
                    "Document draft created"
                );
                Ok(doc.name)
            })
            .await
    }

    /// Submit a document, stamping the posting time and a remark line.
    pub async fn submit(
        &self,
        kind: DocumentKind,
        name: &str,
        antenna: u8,
        device: &str,
    ) -> RfidResult<BusinessDocument> {
        let device = truncate_chars(device, MAX_DEVICE_LEN);
        let remark = submit_remark(kind, antenna, &device);
        self.ledger
            .submit(kind, name, &remark, self.clock.now())
            .await
    }

    async fn stock_unit(&self, item_code: &str) -> RfidResult<String> {
        self.catalog
            .item(item_code)
            .await?
            .map(|item| item.stock_uom.trim().to_string())
            .filter(|uom| !uom.is_empty())
            .ok_or_else(|| {
                FulfillmentError::MissingStockUom {
                    item_code: item_code.to_string(),
                }
                .into()
            })
    }

    /// Factor from `uom` to `stock_uom`. 1 when they are the same unit.
    pub async fn conversion_factor(
        &self,
        item_code: &str,
        uom: &str,
        stock_uom: &str,
    ) -> RfidResult<f64> {
        let uom = uom.trim();
        let stock_uom = stock_uom.trim();
        if uom.is_empty() || stock_uom.is_empty() || uom == stock_uom {
            return Ok(1.0);
        }
        match self.catalog.conversion_factor(item_code, uom).await? {
            Some(factor) if factor.is_finite() && factor > 0.0 => {
                Ok(factor.min(MAX_CONVERSION_FACTOR))
            }
            _ => Err(FulfillmentError::MissingConversionFactor {
                item_code: item_code.to_string(),
                uom: uom.to_string(),
                stock_uom: stock_uom.to_string(),
            }
            .into()),
        }
    }

    async fn line(&self, tag: &TrackedTag, warehouse: &str, rate: Option<f64>) -> RfidResult<DocumentLine> {
        let stock_uom = self.stock_unit(&tag.item_code).await?;
        let uom = if tag.uom.trim().is_empty() {
            stock_uom.clone()
        } else {
            tag.uom.trim().to_string()
        };
        let factor = self.conversion_factor(&tag.item_code, &uom, &stock_uom).await?;
        Ok(DocumentLine {
            item_code: tag.item_code.clone(),
            qty: tag.qty,
            uom,
            stock_uom,
            conversion_factor: factor,
            transfer_qty: tag.qty * factor,
            warehouse: warehouse.to_string(),
            rate,
        })
    }

    pub async fn stock_issue_draft(&self, input: &TagDocumentInput<'_>) -> RfidResult<DocumentDraft> {
        let item_code = &input.tag.item_code;
        let settings = self
            .catalog
            .stock_issue_settings(item_code)
            .await?
            .ok_or_else(|| FulfillmentError::MissingSettings {
                kind: "stock issue".to_string(),
                item_code: item_code.clone(),
            })?;
        let line = self.line(input.tag, &settings.warehouse, None).await?;
        Ok(DocumentDraft {
            kind: DocumentKind::StockIssue,
            company: settings.company,
            customer: None,
            selling_price_list: None,
            naming_series: settings.naming_series.filter(|s| !s.trim().is_empty()),
            purpose: Some(STOCK_ISSUE_PURPOSE.to_string()),
            posting_at: self.clock.now(),
            remarks: input.remarks(),
            lines: vec![line],
        })
    }

    pub async fn delivery_note_draft(
        &self,
        input: &TagDocumentInput<'_>,
    ) -> RfidResult<DocumentDraft> {
        let item_code = &input.tag.item_code;
        let settings = self
            .catalog
            .delivery_settings(item_code)
            .await?
            .ok_or_else(|| FulfillmentError::MissingSettings {
                kind: "delivery note".to_string(),
                item_code: item_code.clone(),
            })?;
        let rate = if settings.default_rate.is_finite() {
            settings.default_rate.max(0.0)
        } else {
            0.0
        };
        let line = self.line(input.tag, &settings.warehouse, Some(rate)).await?;
        Ok(DocumentDraft {
            kind: DocumentKind::DeliveryNote,
            company: settings.company,
            customer: Some(settings.customer),
            selling_price_list: settings.selling_price_list.filter(|s| !s.trim().is_empty()),
            naming_series: None,
            purpose: None,
            posting_at: self.clock.now(),
            remarks: input.remarks(),
            lines: vec![line],
        })
    }
}

fn check_tag_meta(tag: &TrackedTag) -> RfidResult<()> {
    if tag.item_code.trim().is_empty() || !(tag.qty > 0.0) || tag.uom.trim().is_empty() {
        return Err(FulfillmentError::InvalidTagMeta {
            epc: tag.epc.clone(),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfidgate_core::{DocStatus, RfidError};
    use rfidgate_storage::{InMemoryLedger, InMemoryStore};
    use rfidgate_test_utils::{fixtures, ManualClock};

    fn service() -> (DocumentService, InMemoryLedger) {
        let clock = Arc::new(ManualClock::at_t0());
        let ledger = InMemoryLedger::new();
        let claims = ClaimRegistry::new(Arc::new(InMemoryStore::new()), clock.clone(), 120);
        let service = DocumentService::new(
            Arc::new(fixtures::seeded_catalog()),
            Arc::new(ledger.clone()),
            claims,
            clock,
        );
        (service, ledger)
    }

    fn provenance() -> Provenance {
        Provenance {
            event_id: Some("e1".to_string()),
            batch_id: Some("b1".to_string()),
            seq: Some(4),
            device_id: Some("dock-1".to_string()),
        }
    }

    #[test]
    fn test_audit_remarks() {
        assert_eq!(
            audit_remarks("AA", 2, "dock-1", &provenance()),
            "RFID: EPC=AA ANT=2 DEV=dock-1 EVENT=e1 BATCH=b1 SEQ=4"
        );
        assert_eq!(
            audit_remarks("AA", 0, "print", &Provenance::default()),
            "RFID: EPC=AA ANT=0 DEV=print"
        );
        assert_eq!(
            submit_remark(DocumentKind::DeliveryNote, 6, "dock-1"),
            "RFID delivery: ANT=6 DEV=dock-1"
        );
    }

    #[tokio::test]
    async fn test_stock_issue_converts_to_stock_unit() {
        let (service, ledger) = service();
        let mut tag = fixtures::printed_tag("AA", 1);
        tag.uom = "Box".to_string();
        tag.qty = 2.0;
        let prov = provenance();
        let input = TagDocumentInput {
            tag: &tag,
            antenna: 1,
            device: "dock-1",
            provenance: &prov,
            idempotency_key: Some("e1:AA"),
        };
        let first = service.create_stock_issue(input).await.unwrap();
        assert!(first.created);
        let name = first.name;
        assert_eq!(name, "MAT-STE-00001");

        let doc = service.get(DocumentKind::StockIssue, &name).await.unwrap().unwrap();
        assert_eq!(doc.status, DocStatus::Draft);
        assert_eq!(doc.body.purpose.as_deref(), Some(STOCK_ISSUE_PURPOSE));
        let line = &doc.body.lines[0];
        assert_eq!(line.conversion_factor, 10.0);
        assert_eq!(line.transfer_qty, 20.0);
        assert_eq!(line.warehouse, "Stores - AF");
        assert!(doc.body.remarks.contains("SEQ=4"));

        // Same key, same document, not created again.
        let again = service.create_stock_issue(input).await.unwrap();
        assert_eq!(again.name, name);
        assert!(!again.created);
        assert_eq!(ledger.documents(DocumentKind::StockIssue).len(), 1);
    }

    #[tokio::test]
    async fn test_missing_conversion_factor_fails() {
        let (service, _) = service();
        let mut tag = fixtures::printed_tag("AA", 1);
        tag.uom = "Pallet".to_string();
        let prov = Provenance::default();
        let input = TagDocumentInput {
            tag: &tag,
            antenna: 1,
            device: "dock-1",
            provenance: &prov,
            idempotency_key: None,
        };
        let err = service.create_stock_issue(input).await.unwrap_err();
        assert!(matches!(
            err,
            RfidError::Fulfillment(FulfillmentError::MissingConversionFactor { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_meta_is_rejected_before_claiming() {
        let (service, _) = service();
        let mut tag = fixtures::printed_tag("AA", 1);
        tag.qty = 0.0;
        let prov = Provenance::default();
        let input = TagDocumentInput {
            tag: &tag,
            antenna: 1,
            device: "dock-1",
            provenance: &prov,
            idempotency_key: Some("k"),
        };
        assert!(matches!(
            service.create_stock_issue(input).await,
            Err(RfidError::Fulfillment(FulfillmentError::InvalidTagMeta { .. }))
        ));
        let outcome = service
            .claims()
            .claim(ClaimRequest {
                raw_key: "k",
                kind: DocumentKind::StockIssue,
                payload_hash: "",
                epc: None,
            })
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.created());
    }

    #[tokio::test]
    async fn test_delivery_note_is_priced_and_submitted_once() {
        let (service, ledger) = service();
        let tag = fixtures::printed_tag("AA", 1);
        let prov = provenance();
        let input = TagDocumentInput {
            tag: &tag,
            antenna: 1,
            device: "dock-1",
            provenance: &prov,
            idempotency_key: Some("e1:AA"),
        };
        let name = service.create_delivery_note(input).await.unwrap().name;
        let doc = service
            .submit(DocumentKind::DeliveryNote, &name, 6, "dock-1")
            .await
            .unwrap();
        assert_eq!(doc.status, DocStatus::Submitted);
        assert_eq!(doc.body.customer.as_deref(), Some("Walk-in"));
        assert_eq!(doc.body.lines[0].rate, Some(12.5));
        assert!(doc.body.remarks.ends_with("RFID delivery: ANT=6 DEV=dock-1"));

        let again = service
            .submit(DocumentKind::DeliveryNote, &name, 6, "dock-1")
            .await
            .unwrap();
        assert_eq!(again.body.remarks, doc.body.remarks);
        assert_eq!(ledger.documents(DocumentKind::DeliveryNote).len(), 1);
    }
}
