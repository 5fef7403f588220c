//! End-to-end fulfillment scenarios against the in-memory store and ledger.

use rfidgate_core::{
    DocStatus, DocumentKind, EntityType, RfidConfig, RfidError, FulfillmentError, TagStatus,
    TrackedTag,
};
use rfidgate_fulfillment::{
    ClaimRegistry, ClaimRequest, CreateTagRequest, DocumentService, EpcOutcome,
    FulfillmentPipeline, FulfillmentRequest, RuleService, TagRegistry, UpsertRuleRequest,
};
use rfidgate_storage::{InMemoryLedger, InMemoryStore, RecordStore as _};
use rfidgate_test_utils::{assertions, fixtures, ManualClock, SequentialTokens};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const OTHER_ITEM: &str = "ITEM-002";

struct Harness {
    store: Arc<InMemoryStore>,
    ledger: InMemoryLedger,
    clock: Arc<ManualClock>,
    tokens: Arc<SequentialTokens>,
    pipeline: FulfillmentPipeline,
    registry: TagRegistry,
    rules: RuleService,
    claims: ClaimRegistry,
}

fn harness_with(config: RfidConfig) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::at_t0());
    let tokens = Arc::new(SequentialTokens::new());
    let ledger = InMemoryLedger::new();
    let catalog = Arc::new(fixtures::seeded_catalog());
    catalog.add_item(fixtures::item(OTHER_ITEM));
    catalog.add_stock_settings(fixtures::stock_settings(OTHER_ITEM));

    let claims = ClaimRegistry::new(store.clone(), clock.clone(), config.stale_claim_secs);
    let documents = DocumentService::new(
        catalog.clone(),
        Arc::new(ledger.clone()),
        claims.clone(),
        clock.clone(),
    );
    let pipeline = FulfillmentPipeline::new(
        store.clone(),
        documents.clone(),
        clock.clone(),
        config.clone(),
    );
    let registry = TagRegistry::new(
        store.clone(),
        catalog,
        documents,
        clock.clone(),
        tokens.clone(),
        config,
    );
    Harness {
        rules: RuleService::new(store.clone()),
        store,
        ledger,
        clock,
        tokens,
        pipeline,
        registry,
        claims,
    }
}

fn harness() -> Harness {
    harness_with(RfidConfig::default())
}

fn sighting(event_id: &str, reads: &[(&str, &[u8])]) -> FulfillmentRequest {
    let sightings: BTreeMap<String, BTreeSet<u8>> = reads
        .iter()
        .map(|(epc, ants)| (epc.to_string(), ants.iter().copied().collect()))
        .collect();
    FulfillmentRequest {
        device: fixtures::DEVICE.to_string(),
        event_id: Some(event_id.to_string()),
        batch_id: Some("b1".to_string()),
        seq: Some(1),
        sightings,
    }
}

async fn tag(h: &Harness, epc: &str) -> TrackedTag {
    h.store.tag_get(epc).await.unwrap().unwrap()
}

fn stock_docs(h: &Harness) -> Vec<rfidgate_core::BusinessDocument> {
    h.ledger.documents(DocumentKind::StockIssue)
}

// ============================================================================
// PIPELINE
// ============================================================================

#[tokio::test]
async fn test_sighting_consumes_tag_once() {
    let h = harness();
    h.store.tag_insert(&fixtures::printed_tag("AA01", 3)).await.unwrap();

    let report = h.pipeline.process(&sighting("e1", &[("AA01", &[3])])).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.epcs[0].outcome, EpcOutcome::Consumed);
    assert_eq!(report.epcs[0].stock_antenna, Some(3));
    assert!(report.epcs[0].stock_doc_created);

    let consumed = tag(&h, "AA01").await;
    assertions::assert_tag_status(&consumed, TagStatus::Consumed);
    assert_eq!(consumed.consumed_device.as_deref(), Some(fixtures::DEVICE));
    assert_eq!(consumed.last_event_id.as_deref(), Some("e1"));
    assert_eq!(consumed.last_batch_id.as_deref(), Some("b1"));

    let docs = stock_docs(&h);
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].status, DocStatus::Submitted);
    assert_eq!(consumed.owner_stock_doc.as_deref(), Some(docs[0].name.as_str()));
    assert!(docs[0].body.remarks.contains("EPC=AA01 ANT=3"));
    assert!(docs[0].body.remarks.ends_with("RFID consume: ANT=3 DEV=dock-1"));

    // Seen again later: already consumed, nothing new.
    let again = h.pipeline.process(&sighting("e2", &[("AA01", &[3])])).await.unwrap();
    assert_eq!(again.processed, 0);
    assert_eq!(again.epcs[0].outcome, EpcOutcome::NotReady);
    assert_eq!(stock_docs(&h).len(), 1);
}

#[tokio::test]
async fn test_reused_claim_document_is_not_counted_as_created() {
    let h = harness();
    h.store.tag_insert(&fixtures::printed_tag("AA01", 3)).await.unwrap();
    let first = h.pipeline.process(&sighting("e1", &[("AA01", &[3])])).await.unwrap();
    assert_eq!(first.stock_docs_created(), 1);
    let owner = tag(&h, "AA01").await.owner_stock_doc.unwrap();

    // Claim for "e1:AA01" is done; the tag forgot its owner.
    let reset = rfidgate_core::TagUpdate {
        status: Some(TagStatus::Printed),
        owner_stock_doc: Some(None),
        ..Default::default()
    };
    h.store.tag_update("AA01", reset, fixtures::t0()).await.unwrap();

    let replay = h.pipeline.process(&sighting("e1", &[("AA01", &[3])])).await.unwrap();
    assert_eq!(replay.epcs[0].outcome, EpcOutcome::Consumed);
    assert_eq!(replay.epcs[0].stock_doc.as_deref(), Some(owner.as_str()));
    assert!(!replay.epcs[0].stock_doc_created);
    assert_eq!(replay.stock_docs_created(), 0);
    assert_eq!(stock_docs(&h).len(), 1);
}

#[tokio::test]
async fn test_untracked_and_unprinted_epcs_are_left_alone() {
    let h = harness();
    h.store.tag_insert(&fixtures::pending_tag("BB01")).await.unwrap();

    let report = h
        .pipeline
        .process(&sighting("e1", &[("BB01", &[1]), ("FFFF", &[1])]))
        .await
        .unwrap();
    assert_eq!(report.epcs.len(), 1);
    assert_eq!(report.epcs[0].outcome, EpcOutcome::NotReady);
    assertions::assert_tag_status(&tag(&h, "BB01").await, TagStatus::PendingPrint);

    let mut no_event = sighting("e1", &[("BB01", &[1])]);
    no_event.event_id = None;
    assert!(h.pipeline.process(&no_event).await.unwrap().epcs.is_empty());
    assert!(stock_docs(&h).is_empty());
}

#[tokio::test]
async fn test_strict_antenna_match() {
    let strict = harness_with(RfidConfig {
        consume_requires_ant_match: true,
        ..RfidConfig::default()
    });
    strict.store.tag_insert(&fixtures::printed_tag("CC01", 3)).await.unwrap();
    let report = strict.pipeline.process(&sighting("e1", &[("CC01", &[7])])).await.unwrap();
    assert_eq!(report.epcs[0].outcome, EpcOutcome::Unrouted);
    assertions::assert_tag_status(&tag(&strict, "CC01").await, TagStatus::Printed);

    let lenient = harness();
    lenient.store.tag_insert(&fixtures::printed_tag("CC01", 3)).await.unwrap();
    let report = lenient.pipeline.process(&sighting("e1", &[("CC01", &[7])])).await.unwrap();
    assert_eq!(report.epcs[0].outcome, EpcOutcome::Consumed);
    assert_eq!(report.epcs[0].stock_antenna, Some(7));
}

#[tokio::test]
async fn test_rules_create_and_submit_delivery_note() {
    let h = harness();
    h.rules
        .upsert(UpsertRuleRequest {
            device: Some(fixtures::DEVICE.to_string()),
            antenna_id: Some(json!(2)),
            submit_stock: Some(json!(true)),
            create_delivery_note: Some(json!(true)),
            ..Default::default()
        })
        .await
        .unwrap();
    h.rules
        .upsert(UpsertRuleRequest {
            antenna_id: Some(json!(5)),
            submit_delivery_note: Some(json!(true)),
            ..Default::default()
        })
        .await
        .unwrap();
    h.store.tag_insert(&fixtures::printed_tag("DD01", 1)).await.unwrap();

    // Antenna 1 is the declared one, but rules exist and it has none.
    let report = h.pipeline.process(&sighting("e1", &[("DD01", &[1])])).await.unwrap();
    assert_eq!(report.epcs[0].outcome, EpcOutcome::Unrouted);

    let report = h.pipeline.process(&sighting("e2", &[("DD01", &[2, 5])])).await.unwrap();
    let entry = &report.epcs[0];
    assert_eq!(entry.outcome, EpcOutcome::Consumed);
    assert_eq!(entry.stock_antenna, Some(2));
    assert!(entry.delivery_note_created);
    assert!(entry.delivery_submitted);
    assert_eq!(report.delivery_notes_created(), 1);

    let notes = h.ledger.documents(DocumentKind::DeliveryNote);
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].status, DocStatus::Submitted);
    assert!(notes[0].body.remarks.ends_with("RFID delivery: ANT=5 DEV=dock-1"));

    let done = tag(&h, "DD01").await;
    assert_eq!(done.owner_delivery_doc.as_deref(), Some(notes[0].name.as_str()));
    assert!(done.delivery_submitted_at.is_some());
    assert_eq!(done.delivery_device.as_deref(), Some(fixtures::DEVICE));
}

#[tokio::test]
async fn test_failure_is_isolated_and_retryable() {
    let h = harness();
    let mut failing = fixtures::printed_tag("EE01", 1);
    failing.client_request_id = Some("req-ee01".to_string());
    h.store.tag_insert(&failing).await.unwrap();
    let healthy = TrackedTag {
        item_code: OTHER_ITEM.to_string(),
        ..fixtures::printed_tag("EE02", 1)
    };
    h.store.tag_insert(&healthy).await.unwrap();
    h.ledger.reject_submissions_for(fixtures::ITEM_CODE);

    let report = h
        .pipeline
        .process(&sighting("e1", &[("EE01", &[1]), ("EE02", &[1])]))
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.failures(), 1);

    let failed = tag(&h, "EE01").await;
    assertions::assert_tag_status(&failed, TagStatus::Error);
    assert!(failed.last_error.as_deref().unwrap_or_default().contains("rejected"));
    let draft = failed.owner_stock_doc.clone().unwrap();
    assertions::assert_tag_status(&tag(&h, "EE02").await, TagStatus::Consumed);

    // Errored tags are ignored until retried.
    let report = h.pipeline.process(&sighting("e2", &[("EE01", &[1])])).await.unwrap();
    assert_eq!(report.epcs[0].outcome, EpcOutcome::NotReady);

    h.ledger.accept_submissions_for(fixtures::ITEM_CODE);
    let retried = h.registry.retry_tag("ee01").await.unwrap();
    assertions::assert_tag_status(&retried, TagStatus::Printed);
    assert_eq!(retried.last_error, None);

    let report = h.pipeline.process(&sighting("e3", &[("EE01", &[1])])).await.unwrap();
    assert_eq!(report.processed, 1);
    assert!(!report.epcs[0].stock_doc_created);
    let consumed = tag(&h, "EE01").await;
    assertions::assert_tag_status(&consumed, TagStatus::Consumed);
    assert_eq!(consumed.owner_stock_doc, Some(draft));
    assert_eq!(stock_docs(&h).len(), 2);
}

#[tokio::test]
async fn test_cancelled_owner_document_fails_tag() {
    let h = harness();
    h.store.tag_insert(&fixtures::printed_tag("FF01", 1)).await.unwrap();
    h.ledger.reject_submissions_for(fixtures::ITEM_CODE);
    h.pipeline.process(&sighting("e1", &[("FF01", &[1])])).await.unwrap();
    let draft = tag(&h, "FF01").await.owner_stock_doc.unwrap();
    assert!(h.ledger.cancel(DocumentKind::StockIssue, &draft));

    h.registry.retry_tag("FF01").await.unwrap();
    let report = h.pipeline.process(&sighting("e2", &[("FF01", &[1])])).await.unwrap();
    assert_eq!(report.epcs[0].outcome, EpcOutcome::Failed);
    assert!(report.epcs[0].error.as_deref().unwrap_or_default().contains("cancelled"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ingests_create_one_document() {
    let h = harness();
    h.store.tag_insert(&fixtures::printed_tag("AB01", 1)).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let pipeline = h.pipeline.clone();
        handles.push(tokio::spawn(async move {
            pipeline
                .process(&sighting(&format!("e{}", i), &[("AB01", &[1])]))
                .await
        }));
    }
    let mut processed = 0;
    for handle in handles {
        processed += handle.await.unwrap().unwrap().processed;
    }
    assert_eq!(processed, 1);
    assert_eq!(stock_docs(&h).len(), 1);
    assertions::assert_tag_status(&tag(&h, "AB01").await, TagStatus::Consumed);
}

// ============================================================================
// CLAIMS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_claim_creates_once_under_concurrency() {
    let h = harness();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..16 {
        let claims = h.claims.clone();
        let calls = calls.clone();
        handles.push(tokio::spawn(async move {
            let request = ClaimRequest {
                raw_key: "req-1",
                kind: DocumentKind::StockIssue,
                payload_hash: "h",
                epc: None,
            };
            claims
                .create_once(Some(request), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("MAT-STE-00001".to_string())
                })
                .await
        }));
    }
    for handle in handles {
        match handle.await.unwrap() {
            Ok(doc) => assert_eq!(doc.name, "MAT-STE-00001"),
            Err(RfidError::Fulfillment(FulfillmentError::ClaimInProgress { .. })) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stale_claim_is_taken_over() {
    let h = harness();
    let request = ClaimRequest {
        raw_key: "req-2",
        kind: DocumentKind::DeliveryNote,
        payload_hash: "h",
        epc: Some("AA"),
    };
    // Holder crashed before finishing.
    assert!(h.claims.claim(request).await.unwrap().unwrap().created());

    let blocked = h.claims.create_once(Some(request), || async { Ok("X".to_string()) }).await;
    assert!(matches!(
        blocked,
        Err(RfidError::Fulfillment(FulfillmentError::ClaimInProgress { .. }))
    ));

    h.clock.advance_secs(121);
    let doc = h
        .claims
        .create_once(Some(request), || async { Ok("MAT-DN-00001".to_string()) })
        .await
        .unwrap();
    assert_eq!(doc.name, "MAT-DN-00001");
    assert!(doc.created);
}

// ============================================================================
// REGISTRY
// ============================================================================

fn create_request(qty: serde_json::Value, client_request_id: Option<&str>) -> CreateTagRequest {
    CreateTagRequest {
        item_code: Some(fixtures::ITEM_CODE.to_string()),
        qty: Some(qty),
        consume_antenna_id: Some(json!(2)),
        client_request_id: client_request_id.map(str::to_string),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_tag_is_idempotent_per_client_request() {
    let h = harness();
    let first = h.registry.create_item_tag(create_request(json!(3), Some("req-9"))).await.unwrap();
    assert!(!first.existing);
    assert!(first.epc.starts_with("5A42"));
    assert_eq!(first.epc.len(), 24);
    assertions::assert_tag_status(&first.tag, TagStatus::PendingPrint);
    assert_eq!(first.tag.uom, fixtures::STOCK_UOM);
    assert_eq!(first.tag.consume_antenna_id, 2);

    let again = h.registry.create_item_tag(create_request(json!(3), Some("req-9"))).await.unwrap();
    assert!(again.existing);
    assert_eq!(again.epc, first.epc);
}

#[tokio::test]
async fn test_create_tag_retries_taken_epc() {
    let h = harness();
    let first = h.registry.create_item_tag(create_request(json!(1), None)).await.unwrap();
    h.tokens.rewind();
    let second = h.registry.create_item_tag(create_request(json!(1), None)).await.unwrap();
    assert_ne!(first.epc, second.epc);
}

#[tokio::test]
async fn test_create_tag_validation() {
    let h = harness();
    assertions::assert_validation_error(
        &h.registry.create_item_tag(create_request(json!(0), None)).await,
    );
    assertions::assert_validation_error(
        &h.registry.create_item_tag(create_request(json!("abc"), None)).await,
    );
    let unknown = CreateTagRequest {
        item_code: Some("NOPE".to_string()),
        ..create_request(json!(1), None)
    };
    assertions::assert_validation_error(&h.registry.create_item_tag(unknown).await);
    let capped = h.registry.create_item_tag(create_request(json!(5e9), None)).await.unwrap();
    assert_eq!(capped.tag.qty, 1_000_000.0);
}

#[tokio::test]
async fn test_print_drafts_stock_issue_that_sighting_submits() {
    let h = harness();
    let created = h.registry.create_item_tag(create_request(json!(1), Some("req-p"))).await.unwrap();

    let printed = h.registry.mark_tag_printed(&created.epc.to_lowercase()).await.unwrap();
    assert!(printed.stock_doc_created);
    assert_eq!(printed.stock_doc_error, None);
    let draft = printed.stock_doc.clone().unwrap();
    let tag_now = tag(&h, &created.epc).await;
    assertions::assert_tag_status(&tag_now, TagStatus::Printed);
    assert_eq!(tag_now.owner_stock_doc.as_deref(), Some(draft.as_str()));

    // Printing twice does not draft twice.
    let reprinted = h.registry.mark_tag_printed(&created.epc).await.unwrap();
    assert!(!reprinted.stock_doc_created);
    assert_eq!(reprinted.stock_doc.as_deref(), Some(draft.as_str()));

    let report = h
        .pipeline
        .process(&sighting("e1", &[(created.epc.as_str(), &[2])]))
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    let docs = stock_docs(&h);
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].name, draft);
    assert_eq!(docs[0].status, DocStatus::Submitted);
}

#[tokio::test]
async fn test_print_reports_draft_failure() {
    let h = harness();
    let mut tag_without_unit = fixtures::pending_tag("AC01");
    tag_without_unit.uom = "Pallet".to_string();
    h.store.tag_insert(&tag_without_unit).await.unwrap();

    let printed = h.registry.mark_tag_printed("AC01").await.unwrap();
    assert!(!printed.stock_doc_created);
    assert!(printed.stock_doc_error.unwrap().contains("Conversion factor"));
    assertions::assert_tag_status(&tag(&h, "AC01").await, TagStatus::Error);

    assertions::assert_not_found(&h.registry.mark_tag_printed("ABCD").await, EntityType::TrackedTag);
    assertions::assert_validation_error(&h.registry.mark_tag_printed("--").await);
}

#[tokio::test]
async fn test_retry_requires_error_status() {
    let h = harness();
    h.store.tag_insert(&fixtures::printed_tag("AD01", 1)).await.unwrap();
    assertions::assert_validation_error(&h.registry.retry_tag("AD01").await);
}

#[tokio::test]
async fn test_listing_and_lookup() {
    let h = harness();
    h.store.tag_insert(&fixtures::printed_tag("AE01", 1)).await.unwrap();
    h.store.tag_insert(&fixtures::printed_tag("AE02", 1)).await.unwrap();
    h.store.tag_insert(&fixtures::pending_tag("AE03")).await.unwrap();

    let mut epcs = h.registry.list_epcs(&[], None).await.unwrap();
    epcs.sort();
    assert_eq!(epcs, vec!["AE01".to_string(), "AE02".to_string()]);
    let pending = h.registry.list_epcs(&["Pending Print".to_string()], None).await.unwrap();
    assert_eq!(pending, vec!["AE03".to_string()]);
    assertions::assert_validation_error(&h.registry.list_epcs(&["Lost".to_string()], None).await);

    assert_eq!(h.registry.list_recent(None).await.unwrap().len(), 3);

    let info = h
        .registry
        .epc_info(
            &["ae02".to_string(), "AE01".to_string(), "AE02".to_string(), "9999".to_string()],
            None,
        )
        .await
        .unwrap();
    let order: Vec<&str> = info.iter().map(|i| i.epc.as_str()).collect();
    assert_eq!(order, vec!["AE02", "AE01"]);
    assert_eq!(info[0].item_code, fixtures::ITEM_CODE);
    assert_eq!(info[0].status, TagStatus::Printed);

    let limited = h.registry.epc_info(&["AE01".to_string(), "AE02".to_string()], Some(1)).await.unwrap();
    assert_eq!(limited.len(), 1);
}
