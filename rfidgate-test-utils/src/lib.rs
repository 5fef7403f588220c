//! RFIDGATE Test Utilities
//!
//! Shared test infrastructure for the RFIDGATE workspace:
//! - Deterministic seams (clock, token source, realtime publisher)
//! - Proptest generators for inputs and entities
//! - Fixtures for printed tags, items and booking settings
//! - Assertions for the error taxonomy

pub use rfidgate_storage::{InMemoryCatalog, InMemoryLedger, InMemoryStore};

pub use rfidgate_core::{
    AgentRequestStatus, AntennaRule, Clock, ConflictCode, DeliverySettings, EntityType, Item,
    PublishError, RealtimeEvent, RealtimePublisher, RfidError, RfidResult, StockIssueSettings,
    StorageError, TagStatus, Timestamp, TokenSource, TrackedTag, ValidationError,
};

use ::async_trait::async_trait;
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use rfidgate_core::{
    AgentCompletion, AgentRequest, BatchState, ClaimStatus, DocumentKind, EdgeEvent,
    IdempotencyClaim, SavedTag, SavedTagOrder, TagNote, TagUpdate,
};
use rfidgate_storage::{RecordStore, SavedTagDelta};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

// ============================================================================
// DETERMINISTIC SEAMS
// ============================================================================

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<Timestamp>>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    /// Clock starting at [`fixtures::t0`].
    pub fn at_t0() -> Self {
        Self::new(fixtures::t0())
    }

    pub fn advance_secs(&self, secs: i64) {
        if let Ok(mut now) = self.now.write() {
            *now += Duration::seconds(secs);
        }
    }

    pub fn set(&self, at: Timestamp) {
        if let Ok(mut now) = self.now.write() {
            *now = at;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.read().map(|t| *t).unwrap_or_else(|_| fixtures::t0())
    }
}

/// Token source producing counter-derived tokens: `0001`, `0002`, ...
/// padded to the requested width.
#[derive(Debug, Default)]
pub struct SequentialTokens {
    counter: AtomicU64,
}

impl SequentialTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart the sequence so the next token repeats an earlier one.
    pub fn rewind(&self) {
        self.counter.store(0, Ordering::SeqCst);
    }
}

impl TokenSource for SequentialTokens {
    fn hex_token(&self, n_bytes: usize) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let width = n_bytes * 2;
        let hex = format!("{:0width$X}", n, width = width);
        hex[hex.len().saturating_sub(width)..].to_string()
    }
}

/// Publisher that records every event it is handed.
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<RealtimeEvent>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail with `PublishError::Closed`.
    pub fn fail_publishes(&self) {
        if let Ok(mut fail) = self.fail.lock() {
            *fail = true;
        }
    }

    pub fn events(&self) -> Vec<RealtimeEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count_of(&self, event_type: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }
}

impl RealtimePublisher for RecordingPublisher {
    fn publish(&self, event: RealtimeEvent) -> Result<usize, PublishError> {
        if self.fail.lock().map(|f| *f).unwrap_or(false) {
            return Err(PublishError::Closed);
        }
        self.events
            .lock()
            .map_err(|_| PublishError::Failed {
                reason: "recorder poisoned".to_string(),
            })?
            .push(event);
        Ok(1)
    }
}

// ============================================================================
// FAULTY STORE
// ============================================================================

/// In-memory store whose next `n` edge event appends fail with a backend
/// error before anything is written. Everything else passes through.
#[derive(Debug, Clone, Default)]
pub struct FlakyAppendStore {
    inner: InMemoryStore,
    failures_left: Arc<AtomicUsize>,
}

impl FlakyAppendStore {
    pub fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            failures_left: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fail_next_appends(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RecordStore for FlakyAppendStore {
    async fn edge_event_append(
        &self,
        event: &EdgeEvent,
        state: &BatchState,
        expected_version: i64,
    ) -> RfidResult<bool> {
        if self.take_failure() {
            return Err(RfidError::Storage(StorageError::Backend {
                reason: "connection reset".to_string(),
            }));
        }
        self.inner.edge_event_append(event, state, expected_version).await
    }

    async fn edge_event_get(&self, event_id: &str) -> RfidResult<Option<EdgeEvent>> {
        self.inner.edge_event_get(event_id).await
    }

    async fn batch_state_get(&self, device_id: &str) -> RfidResult<Option<BatchState>> {
        self.inner.batch_state_get(device_id).await
    }

    async fn claim_insert(&self, claim: &IdempotencyClaim) -> RfidResult<()> {
        self.inner.claim_insert(claim).await
    }

    async fn claim_get(&self, key: &str) -> RfidResult<Option<IdempotencyClaim>> {
        self.inner.claim_get(key).await
    }

    async fn claim_take_over(
        &self,
        key: &str,
        observed_claimed_at: Timestamp,
        now: Timestamp,
    ) -> RfidResult<bool> {
        self.inner.claim_take_over(key, observed_claimed_at, now).await
    }

    async fn claim_finish(
        &self,
        key: &str,
        status: ClaimStatus,
        owner_doc_type: DocumentKind,
        owner_doc_name: Option<&str>,
        error: Option<&str>,
    ) -> RfidResult<()> {
        self.inner
            .claim_finish(key, status, owner_doc_type, owner_doc_name, error)
            .await
    }

    async fn claim_release_failed(&self, key: &str) -> RfidResult<bool> {
        self.inner.claim_release_failed(key).await
    }

    async fn antenna_rule_list(&self) -> RfidResult<Vec<AntennaRule>> {
        self.inner.antenna_rule_list().await
    }

    async fn antenna_rule_upsert(&self, rule: &AntennaRule) -> RfidResult<()> {
        self.inner.antenna_rule_upsert(rule).await
    }

    async fn antenna_rule_delete(&self, device: &str, antenna_id: u8) -> RfidResult<bool> {
        self.inner.antenna_rule_delete(device, antenna_id).await
    }

    async fn tag_insert(&self, tag: &TrackedTag) -> RfidResult<()> {
        self.inner.tag_insert(tag).await
    }

    async fn tag_get(&self, epc: &str) -> RfidResult<Option<TrackedTag>> {
        self.inner.tag_get(epc).await
    }

    async fn tag_find_by_client_request(
        &self,
        client_request_id: &str,
    ) -> RfidResult<Option<TrackedTag>> {
        self.inner.tag_find_by_client_request(client_request_id).await
    }

    async fn tag_get_many(&self, epcs: &[String]) -> RfidResult<Vec<TrackedTag>> {
        self.inner.tag_get_many(epcs).await
    }

    async fn tag_update(&self, epc: &str, update: TagUpdate, now: Timestamp) -> RfidResult<()> {
        self.inner.tag_update(epc, update, now).await
    }

    async fn tag_claim_for_processing(
        &self,
        epc: &str,
        now: Timestamp,
        reclaim_ttl_secs: u64,
    ) -> RfidResult<bool> {
        self.inner
            .tag_claim_for_processing(epc, now, reclaim_ttl_secs)
            .await
    }

    async fn tag_list_recent(&self, limit: usize) -> RfidResult<Vec<TrackedTag>> {
        self.inner.tag_list_recent(limit).await
    }

    async fn tag_list_by_status(
        &self,
        statuses: &[TagStatus],
        limit: usize,
    ) -> RfidResult<Vec<TrackedTag>> {
        self.inner.tag_list_by_status(statuses, limit).await
    }

    async fn agent_request_insert(&self, request: &AgentRequest) -> RfidResult<()> {
        self.inner.agent_request_insert(request).await
    }

    async fn agent_request_get(&self, request_id: &str) -> RfidResult<Option<AgentRequest>> {
        self.inner.agent_request_get(request_id).await
    }

    async fn agent_request_list_pollable(
        &self,
        agent_id: &str,
        now: Timestamp,
        limit: usize,
    ) -> RfidResult<Vec<AgentRequest>> {
        self.inner
            .agent_request_list_pollable(agent_id, now, limit)
            .await
    }

    async fn agent_request_lease(
        &self,
        request_id: &str,
        now: Timestamp,
        lease_until: Timestamp,
    ) -> RfidResult<bool> {
        self.inner
            .agent_request_lease(request_id, now, lease_until)
            .await
    }

    async fn agent_request_complete(
        &self,
        request_id: &str,
        completion: &AgentCompletion,
    ) -> RfidResult<bool> {
        self.inner.agent_request_complete(request_id, completion).await
    }

    async fn saved_tags_upsert(
        &self,
        deltas: &[SavedTagDelta],
        device: &str,
        now: Timestamp,
    ) -> RfidResult<usize> {
        self.inner.saved_tags_upsert(deltas, device, now).await
    }

    async fn saved_tags_list(
        &self,
        day: Option<NaiveDate>,
        order: SavedTagOrder,
        limit: usize,
    ) -> RfidResult<Vec<SavedTag>> {
        self.inner.saved_tags_list(day, order, limit).await
    }

    async fn saved_tags_clear(&self, day: Option<NaiveDate>) -> RfidResult<()> {
        self.inner.saved_tags_clear(day).await
    }

    async fn tag_note_upsert(&self, note: &TagNote) -> RfidResult<TagNote> {
        self.inner.tag_note_upsert(note).await
    }

    async fn tag_note_delete(&self, epc: &str) -> RfidResult<bool> {
        self.inner.tag_note_delete(epc).await
    }

    async fn tag_notes_list(&self, epcs: &[String], limit: usize) -> RfidResult<Vec<TagNote>> {
        self.inner.tag_notes_list(epcs, limit).await
    }

    async fn ping(&self) -> RfidResult<()> {
        self.inner.ping().await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for RFIDGATE inputs.

    use super::*;
    use proptest::prelude::*;

    /// Normalized EPC: 4..24 uppercase hex chars.
    pub fn arb_epc() -> impl Strategy<Value = String> {
        "[0-9A-F]{4,24}"
    }

    /// Raw EPC as an agent might send it: mixed case with separators.
    pub fn arb_raw_epc() -> impl Strategy<Value = String> {
        "[0-9a-fA-F: -]{0,40}"
    }

    pub fn arb_antenna() -> impl Strategy<Value = u8> {
        1u8..=31
    }

    pub fn arb_device_id() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{0,15}"
    }

    /// Strictly increasing seq numbers starting at zero or above.
    pub fn arb_increasing_seqs() -> impl Strategy<Value = Vec<i64>> {
        (0i64..10, prop::collection::vec(1i64..5, 1..20)).prop_map(|(start, steps)| {
            let mut seq = start;
            steps
                .into_iter()
                .map(|step| {
                    seq += step;
                    seq
                })
                .collect()
        })
    }

    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1_577_836_800i64..1_893_456_000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(fixtures::t0)
        })
    }

    pub fn arb_tag_status() -> impl Strategy<Value = TagStatus> {
        prop_oneof![
            Just(TagStatus::PendingPrint),
            Just(TagStatus::Printed),
            Just(TagStatus::Processing),
            Just(TagStatus::Consumed),
            Just(TagStatus::Error),
        ]
    }

    pub fn arb_antenna_rule() -> impl Strategy<Value = AntennaRule> {
        (
            prop_oneof![Just("any".to_string()), arb_device_id()],
            arb_antenna(),
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(|(device, antenna_id, submit_stock, dn, submit_dn)| AntennaRule {
                device,
                antenna_id,
                submit_stock,
                create_delivery_note: submit_stock && dn,
                submit_delivery_note: submit_dn,
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;

    pub const ITEM_CODE: &str = "ITEM-001";
    pub const STOCK_UOM: &str = "Nos";
    pub const DEVICE: &str = "dock-1";

    /// Fixed reference instant used by fixtures and [`ManualClock::at_t0`].
    pub fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn item(item_code: &str) -> Item {
        Item {
            item_code: item_code.to_string(),
            item_name: format!("{} name", item_code),
            stock_uom: STOCK_UOM.to_string(),
        }
    }

    pub fn stock_settings(item_code: &str) -> StockIssueSettings {
        StockIssueSettings {
            item_code: item_code.to_string(),
            company: "Acme Foods".to_string(),
            warehouse: "Stores - AF".to_string(),
            naming_series: None,
        }
    }

    pub fn delivery_settings(item_code: &str) -> DeliverySettings {
        DeliverySettings {
            item_code: item_code.to_string(),
            company: "Acme Foods".to_string(),
            customer: "Walk-in".to_string(),
            warehouse: "Finished - AF".to_string(),
            selling_price_list: Some("Standard Selling".to_string()),
            default_rate: 12.5,
        }
    }

    /// Catalog with [`ITEM_CODE`] fully configured for stock issue and
    /// delivery, plus a `Box` unit worth 10 stock units.
    pub fn seeded_catalog() -> InMemoryCatalog {
        let catalog = InMemoryCatalog::new();
        catalog.add_item(item(ITEM_CODE));
        catalog.add_conversion(ITEM_CODE, "Box", 10.0);
        catalog.add_stock_settings(stock_settings(ITEM_CODE));
        catalog.add_delivery_settings(delivery_settings(ITEM_CODE));
        catalog
    }

    /// Tag that is ready for fulfillment on `consume_antenna_id`.
    pub fn printed_tag(epc: &str, consume_antenna_id: u8) -> TrackedTag {
        TrackedTag {
            epc: epc.to_string(),
            item_code: ITEM_CODE.to_string(),
            item_name: Some(format!("{} name", ITEM_CODE)),
            qty: 1.0,
            uom: STOCK_UOM.to_string(),
            consume_antenna_id,
            status: TagStatus::Printed,
            client_request_id: None,
            requested_by: None,
            printed_at: Some(t0()),
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
            created_at: t0(),
            modified_at: t0(),
        }
    }

    pub fn pending_tag(epc: &str) -> TrackedTag {
        TrackedTag {
            status: TagStatus::PendingPrint,
            printed_at: None,
            ..printed_tag(epc, 1)
        }
    }

    pub fn rule(device: &str, antenna_id: u8, submit_stock: bool) -> AntennaRule {
        AntennaRule {
            device: device.to_string(),
            antenna_id,
            submit_stock,
            create_delivery_note: false,
            submit_delivery_note: false,
        }
    }

    /// One agent tag read as sent to `ingest_tags`.
    pub fn read(epc: &str, ant: u8) -> serde_json::Value {
        serde_json::json!({ "epc": epc, "ant": ant, "count": 1 })
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over the RFIDGATE error taxonomy.

    use super::*;

    #[track_caller]
    pub fn assert_conflict<T: std::fmt::Debug>(result: &RfidResult<T>, code: ConflictCode) {
        match result {
            Err(RfidError::Conflict(conflict)) => {
                assert_eq!(conflict.code, code, "Wrong conflict code: {}", conflict.message)
            }
            other => panic!("Expected {} conflict, got: {:?}", code, other),
        }
    }

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &RfidResult<T>) {
        match result {
            Err(RfidError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &RfidResult<T>, entity_type: EntityType) {
        match result {
            Err(RfidError::Storage(StorageError::NotFound {
                entity_type: et, ..
            })) => {
                assert_eq!(*et, entity_type, "Wrong entity type in NotFound error");
            }
            other => panic!("Expected NotFound error for {:?}, got: {:?}", entity_type, other),
        }
    }

    #[track_caller]
    pub fn assert_tag_status(tag: &TrackedTag, expected: TagStatus) {
        assert_eq!(
            tag.status, expected,
            "Tag {} has status {:?}, last_error={:?}",
            tag.epc, tag.status, tag.last_error
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rfidgate_core::{normalize, ConflictError};

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at_t0();
        clock.advance_secs(90);
        assert_eq!(clock.now(), fixtures::t0() + Duration::seconds(90));
    }

    #[test]
    fn test_sequential_tokens() {
        let tokens = SequentialTokens::new();
        assert_eq!(tokens.hex_token(2), "0001");
        assert_eq!(tokens.request_id(), "00000000000000000002");
        tokens.rewind();
        assert_eq!(tokens.hex_token(1), "01");
    }

    #[test]
    fn test_recording_publisher() {
        let publisher = RecordingPublisher::new();
        let event = RealtimeEvent::AgentReply {
            requested_by: None,
            reply: serde_json::json!({}),
        };
        assert_eq!(publisher.publish(event.clone()), Ok(1));
        assert_eq!(publisher.count_of("agent_reply"), 1);
        publisher.fail_publishes();
        assert_eq!(publisher.publish(event), Err(PublishError::Closed));
        assert_eq!(publisher.events().len(), 1);
    }

    #[test]
    fn test_printed_tag_is_ready() {
        assert!(fixtures::printed_tag("AA", 1).is_ready_for_fulfillment());
        assert!(!fixtures::pending_tag("AA").is_ready_for_fulfillment());
    }

    #[test]
    fn test_assert_conflict() {
        let result: RfidResult<()> = Err(ConflictError::new(ConflictCode::SeqRegression, "x").into());
        assertions::assert_conflict(&result, ConflictCode::SeqRegression);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_generated_epcs_are_normalized(epc in generators::arb_epc()) {
            prop_assert_eq!(normalize::normalize_epc(&epc), epc);
        }

        #[test]
        fn prop_generated_seqs_increase(seqs in generators::arb_increasing_seqs()) {
            prop_assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        }

        #[test]
        fn prop_generated_rules_respect_dn_flag(rule in generators::arb_antenna_rule()) {
            prop_assert!(!rule.create_delivery_note || rule.submit_stock);
        }
    }
}
