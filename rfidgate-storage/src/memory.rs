//! In-memory implementations of the storage traits.
//!
//! Every conditional write happens under a single write lock, which gives the
//! same atomicity a relational backend gets from one UPDATE statement.

use crate::catalog::{append_remark, DocumentLedger, ItemCatalog};
use crate::record_store::{constraints, RecordStore, SavedTagDelta};
use ::async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate};
use rfidgate_core::{
    AgentCompletion, AgentRequest, AgentRequestStatus, AntennaRule, BatchState, BusinessDocument,
    ClaimStatus, DeliverySettings, DocStatus, DocumentDraft, DocumentKind, EdgeEvent, EntityType,
    FulfillmentError, IdempotencyClaim, Item, RfidError, RfidResult, SavedTag, SavedTagOrder,
    SeqPosition, StockIssueSettings, StorageError, TagNote, TagStatus, TagUpdate, Timestamp,
    TrackedTag,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

fn read<T>(lock: &RwLock<T>) -> RfidResult<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| RfidError::Storage(StorageError::LockPoisoned))
}

fn write<T>(lock: &RwLock<T>) -> RfidResult<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| RfidError::Storage(StorageError::LockPoisoned))
}

fn duplicate(entity_type: EntityType, constraint: &str, key: impl Into<String>) -> RfidError {
    RfidError::Storage(StorageError::DuplicateKey {
        entity_type,
        constraint: constraint.to_string(),
        key: key.into(),
    })
}

fn not_found(entity_type: EntityType, key: impl Into<String>) -> RfidError {
    RfidError::Storage(StorageError::NotFound {
        entity_type,
        key: key.into(),
    })
}

// ============================================================================
// RECORD STORE
// ============================================================================

#[derive(Debug, Default)]
struct EventTables {
    by_id: HashMap<String, EdgeEvent>,
    by_position: HashMap<SeqPosition, String>,
}

#[derive(Debug, Default)]
struct SavedTables {
    overall: HashMap<String, SavedTag>,
    by_day: HashMap<(String, NaiveDate), SavedTag>,
}

/// In-memory record store for tests and single-node deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    events: Arc<RwLock<EventTables>>,
    batch_states: Arc<RwLock<HashMap<String, BatchState>>>,
    claims: Arc<RwLock<HashMap<String, IdempotencyClaim>>>,
    rules: Arc<RwLock<BTreeMap<(String, u8), AntennaRule>>>,
    tags: Arc<RwLock<HashMap<String, TrackedTag>>>,
    agent_requests: Arc<RwLock<HashMap<String, AgentRequest>>>,
    saved: Arc<RwLock<SavedTables>>,
    notes: Arc<RwLock<BTreeMap<String, TagNote>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored edge events.
    pub fn edge_event_count(&self) -> usize {
        self.events.read().map(|t| t.by_id.len()).unwrap_or(0)
    }
}

fn add_reads(row: &mut SavedTag, reads: i64, device: &str, now: Timestamp) {
    row.reads += reads;
    row.last_seen = now;
    row.device = device.to_string();
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn edge_event_append(
        &self,
        event: &EdgeEvent,
        state: &BatchState,
        expected_version: i64,
    ) -> RfidResult<bool> {
        // Lock order: events, then batch states.
        let mut tables = write(&self.events)?;
        let mut states = write(&self.batch_states)?;

        let current_version = states.get(&state.device_id).map_or(0, |s| s.version);
        if current_version != expected_version {
            return Ok(false);
        }
        if tables.by_id.contains_key(&event.event_id) {
            return Err(duplicate(
                EntityType::EdgeEvent,
                constraints::EVENT_ID,
                event.event_id.clone(),
            ));
        }
        let position = event.position();
        if let Some(position) = &position {
            if tables.by_position.contains_key(position) {
                return Err(duplicate(
                    EntityType::EdgeEvent,
                    constraints::EVENT_POSITION,
                    position.to_string(),
                ));
            }
        }

        if let Some(position) = position {
            tables.by_position.insert(position, event.event_id.clone());
        }
        tables.by_id.insert(event.event_id.clone(), event.clone());
        let mut next = state.clone();
        next.version = expected_version + 1;
        states.insert(state.device_id.clone(), next);
        Ok(true)
    }

    async fn edge_event_get(&self, event_id: &str) -> RfidResult<Option<EdgeEvent>> {
        Ok(read(&self.events)?.by_id.get(event_id).cloned())
    }

    async fn batch_state_get(&self, device_id: &str) -> RfidResult<Option<BatchState>> {
        Ok(read(&self.batch_states)?.get(device_id).cloned())
    }

    async fn claim_insert(&self, claim: &IdempotencyClaim) -> RfidResult<()> {
        let mut claims = write(&self.claims)?;
        if claims.contains_key(&claim.key) {
            return Err(duplicate(
                EntityType::IdempotencyClaim,
                constraints::CLAIM_KEY,
                claim.key.clone(),
            ));
        }
        claims.insert(claim.key.clone(), claim.clone());
        Ok(())
    }

    async fn claim_get(&self, key: &str) -> RfidResult<Option<IdempotencyClaim>> {
        Ok(read(&self.claims)?.get(key).cloned())
    }

    async fn claim_take_over(
        &self,
        key: &str,
        observed_claimed_at: Timestamp,
        now: Timestamp,
    ) -> RfidResult<bool> {
        let mut claims = write(&self.claims)?;
        match claims.get_mut(key) {
            Some(claim)
                if claim.status == ClaimStatus::Claimed
                    && claim.claimed_at == observed_claimed_at =>
            {
                claim.claimed_at = now;
                claim.last_error = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_finish(
        &self,
        key: &str,
        status: ClaimStatus,
        owner_doc_type: DocumentKind,
        owner_doc_name: Option<&str>,
        error: Option<&str>,
    ) -> RfidResult<()> {
        let mut claims = write(&self.claims)?;
        let claim = claims
            .get_mut(key)
            .ok_or_else(|| not_found(EntityType::IdempotencyClaim, key))?;
        claim.status = status;
        claim.owner_doc_type = Some(owner_doc_type);
        claim.owner_doc_name = owner_doc_name.map(str::to_string);
        claim.last_error = error.map(str::to_string);
        Ok(())
    }

    async fn claim_release_failed(&self, key: &str) -> RfidResult<bool> {
        let mut claims = write(&self.claims)?;
        if claims.get(key).is_some_and(|c| c.status == ClaimStatus::Failed) {
            claims.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn antenna_rule_list(&self) -> RfidResult<Vec<AntennaRule>> {
        Ok(read(&self.rules)?.values().cloned().collect())
    }

    async fn antenna_rule_upsert(&self, rule: &AntennaRule) -> RfidResult<()> {
        write(&self.rules)?.insert((rule.device.clone(), rule.antenna_id), rule.clone());
        Ok(())
    }

    async fn antenna_rule_delete(&self, device: &str, antenna_id: u8) -> RfidResult<bool> {
        Ok(write(&self.rules)?
            .remove(&(device.to_string(), antenna_id))
            .is_some())
    }

    async fn tag_insert(&self, tag: &TrackedTag) -> RfidResult<()> {
        let mut tags = write(&self.tags)?;
        if tags.contains_key(&tag.epc) {
            return Err(duplicate(
                EntityType::TrackedTag,
                constraints::TAG_EPC,
                tag.epc.clone(),
            ));
        }
        if let Some(client_request_id) = &tag.client_request_id {
            if tags
                .values()
                .any(|t| t.client_request_id.as_ref() == Some(client_request_id))
            {
                return Err(duplicate(
                    EntityType::TrackedTag,
                    constraints::TAG_CLIENT_REQUEST,
                    client_request_id.clone(),
                ));
            }
        }
        tags.insert(tag.epc.clone(), tag.clone());
        Ok(())
    }

    async fn tag_get(&self, epc: &str) -> RfidResult<Option<TrackedTag>> {
        Ok(read(&self.tags)?.get(epc).cloned())
    }

    async fn tag_find_by_client_request(
        &self,
        client_request_id: &str,
    ) -> RfidResult<Option<TrackedTag>> {
        Ok(read(&self.tags)?
            .values()
            .find(|t| t.client_request_id.as_deref() == Some(client_request_id))
            .cloned())
    }

    async fn tag_get_many(&self, epcs: &[String]) -> RfidResult<Vec<TrackedTag>> {
        let tags = read(&self.tags)?;
        Ok(epcs.iter().filter_map(|epc| tags.get(epc).cloned()).collect())
    }

    async fn tag_update(&self, epc: &str, update: TagUpdate, now: Timestamp) -> RfidResult<()> {
        let mut tags = write(&self.tags)?;
        let tag = tags
            .get_mut(epc)
            .ok_or_else(|| not_found(EntityType::TrackedTag, epc))?;
        update.apply_to(tag, now);
        Ok(())
    }

    async fn tag_claim_for_processing(
        &self,
        epc: &str,
        now: Timestamp,
        reclaim_ttl_secs: u64,
    ) -> RfidResult<bool> {
        let mut tags = write(&self.tags)?;
        let Some(tag) = tags.get_mut(epc) else {
            return Ok(false);
        };
        let reclaimable = reclaim_ttl_secs > 0
            && tag.status == TagStatus::Processing
            && tag.modified_at < now - ChronoDuration::seconds(reclaim_ttl_secs as i64);
        if tag.status.is_claim_blocking() && !reclaimable {
            return Ok(false);
        }
        tag.status = TagStatus::Processing;
        tag.modified_at = now;
        Ok(true)
    }

    async fn tag_list_recent(&self, limit: usize) -> RfidResult<Vec<TrackedTag>> {
        let mut tags: Vec<TrackedTag> = read(&self.tags)?.values().cloned().collect();
        tags.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
        tags.truncate(limit);
        Ok(tags)
    }

    async fn tag_list_by_status(
        &self,
        statuses: &[TagStatus],
        limit: usize,
    ) -> RfidResult<Vec<TrackedTag>> {
        let wanted: HashSet<TagStatus> = statuses.iter().copied().collect();
        let mut tags: Vec<TrackedTag> = read(&self.tags)?
            .values()
            .filter(|t| wanted.contains(&t.status))
            .cloned()
            .collect();
        tags.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
        tags.truncate(limit);
        Ok(tags)
    }

    async fn agent_request_insert(&self, request: &AgentRequest) -> RfidResult<()> {
        let mut requests = write(&self.agent_requests)?;
        if requests.contains_key(&request.request_id) {
            return Err(duplicate(
                EntityType::AgentRequest,
                constraints::AGENT_REQUEST_ID,
                request.request_id.clone(),
            ));
        }
        requests.insert(request.request_id.clone(), request.clone());
        Ok(())
    }

    async fn agent_request_get(&self, request_id: &str) -> RfidResult<Option<AgentRequest>> {
        Ok(read(&self.agent_requests)?.get(request_id).cloned())
    }

    async fn agent_request_list_pollable(
        &self,
        agent_id: &str,
        now: Timestamp,
        limit: usize,
    ) -> RfidResult<Vec<AgentRequest>> {
        let mut candidates: Vec<AgentRequest> = read(&self.agent_requests)?
            .values()
            .filter(|r| r.agent_id == agent_id && r.is_pollable(now))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.request_ts
                .cmp(&b.request_ts)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn agent_request_lease(
        &self,
        request_id: &str,
        now: Timestamp,
        lease_until: Timestamp,
    ) -> RfidResult<bool> {
        let mut requests = write(&self.agent_requests)?;
        match requests.get_mut(request_id) {
            Some(request) if request.is_pollable(now) => {
                request.status = AgentRequestStatus::Sent;
                request.sent_at = Some(now);
                request.lease_expires_at = Some(lease_until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn agent_request_complete(
        &self,
        request_id: &str,
        completion: &AgentCompletion,
    ) -> RfidResult<bool> {
        let mut requests = write(&self.agent_requests)?;
        let request = requests
            .get_mut(request_id)
            .ok_or_else(|| not_found(EntityType::AgentRequest, request_id))?;
        if request.status.is_terminal() {
            return Ok(false);
        }
        request.status = completion.status;
        request.result = completion.result.clone();
        request.error = completion.error.clone();
        request.lease_expires_at = None;
        request.replied_at = Some(completion.replied_at);
        Ok(true)
    }

    async fn saved_tags_upsert(
        &self,
        deltas: &[SavedTagDelta],
        device: &str,
        now: Timestamp,
    ) -> RfidResult<usize> {
        let mut saved = write(&self.saved)?;
        let day = now.date_naive();
        let mut touched = 0;
        for delta in deltas.iter().filter(|d| !d.epc.is_empty()) {
            let fresh = SavedTag {
                epc: delta.epc.clone(),
                reads: 0,
                last_seen: now,
                device: device.to_string(),
            };
            add_reads(
                saved
                    .overall
                    .entry(delta.epc.clone())
                    .or_insert_with(|| fresh.clone()),
                delta.reads,
                device,
                now,
            );
            add_reads(
                saved
                    .by_day
                    .entry((delta.epc.clone(), day))
                    .or_insert(fresh),
                delta.reads,
                device,
                now,
            );
            touched += 1;
        }
        Ok(touched)
    }

    async fn saved_tags_list(
        &self,
        day: Option<NaiveDate>,
        order: SavedTagOrder,
        limit: usize,
    ) -> RfidResult<Vec<SavedTag>> {
        let saved = read(&self.saved)?;
        let mut rows: Vec<SavedTag> = match day {
            Some(day) => saved
                .by_day
                .iter()
                .filter(|((_, d), _)| *d == day)
                .map(|(_, row)| row.clone())
                .collect(),
            None => saved.overall.values().cloned().collect(),
        };
        match order {
            SavedTagOrder::Last => rows.sort_by(|a, b| b.last_seen.cmp(&a.last_seen)),
            SavedTagOrder::Reads => rows.sort_by(|a, b| b.reads.cmp(&a.reads)),
            SavedTagOrder::Epc => rows.sort_by(|a, b| a.epc.cmp(&b.epc)),
        }
        rows.truncate(limit);
        Ok(rows)
    }

    async fn saved_tags_clear(&self, day: Option<NaiveDate>) -> RfidResult<()> {
        let mut saved = write(&self.saved)?;
        match day {
            Some(day) => saved.by_day.retain(|(_, d), _| *d != day),
            None => {
                saved.overall.clear();
                saved.by_day.clear();
            }
        }
        Ok(())
    }

    async fn tag_note_upsert(&self, note: &TagNote) -> RfidResult<TagNote> {
        let mut notes = write(&self.notes)?;
        let mut row = note.clone();
        if row.device.is_empty() {
            if let Some(existing) = notes.get(&note.epc) {
                row.device = existing.device.clone();
            }
        }
        notes.insert(row.epc.clone(), row.clone());
        Ok(row)
    }

    async fn tag_note_delete(&self, epc: &str) -> RfidResult<bool> {
        Ok(write(&self.notes)?.remove(epc).is_some())
    }

    async fn tag_notes_list(&self, epcs: &[String], limit: usize) -> RfidResult<Vec<TagNote>> {
        let notes = read(&self.notes)?;
        let wanted: HashSet<&str> = epcs.iter().map(String::as_str).collect();
        Ok(notes
            .values()
            .filter(|n| wanted.is_empty() || wanted.contains(n.epc.as_str()))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> RfidResult<()> {
        read(&self.tags).map(|_| ())
    }
}

// ============================================================================
// ITEM CATALOG
// ============================================================================

/// Builder-style in-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    items: Arc<RwLock<HashMap<String, Item>>>,
    conversions: Arc<RwLock<HashMap<(String, String), f64>>>,
    stock_settings: Arc<RwLock<HashMap<String, StockIssueSettings>>>,
    delivery_settings: Arc<RwLock<HashMap<String, DeliverySettings>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_item(&self, item: Item) {
        if let Ok(mut items) = self.items.write() {
            items.insert(item.item_code.clone(), item);
        }
    }

    pub fn add_conversion(&self, item_code: &str, uom: &str, factor: f64) {
        if let Ok(mut conversions) = self.conversions.write() {
            conversions.insert((item_code.to_string(), uom.to_string()), factor);
        }
    }

    pub fn add_stock_settings(&self, settings: StockIssueSettings) {
        if let Ok(mut all) = self.stock_settings.write() {
            all.insert(settings.item_code.clone(), settings);
        }
    }

    pub fn add_delivery_settings(&self, settings: DeliverySettings) {
        if let Ok(mut all) = self.delivery_settings.write() {
            all.insert(settings.item_code.clone(), settings);
        }
    }
}

#[async_trait]
impl ItemCatalog for InMemoryCatalog {
    async fn item(&self, item_code: &str) -> RfidResult<Option<Item>> {
        Ok(read(&self.items)?.get(item_code).cloned())
    }

    async fn conversion_factor(&self, item_code: &str, uom: &str) -> RfidResult<Option<f64>> {
        Ok(read(&self.conversions)?
            .get(&(item_code.to_string(), uom.to_string()))
            .copied())
    }

    async fn stock_issue_settings(
        &self,
        item_code: &str,
    ) -> RfidResult<Option<StockIssueSettings>> {
        Ok(read(&self.stock_settings)?.get(item_code).cloned())
    }

    async fn delivery_settings(&self, item_code: &str) -> RfidResult<Option<DeliverySettings>> {
        Ok(read(&self.delivery_settings)?.get(item_code).cloned())
    }

    async fn delivery_settings_list(&self, limit: usize) -> RfidResult<Vec<DeliverySettings>> {
        let mut rows: Vec<DeliverySettings> =
            read(&self.delivery_settings)?.values().cloned().collect();
        rows.sort_by(|a, b| a.item_code.cmp(&b.item_code));
        rows.truncate(limit);
        Ok(rows)
    }
}

// ============================================================================
// DOCUMENT LEDGER
// ============================================================================

#[derive(Debug, Default)]
struct LedgerTables {
    documents: HashMap<(DocumentKind, String), BusinessDocument>,
    counters: HashMap<String, u64>,
    rejected_items: HashSet<String>,
}

/// In-memory document ledger. Names are `{series}{counter:05}`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    tables: Arc<RwLock<LedgerTables>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make submissions of documents containing `item_code` fail, the way a
    /// real ledger rejects documents that fail validation.
    pub fn reject_submissions_for(&self, item_code: &str) {
        if let Ok(mut tables) = self.tables.write() {
            tables.rejected_items.insert(item_code.to_string());
        }
    }

    pub fn accept_submissions_for(&self, item_code: &str) {
        if let Ok(mut tables) = self.tables.write() {
            tables.rejected_items.remove(item_code);
        }
    }

    pub fn cancel(&self, kind: DocumentKind, name: &str) -> bool {
        match self.tables.write() {
            Ok(mut tables) => match tables.documents.get_mut(&(kind, name.to_string())) {
                Some(doc) => {
                    doc.status = DocStatus::Cancelled;
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn documents(&self, kind: DocumentKind) -> Vec<BusinessDocument> {
        let mut docs: Vec<BusinessDocument> = self
            .tables
            .read()
            .map(|t| {
                t.documents
                    .values()
                    .filter(|d| d.body.kind == kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        docs.sort_by(|a, b| a.name.cmp(&b.name));
        docs
    }
}

#[async_trait]
impl DocumentLedger for InMemoryLedger {
    async fn insert_draft(&self, draft: DocumentDraft) -> RfidResult<BusinessDocument> {
        let mut tables = write(&self.tables)?;
        let series = draft
            .naming_series
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| draft.kind.default_naming_series().to_string());
        let counter = tables.counters.entry(series.clone()).or_insert(0);
        *counter += 1;
        let name = format!("{}{:05}", series, counter);
        let doc = BusinessDocument {
            name: name.clone(),
            status: DocStatus::Draft,
            body: draft,
        };
        tables
            .documents
            .insert((doc.body.kind, name), doc.clone());
        Ok(doc)
    }

    async fn get(&self, kind: DocumentKind, name: &str) -> RfidResult<Option<BusinessDocument>> {
        Ok(read(&self.tables)?
            .documents
            .get(&(kind, name.to_string()))
            .cloned())
    }

    async fn submit(
        &self,
        kind: DocumentKind,
        name: &str,
        remark: &str,
        posting_at: Timestamp,
    ) -> RfidResult<BusinessDocument> {
        let mut tables = write(&self.tables)?;
        let rejected = tables.rejected_items.clone();
        let doc = tables
            .documents
            .get_mut(&(kind, name.to_string()))
            .ok_or_else(|| FulfillmentError::DocumentMissing {
                name: name.to_string(),
            })?;
        match doc.status {
            DocStatus::Cancelled => Err(FulfillmentError::DocumentCancelled {
                name: name.to_string(),
            }
            .into()),
            DocStatus::Submitted => Ok(doc.clone()),
            DocStatus::Draft => {
                if let Some(line) = doc
                    .body
                    .lines
                    .iter()
                    .find(|l| rejected.contains(&l.item_code))
                {
                    return Err(RfidError::Storage(StorageError::UpdateFailed {
                        entity_type: EntityType::Document,
                        key: name.to_string(),
                        reason: format!("submission rejected for item {}", line.item_code),
                    }));
                }
                doc.body.posting_at = posting_at;
                doc.body.remarks = append_remark(&doc.body.remarks, remark);
                doc.status = DocStatus::Submitted;
                Ok(doc.clone())
            }
        }
    }
}
