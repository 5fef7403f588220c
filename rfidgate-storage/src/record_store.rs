//! Async record store trait.
//!
//! The store is the only serialization point in the system. Every method that
//! decides a race is a single conditional write: insert-if-absent for unique
//! keys, compare-and-set for state transitions. Implementations must not split
//! these into a read followed by a write.

use ::async_trait::async_trait;
use chrono::NaiveDate;
use rfidgate_core::{
    AgentCompletion, AgentRequest, AntennaRule, BatchState, ClaimStatus, DocumentKind, EdgeEvent,
    IdempotencyClaim, RfidResult, SavedTag, SavedTagOrder, TagNote, TagStatus, TagUpdate,
    Timestamp, TrackedTag,
};

/// Constraint names reported in `StorageError::DuplicateKey`.
pub mod constraints {
    pub const EVENT_ID: &str = "event_id";
    pub const EVENT_POSITION: &str = "device_batch_seq";
    pub const CLAIM_KEY: &str = "claim_key";
    pub const TAG_EPC: &str = "epc";
    pub const TAG_CLIENT_REQUEST: &str = "client_request_id";
    pub const AGENT_REQUEST_ID: &str = "request_id";
}

/// Read count delta for one EPC in one ingest call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedTagDelta {
    pub epc: String,
    pub reads: i64,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    // ========================================================================
    // EDGE EVENTS
    // ========================================================================

    /// Insert `event` and write `state` as one atomic step.
    ///
    /// The state write is a compare-and-set on `expected_version` (0 means "no
    /// row yet"); the stored version becomes `expected_version + 1`. When the
    /// version has moved nothing is written and the result is `Ok(false)`.
    /// Fails with `DuplicateKey` on `event_id`, or on the (device, batch, seq)
    /// position when all three are present, again with nothing written.
    async fn edge_event_append(
        &self,
        event: &EdgeEvent,
        state: &BatchState,
        expected_version: i64,
    ) -> RfidResult<bool>;

    async fn edge_event_get(&self, event_id: &str) -> RfidResult<Option<EdgeEvent>>;

    // ========================================================================
    // BATCH STATE
    // ========================================================================

    async fn batch_state_get(&self, device_id: &str) -> RfidResult<Option<BatchState>>;

    // ========================================================================
    // IDEMPOTENCY CLAIMS
    // ========================================================================

    /// Insert-if-absent on `claim.key`.
    async fn claim_insert(&self, claim: &IdempotencyClaim) -> RfidResult<()>;

    async fn claim_get(&self, key: &str) -> RfidResult<Option<IdempotencyClaim>>;

    /// Re-stamp a Claimed record whose `claimed_at` still equals
    /// `observed_claimed_at`. Clears `last_error`. Returns whether this caller
    /// took the claim over.
    async fn claim_take_over(
        &self,
        key: &str,
        observed_claimed_at: Timestamp,
        now: Timestamp,
    ) -> RfidResult<bool>;

    /// Write the terminal state of a claim.
    async fn claim_finish(
        &self,
        key: &str,
        status: ClaimStatus,
        owner_doc_type: DocumentKind,
        owner_doc_name: Option<&str>,
        error: Option<&str>,
    ) -> RfidResult<()>;

    /// Delete a claim only if it is Failed, so a manual retry can claim the
    /// key again. Returns whether a row was removed.
    async fn claim_release_failed(&self, key: &str) -> RfidResult<bool>;

    // ========================================================================
    // ANTENNA RULES
    // ========================================================================

    /// All rules ordered by (device, antenna_id).
    async fn antenna_rule_list(&self) -> RfidResult<Vec<AntennaRule>>;

    async fn antenna_rule_upsert(&self, rule: &AntennaRule) -> RfidResult<()>;

    async fn antenna_rule_delete(&self, device: &str, antenna_id: u8) -> RfidResult<bool>;

    // ========================================================================
    // TRACKED TAGS
    // ========================================================================

    /// Insert-if-absent on EPC and on `client_request_id`.
    async fn tag_insert(&self, tag: &TrackedTag) -> RfidResult<()>;

    async fn tag_get(&self, epc: &str) -> RfidResult<Option<TrackedTag>>;

    async fn tag_find_by_client_request(
        &self,
        client_request_id: &str,
    ) -> RfidResult<Option<TrackedTag>>;

    async fn tag_get_many(&self, epcs: &[String]) -> RfidResult<Vec<TrackedTag>>;

    /// Apply a partial update and bump `modified_at`. `NotFound` if absent.
    async fn tag_update(&self, epc: &str, update: TagUpdate, now: Timestamp) -> RfidResult<()>;

    /// Atomically move a tag to Processing. Succeeds when the status is not
    /// Consumed or Processing, or when it is Processing and was last modified
    /// more than `reclaim_ttl_secs` ago (0 disables reclaim).
    async fn tag_claim_for_processing(
        &self,
        epc: &str,
        now: Timestamp,
        reclaim_ttl_secs: u64,
    ) -> RfidResult<bool>;

    /// Most recently modified first.
    async fn tag_list_recent(&self, limit: usize) -> RfidResult<Vec<TrackedTag>>;

    /// Most recently modified first.
    async fn tag_list_by_status(
        &self,
        statuses: &[TagStatus],
        limit: usize,
    ) -> RfidResult<Vec<TrackedTag>>;

    // ========================================================================
    // AGENT REQUESTS
    // ========================================================================

    async fn agent_request_insert(&self, request: &AgentRequest) -> RfidResult<()>;

    async fn agent_request_get(&self, request_id: &str) -> RfidResult<Option<AgentRequest>>;

    /// Queued requests, and Sent requests with a lapsed lease, oldest first.
    /// This is a candidate list only; ownership is decided by
    /// [`RecordStore::agent_request_lease`].
    async fn agent_request_list_pollable(
        &self,
        agent_id: &str,
        now: Timestamp,
        limit: usize,
    ) -> RfidResult<Vec<AgentRequest>>;

    /// Move a pollable request to Sent with `lease_expires_at = lease_until`.
    /// Returns whether this caller won the lease.
    async fn agent_request_lease(
        &self,
        request_id: &str,
        now: Timestamp,
        lease_until: Timestamp,
    ) -> RfidResult<bool>;

    /// Finish a non-terminal request and clear its lease. Returns false when
    /// the request was already terminal.
    async fn agent_request_complete(
        &self,
        request_id: &str,
        completion: &AgentCompletion,
    ) -> RfidResult<bool>;

    // ========================================================================
    // SAVED TAGS
    // ========================================================================

    /// Add read counts to the overall and per-day tallies. Returns the number
    /// of EPC rows touched.
    async fn saved_tags_upsert(
        &self,
        deltas: &[SavedTagDelta],
        device: &str,
        now: Timestamp,
    ) -> RfidResult<usize>;

    async fn saved_tags_list(
        &self,
        day: Option<NaiveDate>,
        order: SavedTagOrder,
        limit: usize,
    ) -> RfidResult<Vec<SavedTag>>;

    /// With a day, clear only that day's tallies; otherwise clear everything.
    async fn saved_tags_clear(&self, day: Option<NaiveDate>) -> RfidResult<()>;

    // ========================================================================
    // TAG NOTES
    // ========================================================================

    /// Create or replace the note for `note.epc`. A blank `device` keeps the
    /// stored one. Returns the row as written.
    async fn tag_note_upsert(&self, note: &TagNote) -> RfidResult<TagNote>;

    async fn tag_note_delete(&self, epc: &str) -> RfidResult<bool>;

    /// Notes for `epcs` (all notes when empty), ordered by EPC, at most
    /// `limit`.
    async fn tag_notes_list(&self, epcs: &[String], limit: usize) -> RfidResult<Vec<TagNote>>;

    // ========================================================================
    // HEALTH
    // ========================================================================

    /// Round-trip to the backend.
    async fn ping(&self) -> RfidResult<()>;
}
