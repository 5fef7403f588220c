//! Append-only edge event log with seq checking.

use crate::transition::BatchOp;
use rfidgate_core::{
    payload_hash, BatchState, Clock, ConflictCode, ConflictError, EdgeEvent, RfidError,
    RfidResult, StorageError,
};
use rfidgate_storage::{constraints, RecordStore};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attempts at the optimistic batch state update before giving up with
/// `SEQ_CONFLICT`.
pub const MAX_STATE_ATTEMPTS: usize = 3;

/// Normalized event as handed to [`EdgeEventLog::ingest`].
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeEventInput {
    pub event_id: String,
    pub device_id: String,
    pub batch_id: Option<String>,
    pub seq: Option<i64>,
    pub event_type: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// The event was inserted and the batch state advanced.
    Accepted { event: EdgeEvent, state: BatchState },
    /// `event_id` was already logged. Nothing changed.
    Duplicate { event_id: String },
}

impl IngestOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, IngestOutcome::Duplicate { .. })
    }

    pub fn event_id(&self) -> &str {
        match self {
            IngestOutcome::Accepted { event, .. } => &event.event_id,
            IngestOutcome::Duplicate { event_id } => event_id,
        }
    }
}

/// Edge event log over a [`RecordStore`].
///
/// Each ingest runs the checks in a fixed order: duplicate `event_id`,
/// batch/product agreement, seq regression, position conflict. The event row
/// and the advanced batch state are written together by
/// [`RecordStore::edge_event_append`], so a logged event always has its state
/// applied. The state write is a compare-and-set on the state's version; a
/// lost race writes nothing and re-runs the checks against the fresh state.
#[derive(Clone)]
pub struct EdgeEventLog {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
}

impl EdgeEventLog {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn ingest(&self, input: EdgeEventInput, op: &BatchOp) -> RfidResult<IngestOutcome> {
        for attempt in 1..=MAX_STATE_ATTEMPTS {
            if self.store.edge_event_get(&input.event_id).await?.is_some() {
                debug!(event_id = %input.event_id, device_id = %input.device_id, "Duplicate edge event");
                return Ok(duplicate(&input));
            }

            let now = self.clock.now();
            let event = EdgeEvent {
                event_id: input.event_id.clone(),
                device_id: input.device_id.clone(),
                batch_id: input.batch_id.clone(),
                seq: input.seq,
                event_type: input.event_type.clone(),
                payload_hash: payload_hash(&input.payload),
                payload: input.payload.clone(),
                received_at: now,
            };

            let state = self
                .store
                .batch_state_get(&input.device_id)
                .await?
                .unwrap_or_else(|| BatchState::new(&input.device_id));
            op.guard(&state)?;
            op.check_seq(&state, input.seq)?;

            let expected_version = state.version;
            let mut next = state;
            op.apply(&mut next, input.seq, now);

            match self
                .store
                .edge_event_append(&event, &next, expected_version)
                .await
            {
                Ok(true) => {
                    next.version = expected_version + 1;
                    info!(
                        event_id = %event.event_id,
                        device_id = %event.device_id,
                        batch_id = ?event.batch_id,
                        seq = ?event.seq,
                        op = op.name(),
                        "Edge event accepted"
                    );
                    return Ok(IngestOutcome::Accepted { event, state: next });
                }
                Ok(false) => {
                    warn!(
                        event_id = %input.event_id,
                        device_id = %input.device_id,
                        attempt,
                        "Batch state changed concurrently, retrying"
                    );
                }
                Err(RfidError::Storage(StorageError::DuplicateKey { constraint, .. })) => {
                    if constraint == constraints::EVENT_ID {
                        return Ok(duplicate(&input));
                    }
                    // A batch id reused after a reset.
                    return Err(seq_conflict(format!(
                        "Position {}/{:?}#{:?} already taken",
                        input.device_id, input.batch_id, input.seq
                    )));
                }
                Err(e) => return Err(e),
            }
        }

        Err(seq_conflict(format!(
            "Batch state for {} kept changing; gave up after {} attempts",
            input.device_id, MAX_STATE_ATTEMPTS
        )))
    }

    /// Read-only view of a device's batch state.
    pub async fn batch_state(&self, device_id: &str) -> RfidResult<Option<BatchState>> {
        self.store.batch_state_get(device_id).await
    }
}

fn duplicate(input: &EdgeEventInput) -> IngestOutcome {
    IngestOutcome::Duplicate {
        event_id: input.event_id.clone(),
    }
}

fn seq_conflict(message: String) -> RfidError {
    ConflictError::new(ConflictCode::SeqConflict, message).into()
}
