//! Service Layer
//!
//! Orchestration that spans several crates: tag and scale ingestion, the
//! live reading caches, saved-tag queries and tag notes. Route handlers stay thin and
//! call into these.

mod ingest;
mod live;
mod saved_tags;
mod tag_notes;

pub use ingest::*;
pub use live::*;
pub use saved_tags::*;
pub use tag_notes::*;

use crate::telemetry::with_metrics;
use rfidgate_core::RfidError;

/// Count an edge event by outcome: `accepted`, `duplicate` or the conflict
/// code. Validation and storage failures are not counted.
pub(crate) fn record_edge_outcome(op: &str, outcome: Result<bool, &RfidError>) {
    let label = match outcome {
        Ok(false) => "accepted",
        Ok(true) => "duplicate",
        Err(RfidError::Conflict(conflict)) => conflict.code.as_str(),
        Err(_) => return,
    };
    with_metrics(|m| m.record_edge_event(op, label));
}
