//! RFIDGATE Events - Edge Event Log and Batch State
//!
//! Turns the agent's event stream into an ordered, exactly-once record:
//!
//! - [`EdgeEventLog`] appends events keyed by `event_id` and enforces
//!   per-(device, batch) seq monotonicity against the device's [`BatchState`].
//! - [`BatchOp`] describes how an accepted event moves the batch state
//!   machine (`Stopped -> Running -> Paused -> Running -> Stopped`).
//! - [`BatchService`] validates the five edge endpoints and routes them
//!   through the log.
//! - [`aggregate_reads`] folds raw tag reads into one row per (EPC, antenna).
//!
//! Conflicts (`SEQ_REGRESSION`, `SEQ_CONFLICT`, `BATCH_MISMATCH`,
//! `PRODUCT_MISMATCH`) come back as `RfidError::Conflict`; duplicates come
//! back as [`IngestOutcome::Duplicate`] and never as errors.
//!
//! [`BatchState`]: rfidgate_core::BatchState

mod batch;
mod log;
mod reads;
mod transition;

pub use batch::{BatchService, EdgeAck, EdgeRequest};
pub use log::{EdgeEventInput, EdgeEventLog, IngestOutcome, MAX_STATE_ATTEMPTS};
pub use reads::{aggregate_reads, AggregatedRead, ReadBatch};
pub use transition::BatchOp;
