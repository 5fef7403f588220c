//! RFIDGATE Core - Domain types for the edge ingestion pipeline
//!
//! This crate holds the data model shared by every other crate: persisted
//! entities, status enums, errors, configuration, input normalization and the
//! small seams (clock, tokens, realtime) that components receive as
//! dependencies instead of reaching for globals.

pub mod clock;
pub mod config;
pub mod entities;
pub mod enums;
pub mod error;
pub mod hash;
pub mod normalize;
pub mod realtime;
pub mod token;

pub use clock::{Clock, SystemClock};
pub use config::RfidConfig;
pub use entities::*;
pub use enums::*;
pub use error::{
    ConfigError, ConflictCode, ConflictError, FulfillmentError, RfidError, RfidResult,
    StorageError, ValidationError,
};
pub use hash::{canonical_json, payload_hash};
pub use realtime::{NullPublisher, PublishError, RealtimeEvent, RealtimePublisher};
pub use token::{generate_epc, RandomTokens, TokenSource};

use chrono::{DateTime, Utc};

/// Timestamp type used throughout RFIDGATE.
pub type Timestamp = DateTime<Utc>;
