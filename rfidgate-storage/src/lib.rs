//! RFIDGATE Storage - Record store traits and in-memory implementations
//!
//! Defines the storage abstraction the pipeline runs against. The Postgres
//! implementation lives in rfidgate-api.

pub mod cache;
pub mod catalog;
pub mod memory;
pub mod record_store;

pub use cache::ExpiringMap;
pub use catalog::{append_remark, DocumentLedger, ItemCatalog, MAX_REMARKS_LEN};
pub use memory::{InMemoryCatalog, InMemoryLedger, InMemoryStore};
pub use record_store::{constraints, RecordStore, SavedTagDelta};
