//! RFIDGATE Fulfillment - Tags to Business Documents
//!
//! Turns sightings of printed RFID tags into stock issues and delivery notes,
//! exactly once per tag:
//!
//! - [`ClaimRegistry`] guards every document creation with an insert-if-absent
//!   idempotency claim, so retries and concurrent ingests reuse one document.
//! - [`RuleTable`] picks the antenna that consumes a tag from the per-device
//!   and `"any"` rule tiers, with a declared-antenna fallback.
//! - [`DocumentService`] builds drafts from the item catalog and submits them
//!   through the document ledger.
//! - [`FulfillmentPipeline`] drives one ingest's sightings through all of the
//!   above and reports per EPC.
//! - [`TagRegistry`] and [`RuleService`] back the tag and rule admin
//!   endpoints.

mod claims;
mod documents;
mod pipeline;
mod registry;
mod router;
mod rules;

pub use claims::{ClaimOutcome, ClaimRegistry, ClaimRequest, ClaimedDocument};
pub use documents::{
    audit_remarks, submit_remark, DocumentService, TagDocumentInput, MAX_CONVERSION_FACTOR,
    STOCK_ISSUE_PURPOSE,
};
pub use pipeline::{
    idempotency_key, EpcOutcome, EpcReport, FulfillmentPipeline, FulfillmentReport,
    FulfillmentRequest,
};
pub use registry::{
    CreateTagRequest, CreatedTag, PrintReport, TagInfo, TagRegistry, MAX_EPC_ATTEMPTS, PRINT_DEVICE,
};
pub use router::{Route, RuleTable, ANY_DEVICE};
pub use rules::{RuleService, UpsertRuleRequest};
