//! Enum types for RFIDGATE entities
//!
//! Every persisted status has a stable database spelling (`as_db_str`) that is
//! independent of its serde name, so the wire format and the storage format
//! can evolve separately.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error when parsing an unknown enum string from storage or input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumParseError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for EnumParseError {}

macro_rules! db_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $db:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Convert to database string representation.
            pub fn as_db_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $db ),+
                }
            }

            /// Parse from database string representation (case-insensitive,
            /// also accepts the variant name).
            pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
                let needle = s.trim();
                $(
                    if needle.eq_ignore_ascii_case($db)
                        || needle.eq_ignore_ascii_case(stringify!($variant))
                    {
                        return Ok($name::$variant);
                    }
                )+
                Err(EnumParseError {
                    kind: $kind,
                    value: s.to_string(),
                })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_db_str())
            }
        }

        impl FromStr for $name {
            type Err = EnumParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_db_str(s)
            }
        }
    };
}

// ============================================================================
// ENTITY DISCRIMINATOR
// ============================================================================

db_enum! {
    /// Entity type discriminator used in storage errors.
    EntityType, "entity type" {
        EdgeEvent => "edge_event",
        BatchState => "batch_state",
        IdempotencyClaim => "idempotency_claim",
        AntennaRule => "antenna_rule",
        TrackedTag => "tracked_tag",
        AgentRequest => "agent_request",
        SavedTag => "saved_tag",
        TagNote => "tag_note",
        Document => "document",
        Item => "item",
    }
}

// ============================================================================
// STATUS ENUMS
// ============================================================================

db_enum! {
    /// Production status of a device.
    BatchStatus, "batch status" {
        Running => "Running",
        Paused => "Paused",
        Stopped => "Stopped",
    }
}

impl Default for BatchStatus {
    fn default() -> Self {
        BatchStatus::Stopped
    }
}

db_enum! {
    /// Status of an idempotency claim.
    ClaimStatus, "claim status" {
        Claimed => "CLAIMED",
        Done => "DONE",
        Failed => "FAILED",
    }
}

db_enum! {
    /// Lifecycle of a printed RFID tag.
    TagStatus, "tag status" {
        PendingPrint => "Pending Print",
        Printed => "Printed",
        Processing => "Processing",
        Consumed => "Consumed",
        Error => "Error",
    }
}

impl TagStatus {
    /// Statuses that block a new processing claim regardless of age.
    pub fn is_claim_blocking(&self) -> bool {
        matches!(self, TagStatus::Consumed | TagStatus::Processing)
    }
}

db_enum! {
    /// Status of a queued agent command.
    AgentRequestStatus, "agent request status" {
        Queued => "QUEUED",
        Sent => "SENT",
        Done => "DONE",
        Failed => "FAILED",
    }
}

impl AgentRequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentRequestStatus::Done | AgentRequestStatus::Failed)
    }
}

db_enum! {
    /// Kind of downstream business document produced by fulfillment.
    DocumentKind, "document kind" {
        StockIssue => "Stock Entry",
        DeliveryNote => "Delivery Note",
    }
}

impl DocumentKind {
    /// Prefix used for idempotency claim keys of this document kind.
    pub fn claim_kind(&self) -> &'static str {
        match self {
            DocumentKind::StockIssue => "stock_entry",
            DocumentKind::DeliveryNote => "delivery_note",
        }
    }

    /// Naming series used when the settings leave it blank.
    pub fn default_naming_series(&self) -> &'static str {
        match self {
            DocumentKind::StockIssue => "MAT-STE-",
            DocumentKind::DeliveryNote => "MAT-DN-",
        }
    }
}

db_enum! {
    /// Document lifecycle. Stored as 0/1/2 in relational backends.
    DocStatus, "document status" {
        Draft => "Draft",
        Submitted => "Submitted",
        Cancelled => "Cancelled",
    }
}

impl DocStatus {
    pub fn as_i16(&self) -> i16 {
        match self {
            DocStatus::Draft => 0,
            DocStatus::Submitted => 1,
            DocStatus::Cancelled => 2,
        }
    }

    pub fn from_i16(v: i16) -> Result<Self, EnumParseError> {
        match v {
            0 => Ok(DocStatus::Draft),
            1 => Ok(DocStatus::Submitted),
            2 => Ok(DocStatus::Cancelled),
            other => Err(EnumParseError {
                kind: "document status",
                value: other.to_string(),
            }),
        }
    }
}

db_enum! {
    /// Fulfillment action an antenna rule can enable.
    RuleAction, "rule action" {
        SubmitStock => "submit_stock",
        CreateDeliveryNote => "create_delivery_note",
        SubmitDeliveryNote => "submit_delivery_note",
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_round_trip_accepts_variant_name() {
        assert_eq!(TagStatus::from_db_str("Pending Print"), Ok(TagStatus::PendingPrint));
        assert_eq!(TagStatus::from_db_str("pendingprint"), Ok(TagStatus::PendingPrint));
        assert_eq!(ClaimStatus::from_db_str("done"), Ok(ClaimStatus::Done));
        assert!(BatchStatus::from_db_str("Sleeping").is_err());
    }

    #[test]
    fn test_doc_status_numeric() {
        for status in [DocStatus::Draft, DocStatus::Submitted, DocStatus::Cancelled] {
            assert_eq!(DocStatus::from_i16(status.as_i16()), Ok(status));
        }
        assert!(DocStatus::from_i16(7).is_err());
    }

    #[test]
    fn test_terminal_agent_statuses() {
        assert!(AgentRequestStatus::Done.is_terminal());
        assert!(AgentRequestStatus::Failed.is_terminal());
        assert!(!AgentRequestStatus::Sent.is_terminal());
    }

    #[test]
    fn test_claim_kind_prefix() {
        assert_eq!(DocumentKind::StockIssue.claim_kind(), "stock_entry");
        assert_eq!(DocumentKind::DeliveryNote.claim_kind(), "delivery_note");
    }
}
