//! Error types for RFIDGATE operations

use crate::EntityType;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity_type:?} with key {key}")]
    NotFound { entity_type: EntityType, key: String },

    /// A uniqueness constraint rejected the insert. `constraint` names the
    /// violated key so callers can tell a primary-key hit from a secondary one.
    #[error("Duplicate key for {entity_type:?} on {constraint}: {key}")]
    DuplicateKey {
        entity_type: EntityType,
        constraint: String,
        key: String,
    },

    #[error("Insert failed for {entity_type:?}: {reason}")]
    InsertFailed {
        entity_type: EntityType,
        reason: String,
    },

    #[error("Update failed for {entity_type:?} with key {key}: {reason}")]
    UpdateFailed {
        entity_type: EntityType,
        key: String,
        reason: String,
    },

    #[error("Storage backend error: {reason}")]
    Backend { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StorageError::DuplicateKey { .. })
    }
}

/// Validation errors. Always raised before any state is mutated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Unknown item: {item_code}")]
    UnknownItem { item_code: String },
}

impl ValidationError {
    pub fn missing(field: impl Into<String>) -> Self {
        ValidationError::RequiredFieldMissing {
            field: field.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Machine-readable code attached to every sequencing conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictCode {
    SeqRegression,
    SeqConflict,
    BatchMismatch,
    ProductMismatch,
}

impl ConflictCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictCode::SeqRegression => "SEQ_REGRESSION",
            ConflictCode::SeqConflict => "SEQ_CONFLICT",
            ConflictCode::BatchMismatch => "BATCH_MISMATCH",
            ConflictCode::ProductMismatch => "PRODUCT_MISMATCH",
        }
    }
}

impl fmt::Display for ConflictCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sequencing conflict. Agents resolve these by resynchronizing; the
/// server never retries them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ConflictError {
    pub code: ConflictCode,
    pub message: String,
}

impl ConflictError {
    pub fn new(code: ConflictCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration: {field}")]
    MissingRequired { field: String },

    #[error("Invalid configuration value for {field}: {value} ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Errors raised while building or submitting downstream documents.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FulfillmentError {
    #[error("Tag metadata is incomplete for {epc}")]
    InvalidTagMeta { epc: String },

    #[error("No {kind} settings for item {item_code}")]
    MissingSettings { kind: String, item_code: String },

    #[error("Item {item_code} has no stock unit")]
    MissingStockUom { item_code: String },

    #[error("Conversion factor not found: {item_code} ({uom} -> {stock_uom})")]
    MissingConversionFactor {
        item_code: String,
        uom: String,
        stock_uom: String,
    },

    #[error("Document {name} is cancelled")]
    DocumentCancelled { name: String },

    #[error("Document {name} does not exist")]
    DocumentMissing { name: String },

    #[error("Claim {key} is held by another attempt")]
    ClaimInProgress { key: String },

    #[error("Claim {key} previously failed: {reason}")]
    ClaimFailed { key: String, reason: String },
}

/// Master error type for all RFIDGATE operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RfidError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Conflict: {0}")]
    Conflict(#[from] ConflictError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fulfillment error: {0}")]
    Fulfillment(#[from] FulfillmentError),
}

/// Result type alias for RFIDGATE operations.
pub type RfidResult<T> = Result<T, RfidError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_duplicate() {
        let err = StorageError::DuplicateKey {
            entity_type: EntityType::EdgeEvent,
            constraint: "event_id".to_string(),
            key: "e1".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Duplicate key"));
        assert!(msg.contains("EdgeEvent"));
        assert!(msg.contains("e1"));
        assert!(err.is_duplicate());
    }

    #[test]
    fn test_conflict_code_wire_names() {
        assert_eq!(ConflictCode::SeqRegression.as_str(), "SEQ_REGRESSION");
        assert_eq!(
            serde_json::to_string(&ConflictCode::ProductMismatch).unwrap(),
            "\"PRODUCT_MISMATCH\""
        );
    }

    #[test]
    fn test_conflict_error_display() {
        let err = ConflictError::new(ConflictCode::BatchMismatch, "batch b2 is not current");
        assert_eq!(format!("{}", err), "BATCH_MISMATCH: batch b2 is not current");
    }

    #[test]
    fn test_rfid_error_from_variants() {
        let storage = RfidError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, RfidError::Storage(_)));

        let validation = RfidError::from(ValidationError::missing("event_id"));
        assert!(matches!(validation, RfidError::Validation(_)));

        let conflict = RfidError::from(ConflictError::new(ConflictCode::SeqConflict, "taken"));
        assert!(matches!(conflict, RfidError::Conflict(_)));

        let fulfillment = RfidError::from(FulfillmentError::DocumentMissing {
            name: "MAT-1".to_string(),
        });
        assert!(matches!(fulfillment, RfidError::Fulfillment(_)));
    }
}
