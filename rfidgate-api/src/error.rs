//! Error Types for RFIDGATE API
//!
//! This module defines error handling for the HTTP layer, including:
//! - ApiError struct for structured error responses
//! - ErrorCode enum for categorizing errors
//! - IntoResponse implementation for Axum HTTP responses
//! - The mapping from domain errors (`RfidError`) to status codes
//!
//! Every error body has the shape `{ok: false, error, code}` so edge agents
//! can branch on `code` without parsing messages.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rfidgate_core::{ConflictCode, FulfillmentError, RfidError, StorageError, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
///
/// Each error code maps to a specific HTTP status code and represents
/// a category of error that can occur during API operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Authentication Errors (401, 403)
    // ========================================================================
    /// Ingest token missing or wrong
    Unauthorized,

    /// Caller is not allowed on this route
    Forbidden,

    // ========================================================================
    // Validation Errors (400)
    // ========================================================================
    /// Request validation failed
    ValidationFailed,

    /// Request contains invalid input data
    InvalidInput,

    /// Required field is missing from request
    MissingField,

    /// Referenced item is not in the catalog
    UnknownItem,

    // ========================================================================
    // Not Found Errors (404)
    // ========================================================================
    /// Requested entity does not exist
    EntityNotFound,

    // ========================================================================
    // Conflict Errors (409)
    // ========================================================================
    /// Seq did not advance past the last accepted seq
    SeqRegression,

    /// Another event already holds this (device, batch, seq) position
    SeqConflict,

    /// Event names a batch other than the device's current batch
    BatchMismatch,

    /// Event names a product other than the device's current product
    ProductMismatch,

    /// Entity with the same identifier already exists
    EntityAlreadyExists,

    /// Operation conflicts with current state
    StateConflict,

    // ========================================================================
    // Server Errors (500, 503, 504)
    // ========================================================================
    /// Internal server error
    InternalError,

    /// Database operation failed
    DatabaseError,

    /// Service is temporarily unavailable
    ServiceUnavailable,

    /// Database connection pool exhausted
    ConnectionPoolExhausted,

    /// Operation timed out
    Timeout,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,

            ErrorCode::ValidationFailed
            | ErrorCode::InvalidInput
            | ErrorCode::MissingField
            | ErrorCode::UnknownItem => StatusCode::BAD_REQUEST,

            ErrorCode::EntityNotFound => StatusCode::NOT_FOUND,

            ErrorCode::SeqRegression
            | ErrorCode::SeqConflict
            | ErrorCode::BatchMismatch
            | ErrorCode::ProductMismatch
            | ErrorCode::EntityAlreadyExists
            | ErrorCode::StateConflict => StatusCode::CONFLICT,

            ErrorCode::ServiceUnavailable | ErrorCode::ConnectionPoolExhausted => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,

            ErrorCode::InternalError | ErrorCode::DatabaseError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "Ingest token required",
            ErrorCode::Forbidden => "Access forbidden",
            ErrorCode::ValidationFailed => "Request validation failed",
            ErrorCode::InvalidInput => "Invalid input data",
            ErrorCode::MissingField => "Required field is missing",
            ErrorCode::UnknownItem => "Unknown item",
            ErrorCode::EntityNotFound => "Entity not found",
            ErrorCode::SeqRegression => "Seq did not advance",
            ErrorCode::SeqConflict => "Seq position already taken",
            ErrorCode::BatchMismatch => "Batch does not match the current batch",
            ErrorCode::ProductMismatch => "Product does not match the current product",
            ErrorCode::EntityAlreadyExists => "Entity already exists",
            ErrorCode::StateConflict => "Operation conflicts with current state",
            ErrorCode::InternalError => "Internal server error",
            ErrorCode::DatabaseError => "Database operation failed",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
            ErrorCode::ConnectionPoolExhausted => "Connection pool exhausted",
            ErrorCode::Timeout => "Operation timed out",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<ConflictCode> for ErrorCode {
    fn from(code: ConflictCode) -> Self {
        match code {
            ConflictCode::SeqRegression => ErrorCode::SeqRegression,
            ConflictCode::SeqConflict => ErrorCode::SeqConflict,
            ConflictCode::BatchMismatch => ErrorCode::BatchMismatch,
            ConflictCode::ProductMismatch => ErrorCode::ProductMismatch,
        }
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error returned by all API endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ApiError {
    /// Always false; mirrors the `ok` flag of success bodies
    pub ok: bool,

    /// Error code categorizing the error
    pub code: ErrorCode,

    /// Human-readable error message
    #[serde(rename = "error")]
    pub message: String,

    /// Optional additional details (offending field, constraint name)
    #[serde(skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Create a new API error with the given code, using the default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    /// Add additional details to the error.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    // ========================================================================
    // Convenience constructors for common errors
    // ========================================================================

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingField,
            format!("Required field '{}' is missing", field),
        )
        .with_details(serde_json::json!({ "field": field }))
    }

    pub fn entity_not_found(entity_type: &str, id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::EntityNotFound,
            format!("{} {} not found", entity_type, id),
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::EntityNotFound, message)
    }

    pub fn state_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StateConflict, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn database_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(self)).into_response()
    }
}

// ============================================================================
// CONVERSIONS FROM DOMAIN ERRORS
// ============================================================================

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        match &err {
            ValidationError::RequiredFieldMissing { field } => ApiError::missing_field(field),
            ValidationError::InvalidValue { field, .. } => {
                ApiError::new(ErrorCode::InvalidInput, err.to_string())
                    .with_details(serde_json::json!({ "field": field }))
            }
            ValidationError::UnknownItem { item_code } => {
                ApiError::new(ErrorCode::UnknownItem, err.to_string())
                    .with_details(serde_json::json!({ "item_code": item_code }))
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match &err {
            StorageError::NotFound { entity_type, key } => {
                ApiError::entity_not_found(entity_type.as_db_str(), key)
            }
            StorageError::DuplicateKey { constraint, .. } => {
                ApiError::new(ErrorCode::EntityAlreadyExists, err.to_string())
                    .with_details(serde_json::json!({ "constraint": constraint }))
            }
            StorageError::InsertFailed { .. }
            | StorageError::UpdateFailed { .. }
            | StorageError::Backend { .. }
            | StorageError::LockPoisoned => {
                // Full detail goes to the log only
                tracing::error!(error = %err, "Storage error");
                ApiError::database_error("Database operation failed")
            }
        }
    }
}

impl From<FulfillmentError> for ApiError {
    fn from(err: FulfillmentError) -> Self {
        match err {
            FulfillmentError::InvalidTagMeta { .. }
            | FulfillmentError::MissingSettings { .. }
            | FulfillmentError::MissingStockUom { .. }
            | FulfillmentError::MissingConversionFactor { .. } => {
                ApiError::validation_failed(err.to_string())
            }
            FulfillmentError::DocumentCancelled { .. }
            | FulfillmentError::DocumentMissing { .. }
            | FulfillmentError::ClaimInProgress { .. }
            | FulfillmentError::ClaimFailed { .. } => ApiError::state_conflict(err.to_string()),
        }
    }
}

impl From<RfidError> for ApiError {
    fn from(err: RfidError) -> Self {
        match err {
            RfidError::Conflict(conflict) => {
                ApiError::new(conflict.code.into(), conflict.message)
            }
            RfidError::Validation(e) => e.into(),
            RfidError::Storage(e) => e.into(),
            RfidError::Fulfillment(e) => e.into(),
            RfidError::Config(e) => {
                tracing::error!(error = %e, "Configuration error");
                ApiError::internal_error(e.to_string())
            }
        }
    }
}

/// Convert from deadpool_postgres::PoolError to ApiError.
impl From<deadpool_postgres::PoolError> for ApiError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        tracing::error!("Connection pool error: {:?}", err);

        match err {
            deadpool_postgres::PoolError::Timeout(_) => {
                ApiError::from_code(ErrorCode::ConnectionPoolExhausted)
            }
            deadpool_postgres::PoolError::Closed => {
                ApiError::service_unavailable("Database connection pool is closed")
            }
            _ => ApiError::database_error("Failed to acquire database connection"),
        }
    }
}

/// Convert from tokio_postgres::Error to ApiError.
impl From<tokio_postgres::Error> for ApiError {
    fn from(err: tokio_postgres::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        ApiError::database_error("Database operation failed")
    }
}

// ============================================================================
// RESULT TYPE ALIAS
// ============================================================================

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rfidgate_core::{ConflictError, EntityType};

    #[test]
    fn test_error_code_status_mapping() {
        assert_eq!(ErrorCode::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::ValidationFailed.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::UnknownItem.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::EntityNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::SeqRegression.status_code(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::ProductMismatch.status_code(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::InternalError.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ErrorCode::ServiceUnavailable.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorCode::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_conflict_renders_machine_code() -> Result<(), serde_json::Error> {
        let err: ApiError = RfidError::Conflict(ConflictError {
            code: ConflictCode::SeqRegression,
            message: "seq 0 <= 1".to_string(),
        })
        .into();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);

        let body = serde_json::to_value(&err)?;
        assert_eq!(body["ok"], false);
        assert_eq!(body["code"], "SEQ_REGRESSION");
        assert_eq!(body["error"], "seq 0 <= 1");
        assert!(body.get("details").is_none());
        Ok(())
    }

    #[test]
    fn test_domain_error_mapping() {
        let err: ApiError = RfidError::Validation(ValidationError::missing("event_id")).into();
        assert_eq!(err.code, ErrorCode::MissingField);
        assert!(err.message.contains("event_id"));

        let err: ApiError = RfidError::Storage(StorageError::NotFound {
            entity_type: EntityType::TrackedTag,
            key: "5A42".to_string(),
        })
        .into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err: ApiError = RfidError::Storage(StorageError::Backend {
            reason: "connection reset".to_string(),
        })
        .into();
        assert_eq!(err.code, ErrorCode::DatabaseError);
        assert!(!err.message.contains("connection reset"));

        let err: ApiError = RfidError::Fulfillment(FulfillmentError::DocumentCancelled {
            name: "MAT-STE-00001".to_string(),
        })
        .into();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_error_round_trips_through_json() -> Result<(), serde_json::Error> {
        let err = ApiError::unauthorized("Invalid token");
        let json = serde_json::to_string(&err)?;
        assert!(json.contains("UNAUTHORIZED"));

        let deserialized: ApiError = serde_json::from_str(&json)?;
        assert_eq!(deserialized, err);
        Ok(())
    }

    #[test]
    fn test_error_display() {
        let err = ApiError::database_error("Connection failed");
        let display = format!("{}", err);
        assert!(display.contains("DatabaseError"));
        assert!(display.contains("Connection failed"));
    }
}
