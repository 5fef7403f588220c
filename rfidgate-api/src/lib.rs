//! RFIDGATE API - REST/WebSocket API Layer
//!
//! HTTP surface of the RFID gate: reader and scale ingestion, edge batch
//! events, the tag print lifecycle, antenna rules and the agent command
//! queue. Realtime events stream to dashboards over a WebSocket.
//!
//! Storage runs in-process or against PostgreSQL (`db::PgStore`).

#[macro_use]
mod macros;

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
#[cfg(feature = "openapi")]
pub mod openapi;
pub mod routes;
pub mod services;
pub mod state;
pub mod telemetry;
pub mod ws;

// Re-export commonly used types
pub use config::{ApiConfig, StoreBackend};
pub use db::{DbConfig, PgStore};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use middleware::{IngestAuthState, INGEST_TOKEN_HEADER};
#[cfg(feature = "openapi")]
pub use openapi::ApiDoc;
pub use routes::create_api_router;
pub use state::{AppState, Backends, Seams};
pub use ws::WsState;
