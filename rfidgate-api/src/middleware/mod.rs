//! Middleware modules for RFIDGATE API
//!
//! - `ingest_auth`: shared-token or loopback guard for agent-facing routes
//!
//! Request tracing and metrics live in `telemetry::middleware`.

mod ingest_auth;

pub use ingest_auth::{ingest_auth_middleware, IngestAuthState, INGEST_TOKEN_HEADER};
