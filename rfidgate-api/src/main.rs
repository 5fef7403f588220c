//! RFIDGATE API Server Entry Point
//!
//! Bootstraps configuration, picks the store backend and starts the Axum
//! HTTP server.

use std::net::SocketAddr;

use axum::Router;
use rfidgate_api::telemetry::{init_tracer, TelemetryConfig};
use rfidgate_api::{
    create_api_router, ApiConfig, ApiError, ApiResult, AppState, Backends, DbConfig, PgStore,
    Seams, StoreBackend,
};
use rfidgate_core::{RfidConfig, RfidError};

#[tokio::main]
async fn main() -> ApiResult<()> {
    let telemetry_config = TelemetryConfig::default();
    init_tracer(&telemetry_config)?;

    let api_config = ApiConfig::from_env();
    let rfid_config = RfidConfig::from_env();
    rfid_config.validate().map_err(RfidError::from)?;

    let backends = match api_config.store {
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; state is lost on restart");
            Backends::in_memory()
        }
        StoreBackend::Postgres => {
            let store = PgStore::from_config(&DbConfig::from_env())?;
            store.ensure_schema().await?;
            tracing::info!(pool_size = store.pool_size(), "Connected to PostgreSQL");
            Backends::postgres(store)
        }
    };

    let state = AppState::new(backends, Seams::default(), &api_config, rfid_config);
    let app: Router = create_api_router(state, &api_config);

    let addr = api_config.bind_addr();
    tracing::info!(
        %addr,
        service = %telemetry_config.service_name,
        version = %telemetry_config.service_version,
        "Starting RFIDGATE API server"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown signal received");
}
