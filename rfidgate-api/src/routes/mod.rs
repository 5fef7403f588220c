//! REST API Routes Module
//!
//! Route handlers grouped by concern, and the router that ties them
//! together with the ingest token check, observability, CORS and request
//! timeouts.

pub mod agents;
pub mod edge;
pub mod health;
pub mod ingest;
pub mod rules;
pub mod tags;

use axum::{
    http::{header, header::HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::get,
    Router,
};
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;

use crate::config::ApiConfig;
use crate::middleware::{ingest_auth_middleware, INGEST_TOKEN_HEADER};
use crate::state::AppState;
use crate::telemetry::{metrics_handler, observability_middleware};
use crate::ws::ws_handler;

// ============================================================================
// OPENAPI ENDPOINTS
// ============================================================================

/// Handler for /openapi.json endpoint.
#[cfg(feature = "openapi")]
async fn openapi_json() -> impl axum::response::IntoResponse {
    use utoipa::OpenApi;
    axum::Json(crate::openapi::ApiDoc::openapi())
}

// ============================================================================
// ROUTER
// ============================================================================

/// Routes called by edge agents. These require the ingest token, or a
/// loopback peer when no token is configured.
fn agent_facing_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .nest("/ingest", ingest::create_router())
        .nest("/edge", edge::create_router())
        .merge(agents::create_router())
        .route_layer(from_fn_with_state(
            state.ingest_auth.clone(),
            ingest_auth_middleware,
        ))
}

fn operator_routes() -> Router<AppState> {
    Router::new()
        .merge(ingest::create_readout_router())
        .merge(rules::create_router())
        .merge(agents::create_operator_router())
        .nest("/tags", tags::create_router())
}

/// Create the complete API router.
///
/// - REST routes under /api/v1/*
/// - Health checks at /health/*
/// - Metrics at /metrics
/// - Realtime WebSocket at /ws
/// - OpenAPI spec at /openapi.json (openapi feature)
/// - Swagger UI at /swagger-ui (swagger-ui feature)
///
/// Execution order: CORS -> Observability -> Timeout -> Handler
pub fn create_api_router(state: AppState, config: &ApiConfig) -> Router {
    if !state.ingest_auth.token_configured() {
        tracing::warn!("No ingest token configured; ingest routes accept loopback peers only");
    }

    let api_routes = Router::new()
        .merge(agent_facing_routes(&state))
        .merge(operator_routes());

    #[allow(unused_mut)]
    let mut router = Router::new()
        .nest("/api/v1", api_routes)
        .nest("/health", health::create_router())
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler));

    #[cfg(feature = "openapi")]
    {
        router = router.route("/openapi.json", get(openapi_json));
    }

    #[allow(unused_mut)]
    let mut router: Router = router.with_state(state);

    #[cfg(feature = "swagger-ui")]
    {
        use utoipa::OpenApi;
        use utoipa_swagger_ui::SwaggerUi;
        router = router.merge(
            SwaggerUi::new("/swagger-ui")
                .url("/api-docs/openapi.json", crate::openapi::ApiDoc::openapi()),
        );
    }

    router
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(from_fn(observability_middleware))
        .layer(build_cors_layer(config))
}

// ============================================================================
// CORS LAYER
// ============================================================================

/// Build the CORS layer from ApiConfig.
///
/// Empty origins allow everything; otherwise origins are matched with
/// `ApiConfig::is_origin_allowed`, which also understands `*.domain`.
fn build_cors_layer(config: &ApiConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static(INGEST_TOKEN_HEADER),
        ])
        .max_age(Duration::from_secs(config.cors_max_age_secs));

    if config.cors_origins.is_empty() {
        tracing::info!("CORS: allowing all origins");
        return cors.allow_origin(Any);
    }

    tracing::info!(origins = ?config.cors_origins, "CORS: restricting origins");
    let allowed = config.clone();
    cors.allow_origin(AllowOrigin::predicate(
        move |origin: &HeaderValue, _parts| {
            origin
                .to_str()
                .map(|o| allowed.is_origin_allowed(o))
                .unwrap_or(false)
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cors_layer_builds_for_both_modes() {
        let open = ApiConfig::default();
        let _ = build_cors_layer(&open);

        let restricted = ApiConfig {
            cors_origins: vec!["*.example.com".to_string()],
            ..ApiConfig::default()
        };
        let _ = build_cors_layer(&restricted);
    }
}
