//! Prometheus Metrics Definitions
//!
//! Defines all RFIDGATE metrics with appropriate labels and types.
//! Exposes a /metrics endpoint for Prometheus scraping.

use axum::{http::StatusCode, response::IntoResponse};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};
use rfidgate_fulfillment::FulfillmentReport;

use crate::error::{ApiError, ApiResult};

/// HTTP request latency buckets (seconds)
/// Covers: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
const HTTP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance - initialized once at startup
pub static METRICS: Lazy<ApiResult<RfidgateMetrics>> = Lazy::new(RfidgateMetrics::new);

/// Container for all RFIDGATE metrics.
#[derive(Clone)]
pub struct RfidgateMetrics {
    /// HTTP request counter - labels: method, path, status
    pub http_requests_total: CounterVec,

    /// HTTP request duration histogram - labels: method, path
    pub http_request_duration_seconds: HistogramVec,

    /// Edge events - labels: op, outcome (accepted, duplicate or a conflict code)
    pub edge_events_total: CounterVec,

    /// Business documents created - labels: kind
    pub documents_created_total: CounterVec,

    /// EPCs whose fulfillment failed - labels: stage
    pub fulfillment_failures_total: CounterVec,

    /// Agent queue transitions - labels: action (enqueued, leased, replied)
    pub agent_commands_total: CounterVec,

    /// Current active WebSocket connections
    pub websocket_connections: Gauge,
}

fn register_error(name: &str, e: prometheus::Error) -> ApiError {
    ApiError::internal_error(format!("Failed to register {}: {}", name, e))
}

impl RfidgateMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> ApiResult<Self> {
        Ok(Self {
            http_requests_total: register_counter_vec!(
                "rfidgate_http_requests_total",
                "Total number of HTTP requests",
                &["method", "path", "status"]
            )
            .map_err(|e| register_error("http_requests_total", e))?,

            http_request_duration_seconds: register_histogram_vec!(
                "rfidgate_http_request_duration_seconds",
                "HTTP request duration in seconds",
                &["method", "path"],
                HTTP_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| register_error("http_request_duration_seconds", e))?,

            edge_events_total: register_counter_vec!(
                "rfidgate_edge_events_total",
                "Edge events by operation and outcome",
                &["op", "outcome"]
            )
            .map_err(|e| register_error("edge_events_total", e))?,

            documents_created_total: register_counter_vec!(
                "rfidgate_documents_created_total",
                "Stock issues and delivery notes created",
                &["kind"]
            )
            .map_err(|e| register_error("documents_created_total", e))?,

            fulfillment_failures_total: register_counter_vec!(
                "rfidgate_fulfillment_failures_total",
                "EPCs whose fulfillment failed",
                &["stage"]
            )
            .map_err(|e| register_error("fulfillment_failures_total", e))?,

            agent_commands_total: register_counter_vec!(
                "rfidgate_agent_commands_total",
                "Agent command queue transitions",
                &["action"]
            )
            .map_err(|e| register_error("agent_commands_total", e))?,

            websocket_connections: register_gauge!(
                "rfidgate_websocket_connections",
                "Current number of active WebSocket connections"
            )
            .map_err(|e| register_error("websocket_connections", e))?,
        })
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, &status_str])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    /// Record one edge event outcome. `outcome` is `accepted`, `duplicate`,
    /// or a conflict code.
    pub fn record_edge_event(&self, op: &str, outcome: &str) {
        self.edge_events_total
            .with_label_values(&[op, outcome])
            .inc();
    }

    /// Record documents created and failures from one fulfillment pass.
    pub fn record_fulfillment(&self, report: &FulfillmentReport) {
        let stock = report.stock_docs_created();
        if stock > 0 {
            self.documents_created_total
                .with_label_values(&["stock_entry"])
                .inc_by(stock as f64);
        }
        let delivery = report.delivery_notes_created();
        if delivery > 0 {
            self.documents_created_total
                .with_label_values(&["delivery_note"])
                .inc_by(delivery as f64);
        }
        let failures = report.failures();
        if failures > 0 {
            self.fulfillment_failures_total
                .with_label_values(&["ingest"])
                .inc_by(failures as f64);
        }
    }

    /// Record a print-time stock draft.
    pub fn record_print_draft(&self, created: bool, failed: bool) {
        if created {
            self.documents_created_total
                .with_label_values(&["stock_entry"])
                .inc();
        }
        if failed {
            self.fulfillment_failures_total
                .with_label_values(&["print"])
                .inc();
        }
    }

    pub fn record_agent_commands(&self, action: &str, count: usize) {
        if count > 0 {
            self.agent_commands_total
                .with_label_values(&[action])
                .inc_by(count as f64);
        }
    }

    /// Increment WebSocket connection count.
    pub fn ws_connected(&self) {
        self.websocket_connections.inc();
    }

    /// Decrement WebSocket connection count.
    pub fn ws_disconnected(&self) {
        self.websocket_connections.dec();
    }
}

/// Run `f` against the global metrics, skipping silently if registration
/// failed at startup.
pub fn with_metrics(f: impl FnOnce(&RfidgateMetrics)) {
    if let Ok(metrics) = METRICS.as_ref() {
        f(metrics);
    }
}

/// Handler for GET /metrics endpoint.
///
/// Returns Prometheus text format metrics.
#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/metrics",
    tag = "Observability",
    responses(
        (status = 200, description = "Prometheus metrics in text format", content_type = "text/plain"),
        (status = 500, description = "Failed to encode metrics"),
    ),
))]
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}
