//! Router-level tests over the in-memory backends.
//!
//! Requests go through the full middleware stack with `oneshot`; time and
//! tokens are deterministic.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::ConnectInfo;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use rfidgate_api::{create_api_router, ApiConfig, AppState, Backends, Seams, INGEST_TOKEN_HEADER};
use rfidgate_core::{RfidConfig, TagStatus};
use rfidgate_storage::RecordStore;
use rfidgate_test_utils::{fixtures, ManualClock, SequentialTokens};

const TOKEN: &str = "dock-secret";

struct TestApp {
    router: Router,
    store: Arc<dyn RecordStore>,
    clock: Arc<ManualClock>,
}

fn app_with(ingest_token: Option<&str>) -> TestApp {
    let backends = Backends::in_memory_with_catalog(fixtures::seeded_catalog());
    let store = backends.store.clone();
    let clock = Arc::new(ManualClock::at_t0());
    let seams = Seams {
        clock: clock.clone(),
        tokens: Arc::new(SequentialTokens::new()),
    };
    let api_config = ApiConfig {
        ingest_token: ingest_token.map(str::to_string),
        ..ApiConfig::default()
    };
    let state = AppState::new(backends, seams, &api_config, RfidConfig::default());
    TestApp {
        router: create_api_router(state, &api_config),
        store,
        clock,
    }
}

fn app() -> TestApp {
    app_with(Some(TOKEN))
}

fn json_request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(INGEST_TOKEN_HEADER, TOKEN);
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, body)
}

async fn post(app: &TestApp, uri: &str, body: Value) -> (StatusCode, Value) {
    send(app, json_request(Method::POST, uri, Some(body))).await
}

async fn get(app: &TestApp, uri: &str) -> (StatusCode, Value) {
    send(app, json_request(Method::GET, uri, None)).await
}

fn ingest_body(event_id: &str, seq: i64, epc: &str) -> Value {
    json!({
        "device": fixtures::DEVICE,
        "event_id": event_id,
        "batch_id": "B1",
        "seq": seq,
        "tags": [fixtures::read(epc, 1)],
    })
}

// ============================================================================
// HEALTH
// ============================================================================

#[tokio::test]
async fn test_health_endpoints() {
    let app = app();
    let (status, body) = get(&app, "/health/ping").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("pong".to_string()));

    let (status, body) = get(&app, "/health/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["details"]["store"]["status"], "healthy");
}

// ============================================================================
// INGEST
// ============================================================================

#[tokio::test]
async fn test_ingest_consumes_then_dedupes_then_rejects_regression() {
    let app = app();
    let epc = "5A42C0FFEE01";
    app.store
        .tag_insert(&fixtures::printed_tag(epc, 1))
        .await
        .unwrap();

    let (status, body) = post(&app, "/api/v1/ingest/tags", ingest_body("e1", 1, epc)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["duplicate"], false);
    assert_eq!(body["aggregated"], 1);
    assert_eq!(body["zebra_processed"], 1);

    let tag = app.store.tag_get(epc).await.unwrap().unwrap();
    assert_eq!(tag.status, TagStatus::Consumed);

    let (status, body) = post(&app, "/api/v1/ingest/tags", ingest_body("e1", 1, epc)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["duplicate"], true);
    assert_eq!(body["received"], 0);

    let (status, body) = post(&app, "/api/v1/ingest/tags", ingest_body("e2", 0, epc)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["ok"], false);
    assert_eq!(body["code"], "SEQ_REGRESSION");
    assert!(body["error"].as_str().is_some());
}

#[tokio::test]
async fn test_saved_tags_and_antenna_stats() {
    let app = app();
    let body = json!({
        "device": fixtures::DEVICE,
        "tags": [
            { "epc": "5A42AA", "ant": 1, "count": 2 },
            { "epc": "5A42BB", "ant": 2 },
        ],
    });
    let (status, _) = post(&app, "/api/v1/ingest/tags", body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    let (_, second) = post(&app, "/api/v1/ingest/tags", body).await;
    assert_eq!(second["seen_before"], 3);

    let (status, saved) = get(&app, "/api/v1/saved-tags?order=reads").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(saved["count"], 2);
    assert_eq!(saved["items"][0]["epc"], "5A42AA");
    assert_eq!(saved["items"][0]["reads"], 4);

    let (_, stats) = get(&app, "/api/v1/antenna/stats").await;
    let ants: Vec<i64> = stats["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["ant_id"].as_i64().unwrap())
        .collect();
    assert_eq!(ants, vec![1, 2]);

    let (status, body) = get(&app, "/api/v1/saved-tags?date=yesterday").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);

    let (status, _) = send(&app, json_request(Method::DELETE, "/api/v1/saved-tags", None)).await;
    assert_eq!(status, StatusCode::OK);
    let (_, saved) = get(&app, "/api/v1/saved-tags").await;
    assert_eq!(saved["count"], 0);
}

#[tokio::test]
async fn test_scale_reading_is_cached_until_ttl() {
    let app = app();
    let (status, body) = post(
        &app,
        "/api/v1/ingest/scale",
        json!({ "device": "scale-a", "weight": "12.5", "unit": "KG", "stable": true }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["device"], "scale-a");

    let (_, body) = get(&app, "/api/v1/scale/weight?device=scale-a").await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["reading"]["weight"], 12.5);

    app.clock.advance_secs(RfidConfig::default().scale_ttl_secs as i64 + 1);
    let (_, body) = get(&app, "/api/v1/scale/weight").await;
    assert_eq!(body["ok"], false);
    assert!(body["reading"].is_null());

    let (status, body) = post(&app, "/api/v1/ingest/scale", json!({ "device": "scale-a" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);
}

// ============================================================================
// INGEST AUTH
// ============================================================================

#[tokio::test]
async fn test_ingest_routes_require_token() {
    let app = app();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/ingest/tags")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "tags": [] }).to_string()))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    // Read-side routes stay open.
    let request = Request::builder()
        .uri("/api/v1/antenna/stats")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_without_token_only_loopback_may_ingest() {
    let app = app_with(None);
    let request_from = |ip: [u8; 4]| {
        let mut request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/agents/poll")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "agent_id": "agent-1" }).to_string()))
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((ip, 50000))));
        request
    };

    let (status, _) = send(&app, request_from([127, 0, 0, 1])).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, request_from([10, 0, 0, 7])).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// ============================================================================
// EDGE
// ============================================================================

#[tokio::test]
async fn test_edge_batch_lifecycle() {
    let app = app();
    let start = json!({
        "event_id": "s1",
        "device_id": fixtures::DEVICE,
        "batch_id": "B7",
        "seq": 1,
        "product_id": fixtures::ITEM_CODE,
    });
    let (status, body) = post(&app, "/api/v1/edge/batch-start", start.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true, "event_id": "s1", "duplicate": false }));

    let (_, body) = post(&app, "/api/v1/edge/batch-start", start).await;
    assert_eq!(body["duplicate"], true);

    let (status, state) = get(&app, &format!("/api/v1/edge/state/{}", fixtures::DEVICE)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state["current_batch_id"], "B7");
    assert_eq!(state["last_event_seq"], 1);

    let (status, body) = post(
        &app,
        "/api/v1/edge/batch-stop",
        json!({ "event_id": "s2", "device_id": fixtures::DEVICE, "batch_id": "OTHER", "seq": 2 }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "BATCH_MISMATCH");

    let (status, _) = get(&app, "/api/v1/edge/state/never-seen").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = post(
        &app,
        "/api/v1/edge/product-switch",
        json!({ "event_id": "s3", "device_id": fixtures::DEVICE, "batch_id": "B7", "seq": 3, "product_id": "NOPE" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);
}

// ============================================================================
// TAGS AND RULES
// ============================================================================

#[tokio::test]
async fn test_tag_create_is_idempotent_and_printable() {
    let app = app();
    let request = json!({
        "item_code": fixtures::ITEM_CODE,
        "qty": 2,
        "consume_antenna_id": 1,
        "client_request_id": "label-42",
    });
    let (status, created) = post(&app, "/api/v1/tags", request.clone()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["existing"], false);
    let epc = created["epc"].as_str().unwrap().to_string();
    assert_eq!(epc.len(), 24);

    let (status, again) = post(&app, "/api/v1/tags", request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["existing"], true);
    assert_eq!(again["epc"], epc.as_str());

    let (status, report) = post(&app, &format!("/api/v1/tags/{}/printed", epc), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["epc"], epc.as_str());

    let (status, info) = post(&app, "/api/v1/tags/info", json!({ "epcs": [epc, "FFFF"] })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["count"], 1);
    assert_eq!(info["items"][0]["item_code"], fixtures::ITEM_CODE);

    let (status, _) = get(&app, "/api/v1/tags/epcs?status=Bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post(
        &app,
        "/api/v1/tags",
        json!({ "item_code": "MISSING", "qty": 1, "consume_antenna_id": 1 }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_antenna_rule_admin() {
    let app = app();
    let (status, body) = send(
        &app,
        json_request(
            Method::PUT,
            "/api/v1/antenna/rules",
            Some(json!({ "device": "Dock-1", "antenna_id": 2, "create_delivery_note": true })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // Delivery needs stock submission.
    assert_eq!(body["rule"]["create_delivery_note"], false);

    let (_, rules) = get(&app, "/api/v1/antenna/rules").await;
    assert_eq!(rules["items"].as_array().map(Vec::len), Some(1));
    assert_eq!(rules["items"][0]["device"], "dock-1");

    let (status, _) = send(
        &app,
        json_request(Method::PUT, "/api/v1/antenna/rules", Some(json!({ "antenna_id": 40 }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        json_request(Method::DELETE, "/api/v1/antenna/rules?device=dock-1&antenna_id=2", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);
}

#[tokio::test]
async fn test_delivery_settings_listing() {
    let app = app();
    let (status, body) = get(&app, "/api/v1/delivery-settings").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["items"][0]["item_code"], fixtures::ITEM_CODE);
    assert_eq!(body["items"][0]["customer"], "Walk-in");
    assert_eq!(body["items"][0]["default_rate"], 12.5);
}

// ============================================================================
// TAG NOTES
// ============================================================================

async fn put_note(app: &TestApp, epc: &str, body: Value) -> (StatusCode, Value) {
    let uri = format!("/api/v1/tags/notes/{}", epc);
    send(app, json_request(Method::PUT, &uri, Some(body))).await
}

#[tokio::test]
async fn test_tag_note_upsert_lookup_and_clear() {
    let app = app();
    let (status, body) =
        put_note(&app, "aa01", json!({ "note": "  dented  ", "device": "dock-1" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["epc"], "AA01");
    assert_eq!(body["note"], "dented");
    put_note(&app, "BB02", json!({ "note": "resealed" })).await;

    // A later write without a device keeps the stored one.
    put_note(&app, "AA01", json!({ "note": "dented, ok to ship" })).await;
    let stored = app.store.tag_notes_list(&["AA01".to_string()], 10).await.unwrap();
    assert_eq!(stored[0].device, "dock-1");
    assert_eq!(stored[0].note, "dented, ok to ship");

    let (status, body) = get(&app, "/api/v1/tags/notes?epcs=aa01,CC03").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["notes"]["AA01"], "dented, ok to ship");

    let (_, all) = get(&app, "/api/v1/tags/notes").await;
    assert_eq!(all["count"], 2);

    let (status, body) = put_note(&app, "AA01", json!({ "note": "   " })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);
    let (_, all) = get(&app, "/api/v1/tags/notes").await;
    assert_eq!(all["count"], 1);
    assert!(all["notes"].get("AA01").is_none());
}

#[tokio::test]
async fn test_tag_note_rejects_epc_without_hex() {
    let app = app();
    let (status, _) = put_note(&app, "zz", json!({ "note": "x" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_tag_note_is_capped() {
    let app = app();
    let (_, body) = put_note(&app, "AA01", json!({ "note": "n".repeat(700) })).await;
    assert_eq!(body["note"].as_str().map(str::len), Some(500));
}

// ============================================================================
// AGENTS
// ============================================================================

#[tokio::test]
async fn test_agent_command_round_trip() {
    let app = app();
    let (status, registered) = post(
        &app,
        "/api/v1/agents/register",
        json!({ "agent_id": "agent-1", "device": "Dock 1", "ui_urls": ["http://10.0.0.5:8080/"] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(registered["agent"]["ui_urls"][0], "http://10.0.0.5:8080");

    let (_, agents) = get(&app, "/api/v1/agents").await;
    assert_eq!(agents["items"].as_array().map(Vec::len), Some(1));

    let (status, queued) = post(
        &app,
        "/api/v1/agents/enqueue",
        json!({ "agent_id": "agent-1", "command": "restart_reader", "args": "{\"port\":1}", "timeout_sec": 500 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(queued["timeout_sec"], 120);
    let request_id = queued["request_id"].as_str().unwrap().to_string();

    let (_, pending) = get(&app, &format!("/api/v1/agents/result/{}", request_id)).await;
    assert_eq!(pending["state"], "pending");

    let (_, polled) = post(&app, "/api/v1/agents/poll", json!({ "agent_id": "agent-1" })).await;
    assert_eq!(polled["commands"][0]["request_id"], request_id.as_str());
    assert_eq!(polled["commands"][0]["cmd"], "restart_reader");
    assert_eq!(polled["commands"][0]["args"]["port"], 1);

    let (_, again) = post(&app, "/api/v1/agents/poll", json!({ "agent_id": "agent-1" })).await;
    assert_eq!(again["commands"].as_array().map(Vec::len), Some(0));

    let reply = json!({ "agent_id": "agent-1", "request_id": request_id, "result": { "restarted": true } });
    let (_, ack) = post(&app, "/api/v1/agents/reply", reply.clone()).await;
    assert_eq!(ack["applied"], true);
    let (_, ack) = post(&app, "/api/v1/agents/reply", reply).await;
    assert_eq!(ack["applied"], false);

    let (_, done) = get(&app, &format!("/api/v1/agents/result/{}", request_id)).await;
    assert_eq!(done["state"], "done");
    assert_eq!(done["reply"]["ok"], true);
    assert_eq!(done["reply"]["result"]["restarted"], true);

    let (status, _) = post(
        &app,
        "/api/v1/agents/reply",
        json!({ "agent_id": "agent-1", "request_id": "unknown-request" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, expired) = get(&app, "/api/v1/agents/result/unknown-request").await;
    assert_eq!(expired["state"], "expired");
}
