//! HTTP integration tests for the device API
//!
//! Full Axum `oneshot` dispatch against a registry backed by the scripted
//! in-memory protocol client. No network and no sidecar required.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;
use wahub_core::config::{MediaConfig, WebhookConfig};
use wahub_core::models::OutboundContent;
use wahub_core::testing::{wait_until, FakeFactory};
use wahub_core::{ConfigStore, ProtocolEvent};
use wahub_server::http::{build_router, HttpState};
use wahub_server::registry::DeviceRegistry;
use wahub_server::session::SessionContext;
use wahub_server::subsystems::media::MediaFetcher;
use wahub_server::subsystems::retry::RetryPolicy;
use wahub_server::subsystems::sender::{PacingPolicy, SendPipeline};
use wahub_server::subsystems::webhook::WebhookDispatcher;

const KEY: &str = "integration-key";

struct Harness {
    _dir: tempfile::TempDir,
    store: ConfigStore,
    factory: Arc<FakeFactory>,
    state: Arc<HttpState>,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::new(dir.path().join("configs"), dir.path().join("sessions"));
    let factory = FakeFactory::new();
    let ctx = SessionContext {
        store: store.clone(),
        factory: factory.clone(),
        webhooks: WebhookDispatcher::new(&WebhookConfig::default()).unwrap(),
        sender: SendPipeline::new(PacingPolicy::immediate(), RetryPolicy::default()),
        media: MediaFetcher::new(&MediaConfig::default()).unwrap(),
        reconnect_delay: Duration::from_secs(10),
        reinit_delay: Duration::from_secs(5),
    };
    let registry = Arc::new(DeviceRegistry::new(Arc::new(ctx)));
    Harness {
        _dir: dir,
        store,
        factory,
        state: Arc::new(HttpState::new(registry, KEY)),
    }
}

async fn call(h: &Harness, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let app = build_router(Arc::clone(&h.state), 1024 * 1024);
    let body = match body {
        Some(v) => Body::from(v.to_string()),
        None => Body::empty(),
    };
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

async fn create(h: &Harness, body: Value) -> String {
    let (status, json) = call(h, "POST", "/api/devices", Some(body)).await;
    assert_eq!(status, StatusCode::OK, "{}", json);
    json["device"]["device_id"].as_str().unwrap().to_string()
}

async fn make_ready(h: &Harness, id: &str) {
    let session = h.state.registry.get(id).await.unwrap();
    h.factory.emit(id, ProtocolEvent::Ready);
    wait_until(Duration::from_secs(5), || session.is_ready()).await;
}

// ===========================================================================
// TEST 1: GET /api/health: no auth, healthy
// ===========================================================================
#[tokio::test(start_paused = true)]
async fn test_health_endpoint() {
    let h = harness();
    let (status, json) = call(&h, "GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert!(json["timestamp"].is_string());
    assert!(json["uptime"].is_number());
    assert!(json.get("memory").is_some());
}

// ===========================================================================
// TEST 2: POST /api/devices: the "Sales" device starts unready, no QR
// ===========================================================================
#[tokio::test(start_paused = true)]
async fn test_create_sales_device() {
    let h = harness();
    let (status, json) = call(
        &h,
        "POST",
        "/api/devices",
        Some(json!({ "apikey": KEY, "device_name": "Sales", "webhook_url": null, "auto_reply": false })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "success");
    assert_eq!(json["message"], "Device successfully created");
    assert_eq!(json["device"]["device_name"], "Sales");
    assert_eq!(json["device"]["is_ready"], false);
    assert_eq!(json["device"]["has_qr"], false);
    assert_eq!(h.state.registry.count().await, 1);

    let (status, json) = call(&h, "GET", "/api/devices", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 1);
    assert_eq!(json["devices"][0]["device_name"], "Sales");
}

// ===========================================================================
// TEST 3: auth ladder: 401 missing key, 403 wrong key, 400 missing id
// ===========================================================================
#[tokio::test(start_paused = true)]
async fn test_auth_errors() {
    let h = harness();

    let (status, json) = call(&h, "POST", "/api/device/qr", Some(json!({ "device_id": "x" }))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["status"], "error");
    assert_eq!(json["message"], "Parameter 'apikey' is required in the request body.");

    let (status, json) = call(
        &h,
        "POST",
        "/api/device/qr",
        Some(json!({ "apikey": "wrong", "device_id": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["message"], "Invalid API Key.");

    let (status, json) = call(&h, "POST", "/api/device/qr", Some(json!({ "apikey": KEY }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["message"], "Parameter 'device_id' is required in the request body.");

    let (status, _) = call(&h, "POST", "/api/devices", Some(json!({ "apikey": "wrong" }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(h.state.registry.count().await, 0);
}

// ===========================================================================
// TEST 4: unknown device is 404 on every device route
// ===========================================================================
#[tokio::test(start_paused = true)]
async fn test_unknown_device_is_404() {
    let h = harness();
    let body = json!({ "apikey": KEY, "device_id": "nope", "number": "1", "message": "x" });

    for (method, uri) in [
        ("GET", "/api/device"),
        ("PUT", "/api/device"),
        ("DELETE", "/api/device"),
        ("POST", "/api/device/qr"),
        ("POST", "/api/device/send-message"),
        ("POST", "/api/device/logout"),
        ("POST", "/api/device/test-webhook"),
    ] {
        let (status, json) = call(&h, method, uri, Some(body.clone())).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{} {}", method, uri);
        assert_eq!(json["message"], "Device not found");
    }
}

// ===========================================================================
// TEST 5: send-message: 503 before ready, then target normalisation
// ===========================================================================
#[tokio::test(start_paused = true)]
async fn test_send_message_flow() {
    let h = harness();
    let id = create(&h, json!({ "apikey": KEY })).await;

    // Not ready wins over missing parameters.
    let (status, json) = call(
        &h,
        "POST",
        "/api/device/send-message",
        Some(json!({ "apikey": KEY, "device_id": id })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["message"], "Device not ready. Wait until status is ready.");
    assert_eq!(h.factory.latest(&id).unwrap().call_count("send:"), 0);

    make_ready(&h, &id).await;

    let (status, json) = call(
        &h,
        "POST",
        "/api/device/send-message",
        Some(json!({ "apikey": KEY, "device_id": id, "number": "6281234567890" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["message"], "Parameters 'number' and 'message' are required");

    let (status, json) = call(
        &h,
        "POST",
        "/api/device/send-message",
        Some(json!({ "apikey": KEY, "device_id": id, "number": "6281234567890", "message": "Halo" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", json);
    assert_eq!(json["to"], "6281234567890@c.us");
    assert_eq!(json["device_id"], id);

    let sent = h.factory.latest(&id).unwrap().sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "6281234567890@c.us");
    assert_eq!(sent[0].1, OutboundContent::text("Halo"));
}

// ===========================================================================
// TEST 6: send-image / send-document: inline data and bad sources
// ===========================================================================
#[tokio::test(start_paused = true)]
async fn test_send_media_endpoints() {
    let h = harness();
    let id = create(&h, json!({ "apikey": KEY })).await;
    make_ready(&h, &id).await;

    let (status, json) = call(
        &h,
        "POST",
        "/api/device/send-image",
        Some(json!({ "apikey": KEY, "device_id": id, "number": "62811", "image": "not-a-url" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["message"], "Invalid media format");

    let (status, json) = call(
        &h,
        "POST",
        "/api/device/send-image",
        Some(json!({
            "apikey": KEY, "device_id": id, "number": "62811",
            "image": "data:image/png;base64,aGVsbG8=", "caption": "look"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", json);
    assert_eq!(json["message"], "Image sent successfully");

    let (status, json) = call(
        &h,
        "POST",
        "/api/device/send-document",
        Some(json!({
            "apikey": KEY, "device_id": id, "number": "62811",
            "document": "data:application/pdf;base64,aGVsbG8=", "filename": "invoice.pdf"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", json);
    assert_eq!(json["filename"], "invoice.pdf");

    let sent = h.factory.latest(&id).unwrap().sent();
    assert_eq!(sent.len(), 2);
    match &sent[1].1 {
        OutboundContent::Media { media, as_document, .. } => {
            assert!(*as_document);
            assert_eq!(media.mime_type, "application/pdf");
            assert_eq!(media.filename, "invoice.pdf");
        }
        other => panic!("expected media, got {:?}", other),
    }
}

// ===========================================================================
// TEST 7: PUT /api/device: update persists and reloads identically
// ===========================================================================
#[tokio::test(start_paused = true)]
async fn test_update_round_trip() {
    let h = harness();
    let id = create(&h, json!({ "apikey": KEY, "device_name": "Old" })).await;

    let (status, json) = call(
        &h,
        "PUT",
        "/api/device",
        Some(json!({
            "apikey": KEY, "device_id": id, "device_name": "Support",
            "webhook_url": "http://hooks.local/in", "auto_reply": true
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", json);
    assert_eq!(json["message"], "Device configuration updated successfully");
    assert_eq!(json["device"]["device_name"], "Support");

    let stored = h.store.load(&id).await.unwrap().unwrap();
    assert_eq!(stored.device_name, "Support");
    assert_eq!(stored.webhook_url.as_deref(), Some("http://hooks.local/in"));
    assert!(stored.auto_reply);

    // null clears the webhook, absent fields stay put
    call(
        &h,
        "PUT",
        "/api/device",
        Some(json!({ "apikey": KEY, "device_id": id, "webhook_url": null })),
    )
    .await;
    let stored = h.store.load(&id).await.unwrap().unwrap();
    assert_eq!(stored.webhook_url, None);
    assert_eq!(stored.device_name, "Support");
    assert!(stored.auto_reply);
}

// ===========================================================================
// TEST 8: QR, delete, and the late ready event for a deleted device
// ===========================================================================
#[tokio::test(start_paused = true)]
async fn test_qr_then_delete_then_late_ready() {
    let h = harness();
    let id = create(&h, json!({ "apikey": KEY })).await;
    let session = h.state.registry.get(&id).await.unwrap();
    let client = h.factory.latest(&id).unwrap();

    client.emit(ProtocolEvent::Qr("2@qr-payload".into()));
    wait_until(Duration::from_secs(5), || session.current_qr().is_some()).await;

    let (status, json) = call(
        &h,
        "POST",
        "/api/device/qr",
        Some(json!({ "apikey": KEY, "device_id": id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["qr_code"], "2@qr-payload");

    let (status, json) = call(
        &h,
        "DELETE",
        "/api/device",
        Some(json!({ "apikey": KEY, "device_id": id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", json);
    assert_eq!(json["device_id"], id);

    // Late event from the torn-down handle goes nowhere.
    client.emit(ProtocolEvent::Ready);
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(h.state.registry.get(&id).await.is_none());
    assert!(!session.is_ready());
    assert!(!session.status().has_qr);
    assert_eq!(h.factory.created(&id), 1);
    assert!(h.store.load(&id).await.unwrap().is_none());

    let (status, _) = call(
        &h,
        "POST",
        "/api/device/qr",
        Some(json!({ "apikey": KEY, "device_id": id })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ===========================================================================
// TEST 9: logout: handle is replaced after the re-init delay
// ===========================================================================
#[tokio::test(start_paused = true)]
async fn test_logout_reinitialises() {
    let h = harness();
    let id = create(&h, json!({ "apikey": KEY })).await;
    make_ready(&h, &id).await;
    let first = h.factory.latest(&id).unwrap();

    let (status, json) = call(
        &h,
        "POST",
        "/api/device/logout",
        Some(json!({ "apikey": KEY, "device_id": id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", json);
    assert_eq!(json["message"], "Logout successful. Waiting for new QR...");
    assert_eq!(first.call_count("destroy"), 1);

    let (_, json) = call(&h, "GET", "/api/device", Some(json!({ "apikey": KEY, "device_id": id }))).await;
    assert_eq!(json["device"]["is_ready"], false);

    wait_until(Duration::from_secs(30), || h.factory.created(&id) == 2).await;
    let second = h.factory.latest(&id).unwrap();
    wait_until(Duration::from_secs(5), || second.call_count("initialize") == 1).await;
}

// ===========================================================================
// TEST 10: GET /api/status: counts ready vs pending
// ===========================================================================
#[tokio::test(start_paused = true)]
async fn test_global_status() {
    let h = harness();
    let a = create(&h, json!({ "apikey": KEY })).await;
    create(&h, json!({ "apikey": KEY })).await;
    make_ready(&h, &a).await;

    let (status, json) = call(&h, "GET", "/api/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total_devices"], 2);
    assert_eq!(json["ready_devices"], 1);
    assert_eq!(json["pending_devices"], 1);
}

// ===========================================================================
// TEST 11: compatibility routes
// ===========================================================================
#[tokio::test(start_paused = true)]
async fn test_legacy_routes() {
    let h = harness();

    let (status, json) = call(
        &h,
        "POST",
        "/get_qr",
        Some(json!({ "apikey": KEY, "device_id": "ghost" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["message"], "Device not found. Create a new device or check /api/devices");

    let id = create(&h, json!({ "apikey": KEY })).await;
    make_ready(&h, &id).await;

    let (status, json) = call(
        &h,
        "POST",
        "/send-message",
        Some(json!({ "apikey": KEY, "device_id": id, "number": "62899", "message": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", json);
    assert_eq!(json["message"], "Message sent successfully (Compatibility mode)");
}

// ===========================================================================
// TEST 12: malformed JSON and unknown routes
// ===========================================================================
#[tokio::test(start_paused = true)]
async fn test_bad_input_and_fallback() {
    let h = harness();
    let app = build_router(Arc::clone(&h.state), 1024);

    let req = Request::builder()
        .method("POST")
        .uri("/api/devices")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let (status, json) = call(&h, "GET", "/api/nothing-here", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["status"], "error");
    let endpoints = json["available_endpoints"].as_array().unwrap();
    assert!(endpoints
        .iter()
        .any(|e| e.as_str().unwrap().starts_with("POST /api/device/send-message")));
}
