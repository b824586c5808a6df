//! Webhook delivery integration tests
//!
//! A wiremock server stands in for the operator's endpoint; protocol events
//! come from the scripted client. Runs on real time since delivery is real
//! HTTP.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use wahub_core::config::{MediaConfig, WebhookConfig};
use wahub_core::models::{ContactInfo, InboundMessage, NewDevice};
use wahub_core::testing::{wait_until, FakeFactory};
use wahub_core::{ConfigStore, ProtocolEvent};
use wahub_server::http::{test_webhook_inner, HttpState};
use wahub_server::registry::DeviceRegistry;
use wahub_server::session::{Session, SessionContext};
use wahub_server::subsystems::media::MediaFetcher;
use wahub_server::subsystems::retry::RetryPolicy;
use wahub_server::subsystems::sender::{PacingPolicy, SendPipeline};
use wahub_server::subsystems::webhook::WebhookDispatcher;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn registry(dir: &tempfile::TempDir, factory: Arc<FakeFactory>) -> Arc<DeviceRegistry> {
    let webhook = WebhookConfig {
        timeout_ms: 500,
        ..WebhookConfig::default()
    };
    Arc::new(DeviceRegistry::new(Arc::new(SessionContext {
        store: ConfigStore::new(dir.path().join("configs"), dir.path().join("sessions")),
        factory,
        webhooks: WebhookDispatcher::new(&webhook).unwrap(),
        sender: SendPipeline::new(PacingPolicy::immediate(), RetryPolicy::default()),
        media: MediaFetcher::new(&MediaConfig::default()).unwrap(),
        reconnect_delay: Duration::from_secs(10),
        reinit_delay: Duration::from_secs(5),
    })))
}

async fn ready_device(
    registry: &DeviceRegistry,
    factory: &FakeFactory,
    webhook_url: Option<String>,
) -> Arc<Session> {
    let session = registry
        .create(NewDevice {
            device_name: Some("Sales".into()),
            webhook_url,
            auto_reply: None,
        })
        .await
        .unwrap();
    factory.emit(session.device_id(), ProtocolEvent::Ready);
    wait_until(Duration::from_secs(5), || session.is_ready()).await;
    session
}

/// Wait for `count` requests to land on the mock and return their bodies.
async fn bodies(server: &MockServer, count: usize) -> Vec<Value> {
    for _ in 0..200 {
        let received = server.received_requests().await.unwrap_or_default();
        if received.len() >= count {
            return received
                .iter()
                .map(|r| serde_json::from_slice(&r.body).unwrap())
                .collect();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} webhook requests", count);
}

fn message(body: &str, from_me: bool) -> InboundMessage {
    InboundMessage {
        id: "false_628@c.us_ABC".into(),
        from: if from_me { "6289900000000@c.us" } else { "6281234567890@c.us" }.into(),
        to: if from_me { "6281234567890@c.us" } else { "6289900000000@c.us" }.into(),
        body: body.into(),
        timestamp: 1_700_000_000,
        kind: "chat".into(),
        from_me,
        notify_name: Some("Budi".into()),
        ..Default::default()
    }
}

// ===========================================================================
// TEST 1: inbound message is posted as incoming_chat
// ===========================================================================
#[tokio::test]
async fn test_incoming_message_posts_webhook() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    let registry = registry(&dir, Arc::clone(&factory));
    let session = ready_device(&registry, &factory, Some(format!("{}/hook", server.uri()))).await;
    factory.latest(session.device_id()).unwrap().set_contact(ContactInfo {
        pushname: Some("Budi Santoso".into()),
        name: None,
        profile_picture_url: Some("http://pics.local/budi.jpg".into()),
    });

    factory.emit(session.device_id(), ProtocolEvent::Message(message("halo", false)));

    let posted = bodies(&server, 1).await;
    let body = &posted[0];
    assert_eq!(body["type"], "incoming_chat");
    assert_eq!(body["device_id"], session.device_id());
    assert_eq!(body["device_name"], "Sales");
    assert_eq!(body["data"]["chat_id"], "6281234567890");
    assert_eq!(body["data"]["message_body"], "halo");
    assert_eq!(body["data"]["name"], "Budi Santoso");
    assert_eq!(body["data"]["is_from_me"], false);
}

// ===========================================================================
// TEST 2: own outgoing message is posted as outgoing_chat
// ===========================================================================
#[tokio::test]
async fn test_outgoing_message_posts_webhook() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    let registry = registry(&dir, Arc::clone(&factory));
    let session = ready_device(&registry, &factory, Some(server.uri())).await;

    // Someone else's message_create is not ours to report.
    factory.emit(session.device_id(), ProtocolEvent::MessageCreate(message("theirs", false)));
    factory.emit(session.device_id(), ProtocolEvent::MessageCreate(message("ours", true)));

    let posted = bodies(&server, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(posted[0]["type"], "outgoing_chat");
    assert_eq!(posted[0]["data"]["message_body"], "ours");
    assert_eq!(posted[0]["data"]["is_from_me"], true);
}

// ===========================================================================
// TEST 3: an unreachable webhook never disturbs message handling
// ===========================================================================
#[tokio::test]
async fn test_unreachable_webhook_is_swallowed() {
    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    let registry = registry(&dir, Arc::clone(&factory));
    let session = ready_device(&registry, &factory, Some("http://127.0.0.1:1/hook".into())).await;
    let client = factory.latest(session.device_id()).unwrap();

    factory.emit(session.device_id(), ProtocolEvent::Message(message("!test", false)));

    // The bot reply still goes out and the session stays healthy.
    wait_until(Duration::from_secs(5), || client.sent().len() == 1).await;
    assert!(session.is_ready());
    assert_eq!(registry.count().await, 1);
}

// ===========================================================================
// TEST 4: test-webhook endpoint delivers the synthetic event
// ===========================================================================
#[tokio::test]
async fn test_test_webhook_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/verify"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    let registry = registry(&dir, Arc::clone(&factory));
    let url = format!("{}/verify", server.uri());
    let session = ready_device(&registry, &factory, Some(url.clone())).await;
    let state = HttpState::new(Arc::clone(&registry), "k");

    let body = json!({ "apikey": "k", "device_id": session.device_id() });
    let (status, json) = test_webhook_inner(&state, body.as_object().unwrap().clone()).await;

    assert_eq!(status, axum::http::StatusCode::OK, "{}", json);
    assert_eq!(json["webhook_url"], url);
    assert_eq!(json["delivered"], true);
    assert_eq!(json["test_data"]["type"], "test_webhook");
    assert_eq!(json["test_data"]["data"]["message_body"], "Test message from Sales");
}

// ===========================================================================
// TEST 5: no webhook after the device is deleted
// ===========================================================================
#[tokio::test]
async fn test_no_webhook_after_delete() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let factory = FakeFactory::new();
    let registry = registry(&dir, Arc::clone(&factory));
    let session = ready_device(&registry, &factory, Some(server.uri())).await;
    let client = factory.latest(session.device_id()).unwrap();

    registry.delete(session.device_id()).await.unwrap();
    client.emit(ProtocolEvent::Message(message("too late", false)));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server.received_requests().await.unwrap().is_empty());
}
