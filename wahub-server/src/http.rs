//! Device HTTP API
//!
//! Axum-based control surface for the device registry. Device identity and
//! the API key travel in the JSON body, not the path.
//!
//! Architecture: each endpoint has a thin axum handler that parses the body
//! and delegates to an inner function returning `(StatusCode, json)`. The
//! inner functions are directly testable without axum dispatch machinery.
//!
//! Endpoints:
//! - POST   /api/devices              - create device (apikey)
//! - GET    /api/devices              - list devices
//! - GET    /api/device               - device status (apikey, device_id)
//! - PUT    /api/device               - update config (apikey, device_id)
//! - DELETE /api/device               - delete device permanently
//! - POST   /api/device/qr            - pending QR code
//! - POST   /api/device/send-message  - send text
//! - POST   /api/device/send-image    - send image (URL or data URI)
//! - POST   /api/device/send-document - send document (URL or data URI)
//! - POST   /api/device/logout        - unlink and wait for a new QR
//! - POST   /api/device/test-webhook  - fire a synthetic webhook
//! - GET    /api/status               - registry summary
//! - GET    /api/health               - liveness
//! - POST   /send-message, /get_qr    - compatibility routes

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Map, Value};
use sysinfo::{ProcessesToUpdate, System};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use wahub_core::config::HttpConfig;
use wahub_core::models::{format_target, DeviceConfigUpdate, NewDevice};
use wahub_core::HubError;

use crate::registry::DeviceRegistry;
use crate::session::Session;

/// Shared state for all HTTP handlers
pub struct HttpState {
    pub registry: Arc<DeviceRegistry>,
    pub api_key: String,
    pub started_at: Instant,
}

impl HttpState {
    pub fn new(registry: Arc<DeviceRegistry>, api_key: impl Into<String>) -> Self {
        Self {
            registry,
            api_key: api_key.into(),
            started_at: Instant::now(),
        }
    }
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>, body_limit: usize) -> Router {
    Router::new()
        .route("/api/devices", post(create_device_handler).get(list_devices_handler))
        .route(
            "/api/device",
            get(get_device_handler)
                .put(update_device_handler)
                .delete(delete_device_handler),
        )
        .route("/api/device/qr", post(qr_handler))
        .route("/api/device/send-message", post(send_message_handler))
        .route("/api/device/send-image", post(send_image_handler))
        .route("/api/device/send-document", post(send_document_handler))
        .route("/api/device/logout", post(logout_handler))
        .route("/api/device/test-webhook", post(test_webhook_handler))
        .route("/api/status", get(status_handler))
        .route("/api/health", get(health_handler))
        .route("/send-message", post(legacy_send_message_handler))
        .route("/get_qr", post(legacy_qr_handler))
        .fallback(not_found_handler)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    registry: Arc<DeviceRegistry>,
    config: HttpConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(HttpState::new(registry, config.api_key.clone()));

    let app = build_router(state, config.body_limit_bytes);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Device API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request parsing and shared responses
// ============================================================================

pub type RequestBody = Map<String, Value>;
pub type HttpResult = (StatusCode, Value);

pub const AVAILABLE_ENDPOINTS: &[&str] = &[
    "GET /api/devices - List all devices",
    "POST /api/devices - Create new device",
    "GET /api/device - Get device info",
    "PUT /api/device - Update device config",
    "DELETE /api/device - Delete device",
    "POST /api/device/qr - Get QR code",
    "POST /api/device/send-message - Send text message",
    "POST /api/device/send-image - Send image",
    "POST /api/device/send-document - Send document",
    "POST /api/device/logout - Logout device",
    "POST /api/device/test-webhook - Test webhook",
    "GET /api/status - Global status",
    "GET /api/health - Health check",
];

/// An empty body is an empty object. Anything else must be a JSON object.
pub fn parse_body(raw: &[u8]) -> std::result::Result<RequestBody, HttpResult> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(error_response(
            StatusCode::BAD_REQUEST,
            "Request body must be a JSON object",
            None,
        )),
        Err(e) => Err(error_response(
            StatusCode::BAD_REQUEST,
            "Malformed JSON body",
            Some(e.to_string()),
        )),
    }
}

pub fn error_response(status: StatusCode, message: &str, error: Option<String>) -> HttpResult {
    let mut body = json!({ "status": "error", "message": message });
    if let Some(error) = error {
        body["error"] = Value::from(error);
    }
    (status, body)
}

/// Map a domain error onto a response. `fallback` is the message for
/// failures that have no caller-facing wording of their own.
fn hub_error_response(err: &HubError, fallback: &str) -> HttpResult {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = match err {
        HubError::NotFound(_) => "Device not found",
        HubError::Unauthorized(_) => "Parameter 'apikey' is required in the request body.",
        HubError::Forbidden => "Invalid API Key.",
        HubError::NotReady(_) => "Device not ready. Wait until status is ready.",
        HubError::Deleted(_) => "Device has been deleted",
        HubError::InvalidMediaFormat(_) => "Invalid media format",
        _ => fallback,
    };
    error_response(status, message, Some(err.to_string()))
}

/// Non-empty string field, trimmed. For identifiers, numbers and URLs.
fn str_field<'a>(body: &'a RequestBody, key: &str) -> Option<&'a str> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// User-authored text, passed through verbatim. Blank counts as missing.
fn text_field<'a>(body: &'a RequestBody, key: &str) -> Option<&'a str> {
    body.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

pub fn check_api_key(body: &RequestBody, expected: &str) -> std::result::Result<(), HubError> {
    match body.get("apikey").and_then(Value::as_str) {
        None | Some("") => Err(HubError::Unauthorized("apikey".into())),
        Some(key) if key == expected => Ok(()),
        Some(_) => Err(HubError::Forbidden),
    }
}

/// API key, then `device_id` presence, then lookup.
async fn authorized_session(
    state: &HttpState,
    body: &RequestBody,
) -> std::result::Result<Arc<Session>, HttpResult> {
    check_api_key(body, &state.api_key).map_err(|e| hub_error_response(&e, "Unauthorized"))?;
    let device_id = str_field(body, "device_id").ok_or_else(|| {
        error_response(
            StatusCode::BAD_REQUEST,
            "Parameter 'device_id' is required in the request body.",
            None,
        )
    })?;
    state.registry.get(device_id).await.ok_or_else(|| {
        hub_error_response(&HubError::NotFound(device_id.to_string()), "Device not found")
    })
}

/// Deleted sessions answer 410 before anything else is looked at.
fn ensure_live(session: &Session) -> std::result::Result<(), HttpResult> {
    if session.is_deleted() {
        return Err(hub_error_response(
            &HubError::Deleted(session.device_id().to_string()),
            "Device has been deleted",
        ));
    }
    Ok(())
}

fn ensure_ready(session: &Session) -> std::result::Result<(), HttpResult> {
    ensure_live(session)?;
    if !session.is_ready() {
        return Err(hub_error_response(
            &HubError::NotReady(session.device_id().to_string()),
            "Device not ready",
        ));
    }
    Ok(())
}

fn missing_params(names: &str) -> HttpResult {
    error_response(
        StatusCode::BAD_REQUEST,
        &format!("Parameters {} are required", names),
        None,
    )
}

fn decode<T: serde::de::DeserializeOwned>(body: &RequestBody) -> std::result::Result<T, HttpResult> {
    serde_json::from_value(Value::Object(body.clone())).map_err(|e| {
        error_response(StatusCode::BAD_REQUEST, "Invalid request parameters", Some(e.to_string()))
    })
}

macro_rules! try_http {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(response) => return response,
        }
    };
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

pub async fn create_device_inner(state: &HttpState, body: RequestBody) -> HttpResult {
    if let Err(e) = check_api_key(&body, &state.api_key) {
        return hub_error_response(&e, "Unauthorized");
    }
    let request: NewDevice = try_http!(decode(&body));

    match state.registry.create(request).await {
        Ok(session) => (
            StatusCode::OK,
            json!({
                "status": "success",
                "message": "Device successfully created",
                "device": session.status(),
            }),
        ),
        Err(e) => hub_error_response(&e, "Failed to create device"),
    }
}

pub async fn list_devices_inner(state: &HttpState) -> HttpResult {
    let devices = state.registry.list().await;
    (
        StatusCode::OK,
        json!({
            "status": "success",
            "total": devices.len(),
            "devices": devices,
        }),
    )
}

pub async fn get_device_inner(state: &HttpState, body: RequestBody) -> HttpResult {
    let session = try_http!(authorized_session(state, &body).await);
    (
        StatusCode::OK,
        json!({ "status": "success", "device": session.status() }),
    )
}

pub async fn update_device_inner(state: &HttpState, body: RequestBody) -> HttpResult {
    let session = try_http!(authorized_session(state, &body).await);
    let update: DeviceConfigUpdate = try_http!(decode(&body));

    match session.update_config(update).await {
        Ok(device) => (
            StatusCode::OK,
            json!({
                "status": "success",
                "message": "Device configuration updated successfully",
                "device": device,
            }),
        ),
        Err(e) => hub_error_response(&e, "Failed to update device"),
    }
}

pub async fn delete_device_inner(state: &HttpState, body: RequestBody) -> HttpResult {
    let session = try_http!(authorized_session(state, &body).await);
    let device_id = session.device_id().to_string();

    match state.registry.delete(&device_id).await {
        Ok(()) => (
            StatusCode::OK,
            json!({
                "status": "success",
                "message": "Device deleted permanently. Client destroyed, session removed, and QR generation stopped.",
                "device_id": device_id,
            }),
        ),
        Err(e) => hub_error_response(&e, "Failed to delete device"),
    }
}

pub async fn qr_inner(state: &HttpState, body: RequestBody) -> HttpResult {
    let session = try_http!(authorized_session(state, &body).await);
    try_http!(ensure_live(&session));

    match session.current_qr() {
        Some(qr) => (
            StatusCode::OK,
            json!({
                "status": "success",
                "qr_code": qr,
                "message": "Scan this QR code in WhatsApp",
            }),
        ),
        None => error_response(
            StatusCode::NOT_FOUND,
            "QR Code not available. Device may already be authenticated.",
            None,
        ),
    }
}

pub async fn send_message_inner(state: &HttpState, body: RequestBody) -> HttpResult {
    let session = try_http!(authorized_session(state, &body).await);
    try_http!(ensure_ready(&session));
    let (Some(number), Some(message)) = (str_field(&body, "number"), text_field(&body, "message"))
    else {
        return missing_params("'number' and 'message'");
    };

    match session.send_message(number, message).await {
        Ok(_) => (
            StatusCode::OK,
            json!({
                "status": "success",
                "message": "Message sent successfully",
                "to": format_target(number),
                "device_id": session.device_id(),
            }),
        ),
        Err(e) => hub_error_response(&e, "Failed to send message"),
    }
}

pub async fn send_image_inner(state: &HttpState, body: RequestBody) -> HttpResult {
    let session = try_http!(authorized_session(state, &body).await);
    try_http!(ensure_ready(&session));
    let (Some(number), Some(image)) = (str_field(&body, "number"), str_field(&body, "image")) else {
        return missing_params("'number' and 'image'");
    };
    let caption = text_field(&body, "caption").map(str::to_string);

    match session.send_image(number, image, caption).await {
        Ok(_) => (
            StatusCode::OK,
            json!({
                "status": "success",
                "message": "Image sent successfully",
                "to": format_target(number),
                "device_id": session.device_id(),
            }),
        ),
        Err(e) => hub_error_response(&e, "Failed to send image"),
    }
}

pub async fn send_document_inner(state: &HttpState, body: RequestBody) -> HttpResult {
    let session = try_http!(authorized_session(state, &body).await);
    try_http!(ensure_ready(&session));
    let (Some(number), Some(document)) = (str_field(&body, "number"), str_field(&body, "document"))
    else {
        return missing_params("'number' and 'document'");
    };
    let filename = str_field(&body, "filename");
    let caption = text_field(&body, "caption").map(str::to_string);

    match session.send_document(number, document, filename, caption).await {
        Ok((_, filename)) => (
            StatusCode::OK,
            json!({
                "status": "success",
                "message": "Document sent successfully",
                "to": format_target(number),
                "device_id": session.device_id(),
                "filename": filename,
            }),
        ),
        Err(e) => hub_error_response(&e, "Failed to send document"),
    }
}

pub async fn logout_inner(state: &HttpState, body: RequestBody) -> HttpResult {
    let session = try_http!(authorized_session(state, &body).await);
    try_http!(ensure_live(&session));

    match session.logout().await {
        Ok(()) => (
            StatusCode::OK,
            json!({
                "status": "success",
                "message": "Logout successful. Waiting for new QR...",
            }),
        ),
        Err(e) => hub_error_response(&e, "Failed to logout"),
    }
}

pub async fn test_webhook_inner(state: &HttpState, body: RequestBody) -> HttpResult {
    let session = try_http!(authorized_session(state, &body).await);
    try_http!(ensure_live(&session));

    match session.send_test_webhook().await {
        Ok(Some((event, delivered))) => {
            let message = if delivered {
                "Test webhook sent successfully"
            } else {
                "Test webhook could not be delivered"
            };
            (
                StatusCode::OK,
                json!({
                    "status": "success",
                    "message": message,
                    "webhook_url": session.config().webhook_url,
                    "delivered": delivered,
                    "test_data": event,
                }),
            )
        }
        Ok(None) => error_response(
            StatusCode::BAD_REQUEST,
            "Webhook not set for this device",
            None,
        ),
        Err(e) => hub_error_response(&e, "Test webhook failed"),
    }
}

pub async fn status_inner(state: &HttpState) -> HttpResult {
    let total = state.registry.count().await;
    let ready = state.registry.ready_count().await;
    let devices = state.registry.list().await;
    (
        StatusCode::OK,
        json!({
            "status": "success",
            "total_devices": total,
            "ready_devices": ready,
            "pending_devices": total.saturating_sub(ready),
            "devices": devices,
        }),
    )
}

/// Inner health: process liveness.
pub fn health_inner(started_at: Instant) -> HttpResult {
    (
        StatusCode::OK,
        json!({
            "status": "healthy",
            "timestamp": Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION"),
            "uptime": started_at.elapsed().as_secs_f64(),
            "memory": { "rss": resident_memory_bytes() },
            "cpus": num_cpus::get(),
        }),
    )
}

/// Resident set size of this process, where the platform reports it.
fn resident_memory_bytes() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
    system.process(pid).map(|process| process.memory())
}

pub async fn legacy_send_message_inner(state: &HttpState, body: RequestBody) -> HttpResult {
    let session = try_http!(authorized_session(state, &body).await);
    try_http!(ensure_ready(&session));
    let (Some(number), Some(message)) = (str_field(&body, "number"), text_field(&body, "message"))
    else {
        return missing_params("'number' and 'message'");
    };

    match session.send_message(number, message).await {
        Ok(_) => (
            StatusCode::OK,
            json!({
                "status": "success",
                "message": "Message sent successfully (Compatibility mode)",
            }),
        ),
        Err(e) => hub_error_response(&e, "Failed to send message"),
    }
}

pub async fn legacy_qr_inner(state: &HttpState, body: RequestBody) -> HttpResult {
    let session = match authorized_session(state, &body).await {
        Ok(session) => session,
        Err((StatusCode::NOT_FOUND, _)) => {
            return error_response(
                StatusCode::NOT_FOUND,
                "Device not found. Create a new device or check /api/devices",
                None,
            )
        }
        Err(response) => return response,
    };

    match session.current_qr() {
        Some(qr) => (
            StatusCode::OK,
            json!({
                "status": "success",
                "qr_code": qr,
                "message": "Scan this QR code in WhatsApp (Compatibility mode)",
            }),
        ),
        None => error_response(
            StatusCode::NOT_FOUND,
            "QR Code not available. Device may already be authenticated.",
            None,
        ),
    }
}

// ============================================================================
// Axum handlers (thin wrappers over inner functions)
// ============================================================================

fn respond((status, body): HttpResult) -> Response {
    (status, Json(body)).into_response()
}

async fn with_body<F, Fut>(raw: &[u8], inner: F) -> Response
where
    F: FnOnce(RequestBody) -> Fut,
    Fut: Future<Output = HttpResult>,
{
    match parse_body(raw) {
        Ok(body) => respond(inner(body).await),
        Err(response) => respond(response),
    }
}

pub async fn create_device_handler(State(state): State<Arc<HttpState>>, body: Bytes) -> Response {
    with_body(&body, |b| create_device_inner(&state, b)).await
}

pub async fn list_devices_handler(State(state): State<Arc<HttpState>>) -> Response {
    respond(list_devices_inner(&state).await)
}

pub async fn get_device_handler(State(state): State<Arc<HttpState>>, body: Bytes) -> Response {
    with_body(&body, |b| get_device_inner(&state, b)).await
}

pub async fn update_device_handler(State(state): State<Arc<HttpState>>, body: Bytes) -> Response {
    with_body(&body, |b| update_device_inner(&state, b)).await
}

pub async fn delete_device_handler(State(state): State<Arc<HttpState>>, body: Bytes) -> Response {
    with_body(&body, |b| delete_device_inner(&state, b)).await
}

pub async fn qr_handler(State(state): State<Arc<HttpState>>, body: Bytes) -> Response {
    with_body(&body, |b| qr_inner(&state, b)).await
}

pub async fn send_message_handler(State(state): State<Arc<HttpState>>, body: Bytes) -> Response {
    with_body(&body, |b| send_message_inner(&state, b)).await
}

pub async fn send_image_handler(State(state): State<Arc<HttpState>>, body: Bytes) -> Response {
    with_body(&body, |b| send_image_inner(&state, b)).await
}

pub async fn send_document_handler(State(state): State<Arc<HttpState>>, body: Bytes) -> Response {
    with_body(&body, |b| send_document_inner(&state, b)).await
}

pub async fn logout_handler(State(state): State<Arc<HttpState>>, body: Bytes) -> Response {
    with_body(&body, |b| logout_inner(&state, b)).await
}

pub async fn test_webhook_handler(State(state): State<Arc<HttpState>>, body: Bytes) -> Response {
    with_body(&body, |b| test_webhook_inner(&state, b)).await
}

pub async fn status_handler(State(state): State<Arc<HttpState>>) -> Response {
    respond(status_inner(&state).await)
}

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> Response {
    respond(health_inner(state.started_at))
}

pub async fn legacy_send_message_handler(
    State(state): State<Arc<HttpState>>,
    body: Bytes,
) -> Response {
    with_body(&body, |b| legacy_send_message_inner(&state, b)).await
}

pub async fn legacy_qr_handler(State(state): State<Arc<HttpState>>, body: Bytes) -> Response {
    with_body(&body, |b| legacy_qr_inner(&state, b)).await
}

pub async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "status": "error",
            "message": "Endpoint not found",
            "available_endpoints": AVAILABLE_ENDPOINTS,
        })),
    )
}

// ============================================================================
// TESTS
// ============================================================================
