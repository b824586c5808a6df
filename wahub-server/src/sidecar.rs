//! Protocol client backed by an external sidecar process over WebSocket.
//!
//! Each client handle opens its own connection on `initialize`, sends an
//! `initialize` command for its device and then:
//! - forwards lifecycle and message frames to its [`EventSink`]
//! - correlates `reply` frames with pending requests by `request_id`
//!
//! An unexpected close is reported as a `disconnected` event so the owning
//! session schedules a reconnect.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wahub_core::config::SidecarConfig;
use wahub_core::models::{ChatState, ClientInfo, ContactInfo, OutboundContent, SentMessage};
use wahub_core::wire::{SidecarCommand, SidecarFrame, SidecarReply};
use wahub_core::{
    Chat, EventSink, ProtocolClient, ProtocolClientFactory, ProtocolError, ProtocolEvent,
};

/// Upper bound on waiting for the sidecar to acknowledge a `destroy`.
const DESTROY_TIMEOUT: Duration = Duration::from_secs(3);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SidecarFactory {
    url: String,
    request_timeout: Duration,
}

impl SidecarFactory {
    pub fn new(config: &SidecarConfig) -> Self {
        Self {
            url: config.url.clone(),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }
}

impl ProtocolClientFactory for SidecarFactory {
    fn create(&self, device_id: &str, session_dir: &Path, events: EventSink) -> Arc<dyn ProtocolClient> {
        Arc::new(SidecarClient {
            inner: Arc::new(Inner {
                device_id: device_id.to_string(),
                session_dir: session_dir.to_path_buf(),
                url: self.url.clone(),
                request_timeout: self.request_timeout,
                events,
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                info: Mutex::new(None),
                closing: AtomicBool::new(false),
            }),
        })
    }
}

struct Inner {
    device_id: String,
    session_dir: PathBuf,
    url: String,
    request_timeout: Duration,
    events: EventSink,
    outbound: Mutex<Option<mpsc::Sender<SidecarCommand>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<SidecarReply>>>,
    info: Mutex<Option<ClientInfo>>,
    closing: AtomicBool,
}

impl Inner {
    fn on_frame(&self, frame: SidecarFrame) {
        let event = match frame {
            SidecarFrame::Reply(reply) => {
                match lock(&self.pending).remove(&reply.request_id) {
                    Some(waiter) => {
                        let _ = waiter.send(reply);
                    }
                    None => debug!(device_id = %self.device_id, request_id = %reply.request_id, "Reply for unknown request"),
                }
                return;
            }
            SidecarFrame::Qr { qr } => ProtocolEvent::Qr(qr),
            SidecarFrame::Authenticated => ProtocolEvent::Authenticated,
            SidecarFrame::Ready { info } => {
                *lock(&self.info) = Some(info);
                ProtocolEvent::Ready
            }
            SidecarFrame::Disconnected { reason } => {
                *lock(&self.info) = None;
                ProtocolEvent::Disconnected { reason }
            }
            SidecarFrame::AuthFailure { message } => ProtocolEvent::AuthFailure(message),
            SidecarFrame::Message { message } => ProtocolEvent::Message(message),
            SidecarFrame::MessageCreate { message } => ProtocolEvent::MessageCreate(message),
        };

        if !self.events.emit(event) {
            debug!(device_id = %self.device_id, "Session no longer listening");
        }
    }

    fn on_closed(&self) {
        *lock(&self.outbound) = None;
        *lock(&self.info) = None;
        // Dropping the waiters fails their requests with `Closed`.
        lock(&self.pending).clear();

        if !self.closing.load(Ordering::SeqCst) {
            warn!(device_id = %self.device_id, "Sidecar connection closed unexpectedly");
            self.events.emit(ProtocolEvent::Disconnected {
                reason: "sidecar connection closed".to_string(),
            });
        }
    }

    async fn request(
        &self,
        build: impl FnOnce(String) -> SidecarCommand,
    ) -> Result<serde_json::Value, ProtocolError> {
        self.request_within(self.request_timeout, build).await
    }

    async fn request_within(
        &self,
        timeout: Duration,
        build: impl FnOnce(String) -> SidecarCommand,
    ) -> Result<serde_json::Value, ProtocolError> {
        let sender = lock(&self.outbound).clone().ok_or(ProtocolError::Closed)?;
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(request_id.clone(), tx);

        if sender.send(build(request_id.clone())).await.is_err() {
            lock(&self.pending).remove(&request_id);
            return Err(ProtocolError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply.into_result().map_err(ProtocolError::Client),
            Ok(Err(_)) => Err(ProtocolError::Closed),
            Err(_) => {
                lock(&self.pending).remove(&request_id);
                Err(ProtocolError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    async fn request_as<T: DeserializeOwned>(
        &self,
        build: impl FnOnce(String) -> SidecarCommand,
    ) -> Result<T, ProtocolError> {
        let value = self.request(build).await?;
        serde_json::from_value(value)
            .map_err(|e| ProtocolError::Client(format!("malformed sidecar reply: {}", e)))
    }

    async fn send_message(
        &self,
        target: &str,
        content: &OutboundContent,
    ) -> Result<SentMessage, ProtocolError> {
        self.request_as(|request_id| SidecarCommand::SendMessage {
            request_id,
            target: target.to_string(),
            content: content.clone(),
        })
        .await
    }
}

pub struct SidecarClient {
    inner: Arc<Inner>,
}

#[async_trait]
impl ProtocolClient for SidecarClient {
    async fn initialize(&self) -> Result<(), ProtocolError> {
        let inner = &self.inner;
        if inner.closing.load(Ordering::SeqCst) {
            return Err(ProtocolError::Closed);
        }

        info!(device_id = %inner.device_id, url = %inner.url, "Connecting to sidecar");
        let (ws_stream, _) = connect_async(inner.url.as_str())
            .await
            .map_err(|e| ProtocolError::Client(format!("failed to connect to sidecar: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<SidecarCommand>(32);

        let reader = Arc::clone(inner);
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SidecarFrame>(&text) {
                        Ok(frame) => reader.on_frame(frame),
                        Err(e) => warn!(device_id = %reader.device_id, error = %e, "Unparseable sidecar frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!(device_id = %reader.device_id, error = %e, "Sidecar read error");
                        break;
                    }
                }
            }
            reader.on_closed();
        });

        let device_id = inner.device_id.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match serde_json::to_string(&cmd) {
                    Ok(json) => {
                        if let Err(e) = write.send(Message::Text(json.into())).await {
                            error!(device_id = %device_id, error = %e, "Failed to write to sidecar");
                            break;
                        }
                    }
                    Err(e) => error!(device_id = %device_id, error = %e, "Failed to encode sidecar command"),
                }
            }
            let _ = write.close().await;
        });

        *lock(&inner.outbound) = Some(tx.clone());
        tx.send(SidecarCommand::Initialize {
            device_id: inner.device_id.clone(),
            session_dir: inner.session_dir.display().to_string(),
        })
        .await
        .map_err(|_| ProtocolError::Closed)
    }

    async fn destroy(&self) -> Result<(), ProtocolError> {
        let inner = &self.inner;
        if inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let timeout = DESTROY_TIMEOUT.min(inner.request_timeout);
        let result = inner
            .request_within(timeout, |request_id| SidecarCommand::Destroy { request_id })
            .await
            .map(|_| ());
        // Dropping the last sender ends the writer task, which closes the socket.
        *lock(&inner.outbound) = None;

        match result {
            Err(ProtocolError::Closed) => Ok(()),
            other => other,
        }
    }

    async fn send_message(
        &self,
        target: &str,
        content: &OutboundContent,
    ) -> Result<SentMessage, ProtocolError> {
        self.inner.send_message(target, content).await
    }

    async fn get_chat_by_id(&self, chat_id: &str) -> Result<Arc<dyn Chat>, ProtocolError> {
        let value = self
            .inner
            .request(|request_id| SidecarCommand::GetChat {
                request_id,
                chat_id: chat_id.to_string(),
            })
            .await
            .map_err(|e| match e {
                ProtocolError::Client(_) => ProtocolError::ChatNotFound(chat_id.to_string()),
                other => other,
            })?;

        let id = value
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or(chat_id)
            .to_string();
        Ok(Arc::new(SidecarChat {
            inner: Arc::clone(&self.inner),
            id,
        }))
    }

    async fn contact_info(&self, address: &str) -> Result<ContactInfo, ProtocolError> {
        self.inner
            .request_as(|request_id| SidecarCommand::ContactInfo {
                request_id,
                address: address.to_string(),
            })
            .await
    }

    fn info(&self) -> Option<ClientInfo> {
        lock(&self.inner.info).clone()
    }
}

struct SidecarChat {
    inner: Arc<Inner>,
    id: String,
}

#[async_trait]
impl Chat for SidecarChat {
    async fn set_state(&self, state: ChatState) -> Result<(), ProtocolError> {
        self.inner
            .request(|request_id| SidecarCommand::ChatState {
                request_id,
                chat_id: self.id.clone(),
                state,
            })
            .await
            .map(|_| ())
    }

    async fn send_message(&self, content: &OutboundContent) -> Result<SentMessage, ProtocolError> {
        self.inner.send_message(&self.id, content).await
    }
}

// ============================================================================
// TESTS
// ============================================================================
