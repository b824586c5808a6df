//! Contract with the underlying messaging-protocol client.
//!
//! The client itself (browser automation, wire protocol) is a black box. A
//! session owns exactly one [`ProtocolClient`] at a time, obtained from a
//! [`ProtocolClientFactory`], and receives the client's lifecycle callbacks as
//! [`ProtocolEvent`] values pushed through an [`EventSink`].

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{ChatState, ClientInfo, ContactInfo, InboundMessage, OutboundContent, SentMessage};

/// Disconnect reason reported when the user logged the device out from the phone.
pub const LOGOUT_REASON: &str = "LOGOUT";

#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    Qr(String),
    Authenticated,
    Ready,
    Disconnected { reason: String },
    AuthFailure(String),
    /// Inbound message from another party (`message`).
    Message(InboundMessage),
    /// Any message created on this account, including our own sends (`message_create`).
    MessageCreate(InboundMessage),
}

impl ProtocolEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolEvent::Qr(_) => "qr",
            ProtocolEvent::Authenticated => "authenticated",
            ProtocolEvent::Ready => "ready",
            ProtocolEvent::Disconnected { .. } => "disconnected",
            ProtocolEvent::AuthFailure(_) => "auth_failure",
            ProtocolEvent::Message(_) => "message",
            ProtocolEvent::MessageCreate(_) => "message_create",
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("protocol client error: {0}")]
    Client(String),

    #[error("protocol client timed out after {0} ms")]
    Timeout(u64),

    #[error("protocol client connection closed")]
    Closed,

    #[error("chat not found: {0}")]
    ChatNotFound(String),
}

/// Delivers events from one protocol handle to its owning session. Each
/// handle gets a sink stamped with its generation so the session can drop
/// events from handles it already replaced.
#[derive(Clone)]
pub struct EventSink {
    generation: u64,
    deliver: Arc<dyn Fn(u64, ProtocolEvent) -> bool + Send + Sync>,
}

impl EventSink {
    pub fn new<F>(generation: u64, deliver: F) -> Self
    where
        F: Fn(u64, ProtocolEvent) -> bool + Send + Sync + 'static,
    {
        Self {
            generation,
            deliver: Arc::new(deliver),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the owning session has stopped listening.
    pub fn emit(&self, event: ProtocolEvent) -> bool {
        (self.deliver)(self.generation, event)
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("generation", &self.generation)
            .finish()
    }
}

/// One conversation as seen by the protocol client.
#[async_trait]
pub trait Chat: Send + Sync {
    /// Show the "composing" indicator to the other party.
    async fn set_state(&self, state: ChatState) -> Result<(), ProtocolError>;

    async fn send_message(&self, content: &OutboundContent) -> Result<SentMessage, ProtocolError>;
}

#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Start the client. Lifecycle events arrive through the handle's sink.
    async fn initialize(&self) -> Result<(), ProtocolError>;

    /// Tear the client down. Must be safe to call more than once.
    async fn destroy(&self) -> Result<(), ProtocolError>;

    async fn send_message(
        &self,
        target: &str,
        content: &OutboundContent,
    ) -> Result<SentMessage, ProtocolError>;

    async fn get_chat_by_id(&self, chat_id: &str) -> Result<Arc<dyn Chat>, ProtocolError>;

    /// Best-effort contact lookup used to enrich webhook payloads.
    async fn contact_info(&self, _address: &str) -> Result<ContactInfo, ProtocolError> {
        Ok(ContactInfo::default())
    }

    /// Account identity, `None` until the client is ready.
    fn info(&self) -> Option<ClientInfo>;
}

pub trait ProtocolClientFactory: Send + Sync {
    /// Build a fresh, not yet initialised handle for `device_id`. Session
    /// artifacts owned by the client live under `session_dir`.
    fn create(&self, device_id: &str, session_dir: &Path, events: EventSink)
        -> Arc<dyn ProtocolClient>;
}
