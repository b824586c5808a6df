//! Scripted in-memory protocol client for tests.
//!
//! [`FakeFactory`] hands out [`FakeClient`]s, remembers every handle it built
//! per device and lets a test push lifecycle events through the newest one.
//! Each client records the calls made on it and can be told to fail.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::models::{ChatState, ClientInfo, ContactInfo, OutboundContent, SentMessage};
use crate::protocol::{
    Chat, EventSink, ProtocolClient, ProtocolClientFactory, ProtocolError, ProtocolEvent,
};

#[derive(Default)]
struct FakeState {
    calls: Mutex<Vec<String>>,
    sent: Mutex<Vec<(String, OutboundContent)>>,
    send_script: Mutex<VecDeque<Result<SentMessage, ProtocolError>>>,
    info: Mutex<Option<ClientInfo>>,
    contact: Mutex<Option<ContactInfo>>,
    fail_chat_lookup: AtomicBool,
    fail_chat_state: AtomicBool,
    fail_destroy: AtomicBool,
    fail_initialize: AtomicBool,
}

impl FakeState {
    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn next_send(&self, target: &str, content: &OutboundContent) -> Result<SentMessage, ProtocolError> {
        self.record(format!("send:{}", target));
        let scripted = self.send_script.lock().ok().and_then(|mut s| s.pop_front());
        let result = scripted.unwrap_or_else(|| {
            Ok(SentMessage {
                id: format!("true_{}_FAKE", target),
                to: target.to_string(),
                timestamp: 0,
                ack: Some(1),
            })
        });
        if result.is_ok() {
            if let Ok(mut sent) = self.sent.lock() {
                sent.push((target.to_string(), content.clone()));
            }
        }
        result
    }
}

pub struct FakeClient {
    device_id: String,
    session_dir: PathBuf,
    sink: EventSink,
    state: Arc<FakeState>,
}

impl FakeClient {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn generation(&self) -> u64 {
        self.sink.generation()
    }

    /// Push an event as if the underlying client fired it.
    pub fn emit(&self, event: ProtocolEvent) -> bool {
        self.sink.emit(event)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Successful sends, in order.
    pub fn sent(&self) -> Vec<(String, OutboundContent)> {
        self.state.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Queue results for upcoming sends; once drained, sends succeed.
    pub fn script_sends<I>(&self, results: I)
    where
        I: IntoIterator<Item = Result<SentMessage, ProtocolError>>,
    {
        if let Ok(mut script) = self.state.send_script.lock() {
            script.extend(results);
        }
    }

    pub fn set_info(&self, info: Option<ClientInfo>) {
        if let Ok(mut slot) = self.state.info.lock() {
            *slot = info;
        }
    }

    pub fn set_contact(&self, contact: ContactInfo) {
        if let Ok(mut slot) = self.state.contact.lock() {
            *slot = Some(contact);
        }
    }

    pub fn fail_chat_lookup(&self, fail: bool) {
        self.state.fail_chat_lookup.store(fail, Ordering::SeqCst);
    }

    pub fn fail_chat_state(&self, fail: bool) {
        self.state.fail_chat_state.store(fail, Ordering::SeqCst);
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.state.fail_destroy.store(fail, Ordering::SeqCst);
    }

    pub fn fail_initialize(&self, fail: bool) {
        self.state.fail_initialize.store(fail, Ordering::SeqCst);
    }
}

struct FakeChat {
    id: String,
    state: Arc<FakeState>,
}

#[async_trait]
impl Chat for FakeChat {
    async fn set_state(&self, state: ChatState) -> Result<(), ProtocolError> {
        let label = match state {
            ChatState::Composing => "composing",
            ChatState::Cleared => "cleared",
        };
        self.state.record(format!("chat_state:{}:{}", self.id, label));
        if self.state.fail_chat_state.load(Ordering::SeqCst) {
            return Err(ProtocolError::Client("presence unavailable".into()));
        }
        Ok(())
    }

    async fn send_message(&self, content: &OutboundContent) -> Result<SentMessage, ProtocolError> {
        self.state.next_send(&self.id, content)
    }
}

#[async_trait]
impl ProtocolClient for FakeClient {
    async fn initialize(&self) -> Result<(), ProtocolError> {
        self.state.record("initialize".to_string());
        if self.state.fail_initialize.load(Ordering::SeqCst) {
            return Err(ProtocolError::Client("browser failed to launch".into()));
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), ProtocolError> {
        self.state.record("destroy".to_string());
        if self.state.fail_destroy.load(Ordering::SeqCst) {
            return Err(ProtocolError::Client("target closed".into()));
        }
        Ok(())
    }

    async fn send_message(
        &self,
        target: &str,
        content: &OutboundContent,
    ) -> Result<SentMessage, ProtocolError> {
        self.state.next_send(target, content)
    }

    async fn get_chat_by_id(&self, chat_id: &str) -> Result<Arc<dyn Chat>, ProtocolError> {
        self.state.record(format!("get_chat:{}", chat_id));
        if self.state.fail_chat_lookup.load(Ordering::SeqCst) {
            return Err(ProtocolError::ChatNotFound(chat_id.to_string()));
        }
        Ok(Arc::new(FakeChat {
            id: chat_id.to_string(),
            state: Arc::clone(&self.state),
        }))
    }

    async fn contact_info(&self, address: &str) -> Result<ContactInfo, ProtocolError> {
        self.state.record(format!("contact:{}", address));
        let contact = self.state.contact.lock().ok().and_then(|c| c.clone());
        contact.ok_or_else(|| ProtocolError::Client("contact unavailable".into()))
    }

    fn info(&self) -> Option<ClientInfo> {
        self.state.info.lock().ok().and_then(|i| i.clone())
    }
}

/// Factory that keeps every handle it creates, keyed by device.
#[derive(Default)]
pub struct FakeFactory {
    clients: Mutex<HashMap<String, Vec<Arc<FakeClient>>>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Most recently created handle for the device.
    pub fn latest(&self, device_id: &str) -> Option<Arc<FakeClient>> {
        self.clients
            .lock()
            .ok()
            .and_then(|c| c.get(device_id).and_then(|v| v.last().cloned()))
    }

    pub fn all(&self, device_id: &str) -> Vec<Arc<FakeClient>> {
        self.clients
            .lock()
            .ok()
            .and_then(|c| c.get(device_id).cloned())
            .unwrap_or_default()
    }

    pub fn created(&self, device_id: &str) -> usize {
        self.all(device_id).len()
    }

    /// Emit through the newest handle. `false` if there is none or the
    /// session stopped listening.
    pub fn emit(&self, device_id: &str, event: ProtocolEvent) -> bool {
        match self.latest(device_id) {
            Some(client) => client.emit(event),
            None => false,
        }
    }
}

impl ProtocolClientFactory for FakeFactory {
    fn create(
        &self,
        device_id: &str,
        session_dir: &Path,
        events: EventSink,
    ) -> Arc<dyn ProtocolClient> {
        let client = Arc::new(FakeClient {
            device_id: device_id.to_string(),
            session_dir: session_dir.to_path_buf(),
            sink: events,
            state: Arc::new(FakeState::default()),
        });
        if let Ok(mut clients) = self.clients.lock() {
            clients
                .entry(device_id.to_string())
                .or_default()
                .push(Arc::clone(&client));
        }
        client
    }
}

/// Poll `condition` until it holds, yielding to other tasks between checks.
/// Panics after `limit` of (possibly paused) tokio time.
pub async fn wait_until<F>(limit: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", limit);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
