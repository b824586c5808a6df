//! Per-device session.
//!
//! A [`Session`] owns one protocol client handle at a time and drives it
//! through the lifecycle:
//!
//! ```text
//! uninitialized -> qr_pending -> authenticated -> ready
//!        ^                                          |
//!        |          (reconnect timer)               v
//!   reconnecting <---------------------------- disconnected
//!
//! any state --destroy--> destroyed (terminal)
//! ```
//!
//! Client callbacks are funnelled into a per-session event loop, so a single
//! session processes its events one at a time. Every handle's events carry the
//! generation it was created with; once a handle is replaced or torn down its
//! late events are dropped. After `destroy` nothing re-arms the reconnect
//! timer, exposes a QR code or fires a webhook.

pub mod timer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wahub_core::models::{
    chat_id_from_address, format_target, DeviceConfig, DeviceConfigUpdate, DeviceStatus,
    InboundMessage, LifecycleState, OutboundContent, SentMessage, WebhookEvent,
};
use wahub_core::{
    ConfigStore, EventSink, HubConfig, HubError, ProtocolClient, ProtocolClientFactory,
    ProtocolEvent, LOGOUT_REASON,
};

use crate::subsystems::commands::{self, BotCommand, BotReply, Delivery, DeviceSummary};
use crate::subsystems::media::MediaFetcher;
use crate::subsystems::retry::RetryPolicy;
use crate::subsystems::sender::{PacingPolicy, SendPipeline};
use crate::subsystems::webhook::WebhookDispatcher;

use self::timer::ReconnectTimer;

/// Collaborators shared by every session.
pub struct SessionContext {
    pub store: ConfigStore,
    pub factory: Arc<dyn ProtocolClientFactory>,
    pub webhooks: WebhookDispatcher,
    pub sender: SendPipeline,
    pub media: MediaFetcher,
    /// Wait before re-initialising after an unexpected disconnect.
    pub reconnect_delay: Duration,
    /// Wait before re-initialising after an explicit logout.
    pub reinit_delay: Duration,
}

impl SessionContext {
    pub fn from_config(
        config: &HubConfig,
        factory: Arc<dyn ProtocolClientFactory>,
    ) -> Result<Self, HubError> {
        Ok(Self {
            store: ConfigStore::from_config(&config.storage),
            factory,
            webhooks: WebhookDispatcher::new(&config.webhook)?,
            sender: SendPipeline::new(
                PacingPolicy::from_config(&config.pacing),
                RetryPolicy::from_config(&config.retry),
            ),
            media: MediaFetcher::new(&config.media)?,
            reconnect_delay: Duration::from_millis(config.lifecycle.reconnect_delay_ms),
            reinit_delay: Duration::from_millis(config.lifecycle.reinit_delay_ms),
        })
    }
}

enum SessionMessage {
    Protocol { generation: u64, event: ProtocolEvent },
    Reinitialize,
    InitFailed { generation: u64, error: String },
}

struct SessionState {
    lifecycle: LifecycleState,
    current_qr: Option<String>,
    client: Option<Arc<dyn ProtocolClient>>,
    generation: u64,
    config: DeviceConfig,
}

impl SessionState {
    /// Take the current handle and invalidate its generation so nothing it
    /// emits afterwards is processed.
    fn detach_client(&mut self) -> Option<Arc<dyn ProtocolClient>> {
        self.generation += 1;
        self.client.take()
    }
}

pub struct Session {
    device_id: String,
    ctx: Arc<SessionContext>,
    state: Mutex<SessionState>,
    deleted: Arc<AtomicBool>,
    reconnect: ReconnectTimer,
    config_write: tokio::sync::Mutex<()>,
    events: mpsc::UnboundedSender<SessionMessage>,
    stop: CancellationToken,
}

impl Session {
    /// Create the session, install its first client handle and start its
    /// event loop.
    pub fn start(config: DeviceConfig, ctx: Arc<SessionContext>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            device_id: config.device_id.clone(),
            ctx,
            state: Mutex::new(SessionState {
                lifecycle: LifecycleState::Uninitialized,
                current_qr: None,
                client: None,
                generation: 0,
                config,
            }),
            deleted: Arc::new(AtomicBool::new(false)),
            reconnect: ReconnectTimer::new(),
            config_write: tokio::sync::Mutex::new(()),
            events: tx,
            stop: CancellationToken::new(),
        });

        info!(device_id = %session.device_id, "Starting session");
        session.install_client();
        tokio::spawn(Arc::clone(&session).run(rx));
        session
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.state().lifecycle
    }

    pub fn is_ready(&self) -> bool {
        let st = self.state();
        !self.is_deleted() && st.lifecycle == LifecycleState::Ready && st.client.is_some()
    }

    pub fn config(&self) -> DeviceConfig {
        self.state().config.clone()
    }

    /// Pending QR payload. Never exposed once the session is deleted.
    pub fn current_qr(&self) -> Option<String> {
        if self.is_deleted() {
            return None;
        }
        self.state().current_qr.clone()
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect.is_pending()
    }

    pub fn status(&self) -> DeviceStatus {
        let deleted = self.is_deleted();
        let st = self.state();
        let is_ready = !deleted && st.lifecycle == LifecycleState::Ready && st.client.is_some();
        let info = if is_ready {
            st.client.as_ref().and_then(|c| c.info())
        } else {
            None
        };

        DeviceStatus {
            device_id: self.device_id.clone(),
            device_name: st.config.device_name.clone(),
            state: st.lifecycle,
            is_ready,
            is_deleted: deleted,
            has_qr: !deleted && st.current_qr.is_some(),
            number: info.as_ref().map(|i| i.number.clone()),
            battery: info.and_then(|i| i.battery),
            webhook_url: st.config.webhook_url.clone(),
            config: st.config.clone(),
        }
    }

    // ========================================================================
    // Client handle management
    // ========================================================================

    /// Build a fresh handle and initialise it in the background. Skipped once
    /// the session is deleted; the check runs under the state lock so it
    /// cannot interleave with `destroy` detaching the handle.
    fn install_client(&self) {
        let (client, generation) = {
            let mut st = self.state();
            if self.is_deleted() {
                warn!(device_id = %self.device_id, "Device is deleted, skipping initialization");
                return;
            }

            st.generation += 1;
            let generation = st.generation;
            let tx = self.events.clone();
            let sink = EventSink::new(generation, move |generation, event| {
                tx.send(SessionMessage::Protocol { generation, event }).is_ok()
            });
            let session_dir = self.ctx.store.session_dir(&self.device_id);
            let client = self.ctx.factory.create(&self.device_id, &session_dir, sink);

            st.client = Some(Arc::clone(&client));
            st.lifecycle = LifecycleState::Uninitialized;
            st.current_qr = None;
            (client, generation)
        };

        debug!(device_id = %self.device_id, generation, "Initializing client");
        let tx = self.events.clone();
        let device_id = self.device_id.clone();
        tokio::spawn(async move {
            if let Err(e) = client.initialize().await {
                error!(device_id = %device_id, generation, error = %e, "Client initialization failed");
                let _ = tx.send(SessionMessage::InitFailed {
                    generation,
                    error: e.to_string(),
                });
            }
        });
    }

    fn schedule_reinit(&self, delay: Duration) {
        if self.is_deleted() {
            info!(device_id = %self.device_id, "Device deleted, not reconnecting");
            return;
        }

        let tx = self.events.clone();
        let armed = self.reconnect.arm(delay, move || {
            let _ = tx.send(SessionMessage::Reinitialize);
        });
        if armed {
            let mut st = self.state();
            if !st.lifecycle.is_terminal() {
                st.lifecycle = LifecycleState::Reconnecting;
            }
            info!(device_id = %self.device_id, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        }
    }

    async fn teardown(&self, client: Arc<dyn ProtocolClient>) {
        match client.destroy().await {
            Ok(()) => info!(device_id = %self.device_id, "Client destroyed"),
            Err(e) => warn!(device_id = %self.device_id, error = %e, "Error destroying client"),
        }
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<SessionMessage>) {
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
            }
        }
        debug!(device_id = %self.device_id, "Session event loop stopped");
    }

    async fn handle(&self, msg: SessionMessage) {
        if self.is_deleted() {
            return;
        }

        match msg {
            SessionMessage::Protocol { generation, event } => {
                let current = self.state().generation;
                if generation != current {
                    debug!(
                        device_id = %self.device_id,
                        generation,
                        current,
                        event = event.name(),
                        "Dropping event from stale client"
                    );
                    return;
                }
                self.on_protocol_event(event).await;
            }
            SessionMessage::Reinitialize => {
                info!(device_id = %self.device_id, "Re-initializing client");
                let previous = self.state().detach_client();
                if let Some(client) = previous {
                    self.teardown(client).await;
                }
                self.install_client();
            }
            SessionMessage::InitFailed { generation, error } => {
                let client = {
                    let mut st = self.state();
                    if st.generation != generation {
                        return;
                    }
                    st.lifecycle = LifecycleState::Disconnected;
                    st.detach_client()
                };
                warn!(device_id = %self.device_id, error = %error, "Client failed to start");
                if let Some(client) = client {
                    self.teardown(client).await;
                }
                self.schedule_reinit(self.ctx.reconnect_delay);
            }
        }
    }

    async fn on_protocol_event(&self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Qr(qr) => {
                info!(device_id = %self.device_id, "QR code received, waiting for scan");
                let mut st = self.state();
                st.current_qr = Some(qr);
                st.lifecycle = LifecycleState::QrPending;
            }
            ProtocolEvent::Authenticated => {
                info!(device_id = %self.device_id, "Authentication successful");
                let mut st = self.state();
                st.current_qr = None;
                st.lifecycle = LifecycleState::Authenticated;
            }
            ProtocolEvent::Ready => {
                let number = {
                    let mut st = self.state();
                    st.current_qr = None;
                    st.lifecycle = LifecycleState::Ready;
                    st.client.as_ref().and_then(|c| c.info()).map(|i| i.number)
                };
                info!(device_id = %self.device_id, number = ?number, "Client is ready");
            }
            ProtocolEvent::AuthFailure(message) => {
                error!(device_id = %self.device_id, message = %message, "Authentication failed");
                let mut st = self.state();
                st.current_qr = None;
                st.lifecycle = LifecycleState::Uninitialized;
            }
            ProtocolEvent::Disconnected { reason } => self.on_disconnected(reason).await,
            ProtocolEvent::Message(msg) => self.on_incoming(msg),
            ProtocolEvent::MessageCreate(msg) => self.on_outgoing(msg),
        }
    }

    async fn on_disconnected(&self, reason: String) {
        warn!(device_id = %self.device_id, reason = %reason, "Client disconnected");
        let client = {
            let mut st = self.state();
            st.lifecycle = LifecycleState::Disconnected;
            st.current_qr = None;
            st.detach_client()
        };
        if let Some(client) = client {
            self.teardown(client).await;
        }

        if reason == LOGOUT_REASON {
            match self.ctx.store.delete_session_artifacts(&self.device_id).await {
                Ok(_) => info!(device_id = %self.device_id, "Session removed after logout from phone"),
                Err(e) => error!(device_id = %self.device_id, error = %e, "Failed to remove session"),
            }
        }

        self.schedule_reinit(self.ctx.reconnect_delay);
    }

    fn summary(&self) -> (DeviceConfig, Option<Arc<dyn ProtocolClient>>, DeviceSummary) {
        let st = self.state();
        let info = st.client.as_ref().and_then(|c| c.info());
        let summary = DeviceSummary {
            device_id: self.device_id.clone(),
            device_name: st.config.device_name.clone(),
            number: info.as_ref().map(|i| i.number.clone()),
            battery: info.and_then(|i| i.battery),
            webhook_active: st.config.webhook_url.is_some(),
        };
        (st.config.clone(), st.client.clone(), summary)
    }

    fn on_incoming(&self, msg: InboundMessage) {
        if msg.is_status {
            return;
        }
        info!(device_id = %self.device_id, from = %msg.from, "Message received");

        let (config, client, summary) = self.summary();
        let Some(client) = client else {
            return;
        };

        if config.webhook_url.is_some() {
            let deleted = Arc::clone(&self.deleted);
            let client = Arc::clone(&client);
            let msg = msg.clone();
            self.ctx.webhooks.spawn_dispatch(
                config.device_id.clone(),
                config.device_name.clone(),
                config.webhook_url.clone(),
                async move {
                    let (name, picture) = resolve_sender(client.as_ref(), &msg).await;
                    (!deleted.load(Ordering::SeqCst))
                        .then(|| WebhookEvent::incoming(&msg, &name, &picture))
                },
            );
        }

        if let Some(reply) = commands::auto_reply_for(config.auto_reply, &msg.body, &summary) {
            self.spawn_reply(Arc::clone(&client), msg.from.clone(), reply);
        }
        if let Some(command) = BotCommand::parse(&msg.body) {
            debug!(device_id = %self.device_id, command = ?command, "Bot command received");
            self.spawn_reply(client, msg.from.clone(), commands::reply_for(command, &summary));
        }
    }

    fn on_outgoing(&self, msg: InboundMessage) {
        if !msg.from_me {
            return;
        }
        let (config, client, _) = self.summary();
        if config.webhook_url.is_none() {
            return;
        }
        let Some(client) = client else {
            return;
        };

        let deleted = Arc::clone(&self.deleted);
        self.ctx.webhooks.spawn_dispatch(
            config.device_id,
            config.device_name,
            config.webhook_url,
            async move {
                let mut name = chat_id_from_address(&msg.to).to_string();
                if let Ok(contact) = client.contact_info(&msg.to).await {
                    if let Some(display) = contact.display_name() {
                        name = display.to_string();
                    }
                }
                (!deleted.load(Ordering::SeqCst)).then(|| WebhookEvent::outgoing(&msg, &name))
            },
        );
    }

    fn spawn_reply(&self, client: Arc<dyn ProtocolClient>, to: String, reply: BotReply) {
        let ctx = Arc::clone(&self.ctx);
        let device_id = self.device_id.clone();
        tokio::spawn(async move {
            let result = match reply.delivery {
                Delivery::Paced => ctx
                    .sender
                    .send_text(&device_id, client.as_ref(), &to, &reply.text)
                    .await
                    .map(|_| ()),
                Delivery::Direct => client
                    .send_message(&format_target(&to), &OutboundContent::text(reply.text))
                    .await
                    .map(|_| ())
                    .map_err(HubError::from),
            };
            if let Err(e) = result {
                error!(device_id = %device_id, to = %to, error = %e, "Failed to send bot reply");
            }
        });
    }

    // ========================================================================
    // Operations
    // ========================================================================

    fn ready_client(&self) -> Result<Arc<dyn ProtocolClient>, HubError> {
        if self.is_deleted() {
            return Err(HubError::Deleted(self.device_id.clone()));
        }
        let st = self.state();
        match (&st.client, st.lifecycle) {
            (Some(client), LifecycleState::Ready) => Ok(Arc::clone(client)),
            _ => Err(HubError::NotReady(self.device_id.clone())),
        }
    }

    pub async fn send_message(&self, target: &str, content: &str) -> Result<SentMessage, HubError> {
        let client = self.ready_client()?;
        self.ctx
            .sender
            .send_text(&self.device_id, client.as_ref(), target, content)
            .await
    }

    pub async fn send_image(
        &self,
        target: &str,
        image: &str,
        caption: Option<String>,
    ) -> Result<SentMessage, HubError> {
        let client = self.ready_client()?;
        let media = self.ctx.media.prepare_image(image).await?;
        self.ctx
            .sender
            .send_media(&self.device_id, client.as_ref(), target, media, caption, false)
            .await
    }

    /// Returns the sent message and the file name it went out with.
    pub async fn send_document(
        &self,
        target: &str,
        document: &str,
        filename: Option<&str>,
        caption: Option<String>,
    ) -> Result<(SentMessage, String), HubError> {
        let client = self.ready_client()?;
        let media = self.ctx.media.prepare_document(document, filename).await?;
        let name = media.filename.clone();
        let sent = self
            .ctx
            .sender
            .send_media(&self.device_id, client.as_ref(), target, media, caption, true)
            .await?;
        Ok((sent, name))
    }

    /// Unlink the account: tear down the handle, wipe its session artifacts
    /// and start over with a fresh handle after the re-init delay.
    pub async fn logout(&self) -> Result<(), HubError> {
        if self.is_deleted() {
            return Err(HubError::Deleted(self.device_id.clone()));
        }
        info!(device_id = %self.device_id, "Logging out");

        self.reconnect.cancel();
        let client = {
            let mut st = self.state();
            st.lifecycle = LifecycleState::Disconnected;
            st.current_qr = None;
            st.detach_client()
        };
        if let Some(client) = client {
            self.teardown(client).await;
        }

        let wiped = self.ctx.store.delete_session_artifacts(&self.device_id).await;
        self.schedule_reinit(self.ctx.reinit_delay);
        match wiped {
            Ok(_) => {
                info!(device_id = %self.device_id, "Session artifacts deleted");
                Ok(())
            }
            Err(e) => {
                error!(device_id = %self.device_id, error = %e, "Failed to delete session artifacts");
                Err(e)
            }
        }
    }

    /// Permanent teardown. Idempotent: later calls return `Ok` and do nothing.
    /// Client teardown errors are logged; file removal errors are returned
    /// after every step has run.
    pub async fn destroy(&self) -> Result<(), HubError> {
        if self.deleted.swap(true, Ordering::SeqCst) {
            debug!(device_id = %self.device_id, "Already destroyed");
            return Ok(());
        }
        info!(device_id = %self.device_id, "Destroying device permanently");

        self.reconnect.close();
        self.stop.cancel();
        let client = {
            let mut st = self.state();
            st.lifecycle = LifecycleState::Destroyed;
            st.current_qr = None;
            st.detach_client()
        };
        if let Some(client) = client {
            self.teardown(client).await;
        }

        let mut result = Ok(());
        match self.ctx.store.delete_session_artifacts(&self.device_id).await {
            Ok(_) => info!(device_id = %self.device_id, "Session folder deleted"),
            Err(e) => {
                error!(device_id = %self.device_id, error = %e, "Failed to delete session folder");
                result = Err(e);
            }
        }
        match self.ctx.store.delete(&self.device_id).await {
            Ok(true) => info!(device_id = %self.device_id, "Config file deleted"),
            Ok(false) => {}
            Err(e) => {
                error!(device_id = %self.device_id, error = %e, "Failed to delete config file");
                result = Err(e);
            }
        }

        info!(device_id = %self.device_id, "Device destroyed permanently");
        result
    }

    /// Process shutdown: stop the loop and the timer and release the handle,
    /// keeping every file so the device restores on the next start.
    pub async fn shutdown(&self) {
        self.reconnect.close();
        self.stop.cancel();
        let client = self.state().detach_client();
        if let Some(client) = client {
            self.teardown(client).await;
        }
    }

    /// Merge `update` into the config and persist it.
    pub async fn update_config(&self, update: DeviceConfigUpdate) -> Result<DeviceStatus, HubError> {
        if self.is_deleted() {
            return Err(HubError::Deleted(self.device_id.clone()));
        }

        let _guard = self.config_write.lock().await;
        let mut snapshot = {
            let mut st = self.state();
            st.config.apply(update);
            st.config.clone()
        };
        self.ctx.store.save(&mut snapshot).await?;
        {
            let mut st = self.state();
            st.config.version = snapshot.version;
            st.config.last_updated = snapshot.last_updated;
        }

        info!(device_id = %self.device_id, "Configuration updated");
        Ok(self.status())
    }

    /// Send the synthetic test event to the configured webhook. `None` when
    /// no webhook is set.
    pub async fn send_test_webhook(&self) -> Result<Option<(WebhookEvent, bool)>, HubError> {
        if self.is_deleted() {
            return Err(HubError::Deleted(self.device_id.clone()));
        }
        let config = self.config();
        let Some(url) = config.webhook_url.as_deref() else {
            return Ok(None);
        };

        let event = WebhookEvent::test(&config.device_name);
        let delivered = self
            .ctx
            .webhooks
            .dispatch(&self.device_id, &config.device_name, Some(url), &event)
            .await;
        Ok(Some((event, delivered)))
    }
}

/// Display name and profile picture for an inbound message's sender.
/// Contact lookup failures fall back to the notify name or the bare number.
async fn resolve_sender(client: &dyn ProtocolClient, msg: &InboundMessage) -> (String, String) {
    let mut name = msg
        .notify_name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| chat_id_from_address(&msg.from).to_string());
    let mut picture = String::new();

    match client.contact_info(&msg.from).await {
        Ok(contact) => {
            if let Some(display) = contact.display_name() {
                name = display.to_string();
            }
            picture = contact.profile_picture_url.unwrap_or_default();
        }
        Err(e) => debug!(from = %msg.from, error = %e, "Contact lookup failed, using fallback"),
    }
    (name, picture)
}
