//! Outbound send pipeline.
//!
//! Text sends are normalised, paced like a human typist and retried with
//! backoff. Media sends get a fixed delay and a single attempt.
//!
//! Typing delay: min(len × per_char + U[min_base, max_base), cap)

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info, warn};
use wahub_core::config::PacingConfig;
use wahub_core::models::{format_target, ChatState, MediaPayload, OutboundContent, SentMessage};
use wahub_core::{Chat, HubError, ProtocolClient, ProtocolError};

use super::retry::{retry_with_backoff, RetryPolicy};

#[derive(Debug, Clone)]
pub struct PacingPolicy {
    pub simulate_typing: bool,
    pub per_char: Duration,
    pub min_base: Duration,
    pub max_base: Duration,
    pub cap: Duration,
    pub media_delay: Duration,
}

impl PacingPolicy {
    pub fn from_config(config: &PacingConfig) -> Self {
        Self {
            simulate_typing: config.simulate_typing,
            per_char: Duration::from_millis(config.per_char_ms),
            min_base: Duration::from_millis(config.min_base_ms),
            max_base: Duration::from_millis(config.max_base_ms),
            cap: Duration::from_millis(config.cap_ms),
            media_delay: Duration::from_millis(config.media_delay_ms),
        }
    }

    /// No delays at all. Used by tests and by deployments that opt out.
    pub fn immediate() -> Self {
        Self {
            simulate_typing: false,
            per_char: Duration::ZERO,
            min_base: Duration::ZERO,
            max_base: Duration::ZERO,
            cap: Duration::ZERO,
            media_delay: Duration::ZERO,
        }
    }

    pub fn typing_delay<R: Rng + ?Sized>(&self, content: &str, rng: &mut R) -> Duration {
        let chars = content.chars().count() as u32;
        let typing = self.per_char.saturating_mul(chars);
        let base = if self.max_base > self.min_base {
            rng.gen_range(self.min_base..self.max_base)
        } else {
            self.min_base
        };
        typing.saturating_add(base).min(self.cap)
    }
}

/// Drop control characters. Newlines and tabs are text layout, so they stay.
pub fn sanitize_content(content: &str) -> String {
    content
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Clears a chat's composing indicator when the send finishes or is dropped
/// part way through.
struct ComposingGuard {
    device_id: String,
    chat: Option<Arc<dyn Chat>>,
}

impl ComposingGuard {
    fn new(device_id: &str, chat: Arc<dyn Chat>) -> Self {
        Self {
            device_id: device_id.to_string(),
            chat: Some(chat),
        }
    }

    async fn clear(mut self) {
        if let Some(chat) = self.chat.take() {
            clear_indicator(&self.device_id, chat.as_ref()).await;
        }
    }
}

impl Drop for ComposingGuard {
    fn drop(&mut self) {
        let Some(chat) = self.chat.take() else {
            return;
        };
        let device_id = std::mem::take(&mut self.device_id);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            debug!(device_id = %device_id, "Send interrupted, clearing composing indicator");
            runtime.spawn(async move {
                clear_indicator(&device_id, chat.as_ref()).await;
            });
        }
    }
}

async fn clear_indicator(device_id: &str, chat: &dyn Chat) {
    if let Err(e) = chat.set_state(ChatState::Cleared).await {
        debug!(device_id, error = %e, "Could not clear composing indicator");
    }
}

#[derive(Debug, Clone)]
pub struct SendPipeline {
    pacing: PacingPolicy,
    retry: RetryPolicy,
}

impl SendPipeline {
    pub fn new(pacing: PacingPolicy, retry: RetryPolicy) -> Self {
        Self { pacing, retry }
    }

    /// Send a text message through `client`, retrying per policy.
    pub async fn send_text(
        &self,
        device_id: &str,
        client: &dyn ProtocolClient,
        target: &str,
        content: &str,
    ) -> Result<SentMessage, HubError> {
        let formatted = format_target(target);
        let clean = sanitize_content(content);
        let (target, body) = (formatted.as_str(), clean.as_str());
        let mut last_attempt = 0;

        let result = retry_with_backoff(&self.retry, |attempt| {
            last_attempt = attempt;
            async move {
                debug!(device_id, to = %target, attempt, "Sending text message");
                let sent = self.attempt_text(device_id, client, target, body).await;
                if let Err(e) = &sent {
                    warn!(device_id, to = %target, attempt, error = %e, "Send attempt failed");
                }
                sent
            }
        })
        .await;

        match result {
            Ok(sent) => {
                info!(device_id, to = %target, message_id = %sent.id, attempts = last_attempt, "Message sent");
                Ok(sent)
            }
            Err(e) => {
                error!(device_id, to = %target, attempts = last_attempt, error = %e, "Message send failed");
                Err(e.into())
            }
        }
    }

    async fn attempt_text(
        &self,
        device_id: &str,
        client: &dyn ProtocolClient,
        target: &str,
        body: &str,
    ) -> Result<SentMessage, ProtocolError> {
        let content = OutboundContent::text(body);
        let delay = self.pacing.typing_delay(body, &mut rand::thread_rng());

        if !self.pacing.simulate_typing {
            tokio::time::sleep(delay).await;
            return client.send_message(target, &content).await;
        }

        let chat = match client.get_chat_by_id(target).await {
            Ok(chat) => chat,
            Err(e) => {
                warn!(device_id, to = %target, error = %e, "Chat lookup failed, sending directly");
                tokio::time::sleep(delay).await;
                return client.send_message(target, &content).await;
            }
        };

        // Armed before the indicator goes up so a dropped send still clears it.
        let composing = ComposingGuard::new(device_id, Arc::clone(&chat));
        if let Err(e) = chat.set_state(ChatState::Composing).await {
            warn!(device_id, to = %target, error = %e, "Could not show composing indicator");
        }

        debug!(device_id, delay_ms = delay.as_millis() as u64, "Simulating typing");
        tokio::time::sleep(delay).await;
        let sent = chat.send_message(&content).await;

        composing.clear().await;
        sent
    }

    /// Send an image or document. No typing simulation and no retry.
    pub async fn send_media(
        &self,
        device_id: &str,
        client: &dyn ProtocolClient,
        target: &str,
        media: MediaPayload,
        caption: Option<String>,
        as_document: bool,
    ) -> Result<SentMessage, HubError> {
        let target = format_target(target);
        let filename = media.filename.clone();
        let content = OutboundContent::Media {
            media,
            caption: caption.filter(|c| !c.is_empty()),
            as_document,
        };

        tokio::time::sleep(self.pacing.media_delay).await;
        match client.send_message(&target, &content).await {
            Ok(sent) => {
                info!(device_id, to = %target, filename = %filename, as_document, "Media sent");
                Ok(sent)
            }
            Err(e) => {
                error!(device_id, to = %target, filename = %filename, error = %e, "Media send failed");
                Err(e.into())
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
