//! Outbound webhook delivery.
//!
//! One POST per event, bounded by the configured timeout. Failures are logged
//! and reported as `false`; they never propagate into session handling.

use std::future::Future;

use reqwest::header::USER_AGENT;
use reqwest::Client;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use wahub_core::config::WebhookConfig;
use wahub_core::models::WebhookEvent;
use wahub_core::HubError;

#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    client: Client,
    user_agent: String,
}

impl WebhookDispatcher {
    pub fn new(config: &WebhookConfig) -> Result<Self, HubError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| HubError::Upstream(format!("failed to build webhook client: {}", e)))?;

        Ok(Self {
            client,
            user_agent: config.user_agent.clone(),
        })
    }

    /// Deliver `event` to `webhook_url`. Returns whether the endpoint
    /// accepted it with a 2xx. A missing or empty URL is a no-op.
    pub async fn dispatch(
        &self,
        device_id: &str,
        device_name: &str,
        webhook_url: Option<&str>,
        event: &WebhookEvent,
    ) -> bool {
        let Some(url) = webhook_url.filter(|u| !u.trim().is_empty()) else {
            debug!(device_id, "No webhook configured, skipping");
            return false;
        };

        let body = event.envelope(device_id, device_name);
        let kind = body.get("type").and_then(Value::as_str).unwrap_or("unknown").to_string();

        match self.post(url, &body).await {
            Ok(status) => {
                info!(device_id, url, kind = %kind, status, "Webhook delivered");
                true
            }
            Err(e) => {
                error!(device_id, url, kind = %kind, error = %e, "Webhook delivery failed");
                false
            }
        }
    }

    /// Fire-and-forget variant for session event handlers. The event is built
    /// on the spawned task; `None` means it no longer needs delivering.
    pub fn spawn_dispatch<F>(
        &self,
        device_id: String,
        device_name: String,
        webhook_url: Option<String>,
        event: F,
    ) -> JoinHandle<bool>
    where
        F: Future<Output = Option<WebhookEvent>> + Send + 'static,
    {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let Some(event) = event.await else {
                debug!(device_id, "Webhook event dropped before delivery");
                return false;
            };
            dispatcher
                .dispatch(&device_id, &device_name, webhook_url.as_deref(), &event)
                .await
        })
    }

    async fn post(&self, url: &str, body: &Value) -> Result<u16, reqwest::Error> {
        let response = self
            .client
            .post(url)
            .header(USER_AGENT, &self.user_agent)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.status().as_u16())
    }
}

// ============================================================================
// TESTS
// ============================================================================
