//! Webhook event payloads.
//!
//! Every POST carries `{device_id, device_name, type, data}`; the `type`/`data`
//! pair comes from [`WebhookEvent`].

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use super::message::{chat_id_from_address, InboundMessage};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LocationAttached {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IncomingChat {
    pub chat_id: String,
    pub message_id: String,
    pub name: String,
    pub profile_picture: String,
    pub timestamp: i64,
    pub message_body: String,
    pub message_ack: Value,
    pub has_media: bool,
    pub media_mime: String,
    pub media_name: String,
    pub location_attached: LocationAttached,
    pub is_forwarding: bool,
    pub is_from_me: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutgoingChat {
    pub chat_id: String,
    pub message_id: String,
    pub name: String,
    pub timestamp: i64,
    pub message_body: String,
    pub message_ack: Value,
    pub is_from_me: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WebhookEvent {
    IncomingChat(IncomingChat),
    OutgoingChat(OutgoingChat),
    TestWebhook(IncomingChat),
}

/// Protocol ack codes; zero or missing is reported as `"PENDING"`.
fn ack_value(ack: Option<i32>) -> Value {
    match ack {
        Some(code) if code != 0 => Value::from(code),
        _ => Value::from("PENDING"),
    }
}

impl WebhookEvent {
    pub fn incoming(msg: &InboundMessage, name: &str, profile_picture: &str) -> Self {
        let (media_mime, media_name) = if msg.has_media && msg.kind != "chat" {
            (msg.kind.clone(), msg.kind.clone())
        } else {
            (String::new(), String::new())
        };

        let location_attached = LocationAttached {
            lat: msg.location.map(|l| l.latitude),
            lng: msg.location.map(|l| l.longitude),
        };

        WebhookEvent::IncomingChat(IncomingChat {
            chat_id: chat_id_from_address(&msg.from).to_string(),
            message_id: msg.id.clone(),
            name: name.to_string(),
            profile_picture: profile_picture.to_string(),
            timestamp: msg.timestamp,
            message_body: msg.body.clone(),
            message_ack: ack_value(msg.ack),
            has_media: msg.has_media,
            media_mime,
            media_name,
            location_attached,
            is_forwarding: msg.is_forwarded,
            is_from_me: false,
        })
    }

    pub fn outgoing(msg: &InboundMessage, name: &str) -> Self {
        WebhookEvent::OutgoingChat(OutgoingChat {
            chat_id: chat_id_from_address(&msg.to).to_string(),
            message_id: msg.id.clone(),
            name: name.to_string(),
            timestamp: msg.timestamp,
            message_body: msg.body.clone(),
            message_ack: ack_value(msg.ack),
            is_from_me: true,
        })
    }

    /// Synthetic event used to let operators verify their endpoint.
    pub fn test(device_name: &str) -> Self {
        let now = Utc::now();
        WebhookEvent::TestWebhook(IncomingChat {
            chat_id: "6282325339189".to_string(),
            message_id: format!("TEST_MESSAGE_{}", now.timestamp_millis()),
            name: "Test User".to_string(),
            profile_picture: String::new(),
            timestamp: now.timestamp(),
            message_body: format!("Test message from {}", device_name),
            message_ack: Value::from("SENT"),
            has_media: false,
            media_mime: String::new(),
            media_name: String::new(),
            location_attached: LocationAttached { lat: None, lng: None },
            is_forwarding: false,
            is_from_me: false,
        })
    }

    /// Full POST body: the device envelope merged with `type` and `data`.
    pub fn envelope(&self, device_id: &str, device_name: &str) -> Value {
        let mut body = serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(obj) = body.as_object_mut() {
            obj.insert("device_id".to_string(), Value::from(device_id));
            obj.insert("device_name".to_string(), Value::from(device_name));
        }
        body
    }
}
