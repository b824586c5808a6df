use serde::{Deserialize, Serialize};

/// Suffix appended to bare phone numbers to address a one-to-one chat.
pub const DEFAULT_CHAT_SUFFIX: &str = "@c.us";

const KNOWN_SUFFIXES: &[&str] = &[
    "@c.us",
    "@g.us",
    "@s.whatsapp.net",
    "@broadcast",
    "@lid",
    "@newsletter",
];

/// Normalise an operator-supplied target into a protocol address.
pub fn format_target(target: &str) -> String {
    let target = target.trim();
    if KNOWN_SUFFIXES.iter().any(|s| target.ends_with(s)) {
        target.to_string()
    } else {
        format!("{}{}", target, DEFAULT_CHAT_SUFFIX)
    }
}

/// Strip the domain suffix off a protocol address (`62812@c.us` -> `62812`).
pub fn chat_id_from_address(address: &str) -> &str {
    address.split('@').next().unwrap_or(address)
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// A message observed by the protocol client, in either direction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundMessage {
    /// Serialized protocol message id.
    pub id: String,
    pub from: String,
    pub to: String,
    pub body: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub ack: Option<i32>,
    pub has_media: bool,
    /// Protocol message type (`chat`, `image`, `document`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    pub location: Option<Location>,
    pub is_forwarded: bool,
    pub is_status: bool,
    pub from_me: bool,
    pub notify_name: Option<String>,
}

/// Encoded media ready to hand to the protocol client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPayload {
    pub mime_type: String,
    /// Base64 payload.
    pub data: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundContent {
    Text {
        body: String,
    },
    Media {
        media: MediaPayload,
        #[serde(skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(default)]
        as_document: bool,
    },
}

impl OutboundContent {
    pub fn text(body: impl Into<String>) -> Self {
        OutboundContent::Text { body: body.into() }
    }
}

/// What the protocol client reports back for a successful send.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentMessage {
    pub id: String,
    pub to: String,
    pub timestamp: i64,
    pub ack: Option<i32>,
}

/// Identity of the logged-in account, available once ready.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientInfo {
    pub number: String,
    pub battery: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactInfo {
    pub pushname: Option<String>,
    pub name: Option<String>,
    pub profile_picture_url: Option<String>,
}

impl ContactInfo {
    pub fn display_name(&self) -> Option<&str> {
        self.pushname
            .as_deref()
            .or(self.name.as_deref())
            .filter(|n| !n.is_empty())
    }
}

/// Presence indicator shown on a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatState {
    Composing,
    Cleared,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_target_appends_default_suffix() {
        assert_eq!(format_target("6281234567890"), "6281234567890@c.us");
        assert_eq!(format_target(" 6281234567890 "), "6281234567890@c.us");
    }

    #[test]
    fn test_format_target_keeps_known_suffix() {
        assert_eq!(format_target("6281234567890@c.us"), "6281234567890@c.us");
        assert_eq!(format_target("120363@g.us"), "120363@g.us");
    }

    #[test]
    fn test_chat_id_strips_domain() {
        assert_eq!(chat_id_from_address("6281234567890@c.us"), "6281234567890");
        assert_eq!(chat_id_from_address("120363@g.us"), "120363");
        assert_eq!(chat_id_from_address("bare"), "bare");
    }

    #[test]
    fn test_contact_display_name_prefers_pushname() {
        let contact = ContactInfo {
            pushname: Some("Budi".into()),
            name: Some("Budi Santoso".into()),
            profile_picture_url: None,
        };
        assert_eq!(contact.display_name(), Some("Budi"));
        assert_eq!(ContactInfo::default().display_name(), None);
    }
}
