//! JSON wire format spoken with the protocol sidecar.
//!
//! Commands flow from the hub to the sidecar and are tagged by `action`;
//! frames flow back and are tagged by `event`. Request/reply pairs are
//! correlated by `request_id`.

use serde::{Deserialize, Serialize};

use crate::models::{ChatState, ClientInfo, InboundMessage, OutboundContent};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SidecarCommand {
    Initialize {
        device_id: String,
        session_dir: String,
    },
    Destroy {
        request_id: String,
    },
    SendMessage {
        request_id: String,
        target: String,
        content: OutboundContent,
    },
    GetChat {
        request_id: String,
        chat_id: String,
    },
    ChatState {
        request_id: String,
        chat_id: String,
        state: ChatState,
    },
    ContactInfo {
        request_id: String,
        address: String,
    },
}

impl SidecarCommand {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            SidecarCommand::Initialize { .. } => None,
            SidecarCommand::Destroy { request_id }
            | SidecarCommand::SendMessage { request_id, .. }
            | SidecarCommand::GetChat { request_id, .. }
            | SidecarCommand::ChatState { request_id, .. }
            | SidecarCommand::ContactInfo { request_id, .. } => Some(request_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SidecarFrame {
    Qr {
        qr: String,
    },
    Authenticated,
    Ready {
        #[serde(default)]
        info: ClientInfo,
    },
    Disconnected {
        reason: String,
    },
    AuthFailure {
        #[serde(default)]
        message: String,
    },
    Message {
        message: InboundMessage,
    },
    MessageCreate {
        message: InboundMessage,
    },
    Reply(SidecarReply),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarReply {
    pub request_id: String,
    pub status: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SidecarReply {
    pub fn ok(request_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            request_id: request_id.into(),
            status: "ok".to_string(),
            data: Some(data),
            error: None,
        }
    }

    pub fn err(request_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: "error".to_string(),
            data: None,
            error: Some(msg.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// Payload on success, or the error text.
    pub fn into_result(self) -> Result<serde_json::Value, String> {
        if self.is_ok() {
            Ok(self.data.unwrap_or(serde_json::json!({})))
        } else {
            Err(self.error.unwrap_or_else(|| "unknown error".to_string()))
        }
    }
}
