use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Schema version stamped on every persisted config.
pub const CONFIG_VERSION: &str = "2.0.0";

/// Durable per-device record. Everything else about a device is runtime-derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    pub device_name: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub auto_reply: bool,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

fn default_version() -> String {
    CONFIG_VERSION.to_string()
}

impl DeviceConfig {
    pub fn new(device_id: impl Into<String>, request: NewDevice) -> Self {
        let device_id = device_id.into();
        let device_name = request
            .device_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("Device-{}", device_id));

        Self {
            device_id,
            device_name,
            webhook_url: request.webhook_url.filter(|u| !u.trim().is_empty()),
            auto_reply: request.auto_reply.unwrap_or(false),
            version: default_version(),
            last_updated: None,
        }
    }

    /// Merge the fields present in `update`. `device_id` is never touched.
    pub fn apply(&mut self, update: DeviceConfigUpdate) {
        if let Some(name) = update.device_name {
            self.device_name = name;
        }
        if let Some(url) = update.webhook_url {
            self.webhook_url = url.filter(|u| !u.trim().is_empty());
        }
        if let Some(auto_reply) = update.auto_reply {
            self.auto_reply = auto_reply;
        }
    }
}

/// Operator input for "create device".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewDevice {
    pub device_name: Option<String>,
    pub webhook_url: Option<String>,
    pub auto_reply: Option<bool>,
}

/// Partial config update. `webhook_url: null` clears the webhook while an
/// absent key leaves it unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceConfigUpdate {
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default, deserialize_with = "present_or_null")]
    pub webhook_url: Option<Option<String>>,
    #[serde(default)]
    pub auto_reply: Option<bool>,
}

fn present_or_null<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    QrPending,
    Authenticated,
    Ready,
    Disconnected,
    Reconnecting,
    Destroyed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        self == LifecycleState::Destroyed
    }
}

/// Point-in-time status snapshot of one session.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub device_name: String,
    pub state: LifecycleState,
    pub is_ready: bool,
    pub is_deleted: bool,
    pub has_qr: bool,
    pub number: Option<String>,
    pub battery: Option<u8>,
    pub webhook_url: Option<String>,
    pub config: DeviceConfig,
}
