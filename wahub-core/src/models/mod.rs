pub mod device;
pub mod message;
pub mod webhook;

pub use device::{
    DeviceConfig, DeviceConfigUpdate, DeviceStatus, LifecycleState, NewDevice, CONFIG_VERSION,
};
pub use message::{
    chat_id_from_address, format_target, ChatState, ClientInfo, ContactInfo, InboundMessage,
    Location, MediaPayload, OutboundContent, SentMessage, DEFAULT_CHAT_SUFFIX,
};
pub use webhook::WebhookEvent;
