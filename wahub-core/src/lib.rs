pub mod config;
pub mod error;
pub mod models;
pub mod protocol;
pub mod store;
#[cfg(feature = "testing")]
pub mod testing;
pub mod wire;

pub use config::HubConfig;
pub use error::HubError;
pub use protocol::{
    Chat, EventSink, ProtocolClient, ProtocolClientFactory, ProtocolError, ProtocolEvent,
    LOGOUT_REASON,
};
pub use store::ConfigStore;
