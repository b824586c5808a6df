pub mod http;
pub mod registry;
pub mod session;
pub mod sidecar;
pub mod subsystems;
