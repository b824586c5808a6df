pub mod commands;
pub mod media;
pub mod retry;
pub mod sender;
pub mod webhook;
