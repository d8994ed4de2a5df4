//! WebSocket signaling server

pub mod config;
pub mod listener;

pub use config::{ServerConfig, DEFAULT_PORT};
pub use listener::RelayServer;
