//! # rtc-relay
//!
//! Relay gateway that republishes blocking video sources (RTSP cameras, files,
//! generated test patterns) to WebRTC viewers negotiated over WebSocket.
//!
//! ```text
//!   upstream ──► capture thread ──► FrameBuffer ──► FrameSampler ──► track ──► viewers
//!   (blocking)   (one per session)  (drop oldest)   (async pump)     (shared)
//! ```
//!
//! Viewers that ask for the same source share one upstream session, so a
//! camera is opened once no matter how many browsers watch it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use rtc_relay::registry::{RegistryConfig, SessionRegistry};
//! use rtc_relay::transport::{WebRtcConfig, WebRtcTransport};
//! use rtc_relay::{RelayServer, ServerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = WebRtcTransport::new(WebRtcConfig::default())?;
//! let registry = Arc::new(SessionRegistry::with_config(transport, RegistryConfig::default()));
//!
//! let server = RelayServer::new(ServerConfig::with_port(8080), Arc::clone(&registry));
//! server.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod client;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;
pub mod transport;
pub mod upstream;

pub use error::{Error, Result};
pub use registry::{RegistryConfig, SessionRegistry, SourceId};
pub use server::{RelayServer, ServerConfig};
