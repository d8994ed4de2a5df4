//! Crate-level error type

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::registry::RegistryError;
use crate::session::{CloseReason, SignalingError};
use crate::transport::TransportError;

/// Result alias for server and client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("connection closed by peer{}", .0.as_ref().map(|r| format!(" ({}: {})", r.code, r.reason)).unwrap_or_default())]
    Closed(Option<CloseReason>),
}

impl Error {
    /// Close status the peer sent, if the connection was closed
    pub fn close_reason(&self) -> Option<&CloseReason> {
        match self {
            Error::Closed(reason) => reason.as_ref(),
            _ => None,
        }
    }
}
