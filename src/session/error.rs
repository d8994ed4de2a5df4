//! Per-client signaling errors

use thiserror::Error;

use super::channel::{ChannelError, CloseReason};
use super::state::{SignalingPhase, TransitionError};
use crate::protocol::ProtocolError;
use crate::registry::RegistryError;
use crate::upstream::UpstreamError;

/// Everything that can end a client session early
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("handshake timed out while {0}")]
    Timeout(SignalingPhase),

    #[error("client disconnected while {0}")]
    Disconnected(SignalingPhase),

    #[error("server is shutting down")]
    ShuttingDown,
}

impl From<ChannelError> for SignalingError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Binary => SignalingError::Protocol(ProtocolError::BinaryMessage),
            ChannelError::Transport(e) => SignalingError::Channel(e),
        }
    }
}

impl SignalingError {
    /// Close frame reporting this error, if the client can still receive one
    pub fn close_reason(&self) -> Option<CloseReason> {
        let message = self.to_string();
        match self {
            SignalingError::Protocol(_) | SignalingError::Transition(_) | SignalingError::Timeout(_) => {
                Some(CloseReason::protocol(message))
            }
            SignalingError::Upstream(e) => Some(upstream_close(e, message)),
            SignalingError::Registry(RegistryError::Upstream(e)) => Some(upstream_close(e, message)),
            SignalingError::Registry(RegistryError::AlreadyAttached(_)) => Some(CloseReason::protocol(message)),
            SignalingError::Registry(RegistryError::ShuttingDown) | SignalingError::ShuttingDown => {
                Some(CloseReason::going_away(message))
            }
            SignalingError::Channel(_) | SignalingError::Disconnected(_) => None,
        }
    }

    /// Check if this is an ordinary disconnect rather than a failure
    pub fn is_disconnect(&self) -> bool {
        matches!(self, SignalingError::Disconnected(_))
    }
}

fn upstream_close(err: &UpstreamError, message: String) -> CloseReason {
    if err.is_client_error() {
        CloseReason::protocol(message)
    } else {
        CloseReason::internal(message)
    }
}
