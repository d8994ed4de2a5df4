//! Upstream sessions
//!
//! An upstream session is one live connection to one upstream source: the
//! blocking source, its capture thread and buffer, the pump task feeding the
//! outbound track, and a peer connection per attached viewer.

pub mod session;

use std::sync::Arc;

use thiserror::Error;

use crate::capture::{CaptureConfig, DefaultSourceFactory, SourceError, SourceFactory};
use crate::transport::{MediaTransport, TransportError};

pub use session::UpstreamSession;

/// Errors from opening or negotiating on an upstream session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Handshake step out of order, or the session is gone
    #[error("negotiation error: {0}")]
    Negotiation(String),

    #[error("failed to start capture thread: {0}")]
    Spawn(String),

    #[error("blocking task failed: {0}")]
    Blocking(String),
}

impl UpstreamError {
    pub(crate) fn negotiation(reason: impl Into<String>) -> Self {
        UpstreamError::Negotiation(reason.into())
    }

    /// Check if the error was caused by the viewer rather than the upstream
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            UpstreamError::Negotiation(_) | UpstreamError::Transport(TransportError::Negotiation(_))
        )
    }
}

/// Everything needed to open upstream sessions
pub struct UpstreamFactory<T: MediaTransport> {
    transport: Arc<T>,
    sources: Arc<dyn SourceFactory>,
    capture: CaptureConfig,
}

impl<T: MediaTransport> UpstreamFactory<T> {
    /// Create a factory using the default scheme-based source selection
    pub fn new(transport: T, capture: CaptureConfig) -> Self {
        Self::with_sources(Arc::new(transport), Arc::new(DefaultSourceFactory::default()), capture)
    }

    /// Create a factory with a custom source factory
    pub fn with_sources(transport: Arc<T>, sources: Arc<dyn SourceFactory>, capture: CaptureConfig) -> Self {
        Self {
            transport,
            sources,
            capture,
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn sources(&self) -> &Arc<dyn SourceFactory> {
        &self.sources
    }

    pub fn capture_config(&self) -> &CaptureConfig {
        &self.capture
    }
}
