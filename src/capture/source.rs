//! Blocking frame sources
//!
//! A `FrameSource` wraps a legacy pull-based feed. Every method may block the
//! calling thread, so sources are only ever driven from a capture thread or
//! the blocking thread pool.

use std::sync::Arc;

use thiserror::Error;

use super::ffmpeg::{FfmpegConfig, FfmpegSource};
use super::frame::Frame;
use super::pattern::TestPatternSource;
use crate::registry::SourceId;

/// Errors raised by frame sources
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The upstream connection could not be established (fatal)
    #[error("failed to connect to {source_id}: {reason}")]
    Connect { source_id: String, reason: String },

    /// A frame could not be read (transient, retried)
    #[error("failed to read frame: {0}")]
    Read(String),
}

impl SourceError {
    /// Build a connect error for a source
    pub fn connect(source_id: &SourceId, reason: impl Into<String>) -> Self {
        SourceError::Connect {
            source_id: source_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Check if this error must abort session creation
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Connect { .. })
    }
}

/// A blocking upstream video feed
///
/// Methods take `&self` so `close` can be called from another thread while
/// `read_frame` is blocked; implementations must make `close` unblock it.
pub trait FrameSource: Send + Sync + 'static {
    /// Establish the upstream connection
    fn connect(&self, source_id: &SourceId) -> Result<(), SourceError>;

    /// Block until the next frame is available
    fn read_frame(&self) -> Result<Frame, SourceError>;

    /// Release the connection (idempotent)
    fn close(&self);
}

/// Creates an unconnected source for an identifier
pub trait SourceFactory: Send + Sync + 'static {
    fn create(&self, source_id: &SourceId) -> Result<Arc<dyn FrameSource>, SourceError>;
}

/// Picks a source implementation from the identifier's scheme
///
/// `pattern://` identifiers get a synthetic test pattern, everything else is
/// decoded by an ffmpeg subprocess.
#[derive(Debug, Clone, Default)]
pub struct DefaultSourceFactory {
    ffmpeg: FfmpegConfig,
}

impl DefaultSourceFactory {
    pub fn new(ffmpeg: FfmpegConfig) -> Self {
        Self { ffmpeg }
    }
}

impl SourceFactory for DefaultSourceFactory {
    fn create(&self, source_id: &SourceId) -> Result<Arc<dyn FrameSource>, SourceError> {
        match source_id.scheme() {
            TestPatternSource::SCHEME => Ok(Arc::new(TestPatternSource::new())),
            _ => Ok(Arc::new(FfmpegSource::new(self.ffmpeg.clone()))),
        }
    }
}
