//! Media transport seam
//!
//! The relay core only needs three things from the outbound transport: a
//! track it can write frames to, one peer connection per viewer bound to that
//! track, and an opaque offer/answer exchange on each peer. Everything below
//! that (ICE, DTLS, SDP syntax, packetization) belongs to the implementation.
//!
//! Two implementations ship with the crate:
//!
//! - [`webrtc::WebRtcTransport`] backed by the `webrtc` crate, encoding
//!   frames to H.264 with [`encoder::VideoEncoder`]
//! - [`loopback::LoopbackTransport`], an in-process stand-in that records
//!   what was written, used by tests

pub mod encoder;
pub mod loopback;
pub mod webrtc;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::capture::{Frame, PixelFormat};
use crate::protocol::SessionDescription;
use crate::registry::SourceId;

pub use self::encoder::{VideoEncoder, DEFAULT_KEYFRAME_INTERVAL};
pub use self::loopback::{LoopbackPeer, LoopbackTrack, LoopbackTransport};
pub use self::webrtc::{WebRtcConfig, WebRtcPeer, WebRtcTrack, WebRtcTransport};

/// Failures of the media transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),

    #[error("failed to create track: {0}")]
    Track(String),

    #[error("failed to create peer connection: {0}")]
    Peer(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("failed to write frame: {0}")]
    Write(String),
}

/// Outbound track shared by every viewer of one upstream
#[async_trait]
pub trait MediaTrack: Send + Sync + 'static {
    /// Pixel format frames must be in before `write_frame`
    fn pixel_format(&self) -> PixelFormat;

    /// Send one frame to every peer bound to this track
    async fn write_frame(&self, frame: &Frame) -> Result<(), TransportError>;
}

/// One viewer's peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    /// Produce the local offer
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Apply the viewer's answer
    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), TransportError>;

    /// Tear the connection down (idempotent)
    async fn close(&self);
}

/// Factory for tracks and peer connections
#[async_trait]
pub trait MediaTransport: Send + Sync + 'static {
    type Track: MediaTrack;
    type Peer: PeerConnection;

    /// Create the outbound track for an upstream source
    fn create_track(&self, source_id: &SourceId) -> Result<Arc<Self::Track>, TransportError>;

    /// Create a peer connection sending `track`
    async fn create_peer(&self, track: &Arc<Self::Track>) -> Result<Self::Peer, TransportError>;
}
