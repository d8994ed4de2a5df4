//! In-process loopback transport
//!
//! Produces syntactically plausible SDP without touching the network and
//! counts what flows through it. Lets the whole relay run in tests and on
//! hosts without UDP connectivity.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{MediaTrack, MediaTransport, PeerConnection, TransportError};
use crate::capture::{Frame, PixelFormat};
use crate::protocol::SessionDescription;
use crate::registry::SourceId;

#[derive(Debug, Default)]
struct Counters {
    tracks_created: AtomicU64,
    peers_created: AtomicU64,
    peers_closed: AtomicU64,
    frames_written: AtomicU64,
    fail_tracks: AtomicBool,
}

/// Transport that keeps everything in memory
///
/// Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct LoopbackTransport {
    counters: Arc<Counters>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `create_track` calls fail
    pub fn fail_tracks(&self, fail: bool) {
        self.counters.fail_tracks.store(fail, Ordering::SeqCst);
    }

    /// Tracks created so far
    pub fn tracks_created(&self) -> u64 {
        self.counters.tracks_created.load(Ordering::SeqCst)
    }

    /// Peer connections created so far
    pub fn peers_created(&self) -> u64 {
        self.counters.peers_created.load(Ordering::SeqCst)
    }

    /// Peer connections closed so far
    pub fn peers_closed(&self) -> u64 {
        self.counters.peers_closed.load(Ordering::SeqCst)
    }

    /// Frames written across all tracks
    pub fn frames_written(&self) -> u64 {
        self.counters.frames_written.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    type Track = LoopbackTrack;
    type Peer = LoopbackPeer;

    fn create_track(&self, source_id: &SourceId) -> Result<Arc<LoopbackTrack>, TransportError> {
        if self.counters.fail_tracks.load(Ordering::SeqCst) {
            return Err(TransportError::Track(format!("track creation disabled for {source_id}")));
        }
        self.counters.tracks_created.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(LoopbackTrack {
            stream_id: source_id.to_string(),
            written: AtomicU64::new(0),
            last_frame: Mutex::new(None),
            counters: Arc::clone(&self.counters),
        }))
    }

    async fn create_peer(&self, track: &Arc<LoopbackTrack>) -> Result<LoopbackPeer, TransportError> {
        let id = self.counters.peers_created.fetch_add(1, Ordering::SeqCst) + 1;

        Ok(LoopbackPeer {
            id,
            stream_id: track.stream_id.clone(),
            offered: AtomicBool::new(false),
            answered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            counters: Arc::clone(&self.counters),
        })
    }
}

/// Track that records frames instead of sending them
#[derive(Debug)]
pub struct LoopbackTrack {
    stream_id: String,
    written: AtomicU64,
    last_frame: Mutex<Option<Frame>>,
    counters: Arc<Counters>,
}

impl LoopbackTrack {
    /// Frames written to this track
    pub fn frames_written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    /// Most recent frame written
    pub fn last_frame(&self) -> Option<Frame> {
        self.last_frame.lock().clone()
    }
}

#[async_trait]
impl MediaTrack for LoopbackTrack {
    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Rgb24
    }

    async fn write_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        if frame.format != self.pixel_format() {
            return Err(TransportError::Write(format!(
                "expected {} frame, got {}",
                self.pixel_format(),
                frame.format
            )));
        }

        *self.last_frame.lock() = Some(frame.clone());
        self.written.fetch_add(1, Ordering::SeqCst);
        self.counters.frames_written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Peer connection that only tracks negotiation order
#[derive(Debug)]
pub struct LoopbackPeer {
    id: u64,
    stream_id: String,
    offered: AtomicBool,
    answered: AtomicBool,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

impl LoopbackPeer {
    /// Check if an answer was applied
    pub fn is_answered(&self) -> bool {
        self.answered.load(Ordering::SeqCst)
    }

    /// Check if the peer was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn offer_sdp(&self) -> String {
        format!(
            "v=0\r\n\
             o=- {id} 1 IN IP4 127.0.0.1\r\n\
             s=rtc-relay loopback\r\n\
             t=0 0\r\n\
             m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
             c=IN IP4 127.0.0.1\r\n\
             a=rtpmap:96 H264/90000\r\n\
             a=msid:{stream} video\r\n\
             a=sendonly\r\n",
            id = self.id,
            stream = self.stream_id,
        )
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Negotiation("peer is closed".into()));
        }
        self.offered.store(true, Ordering::SeqCst);
        Ok(SessionDescription::offer(self.offer_sdp()))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), TransportError> {
        if !self.offered.load(Ordering::SeqCst) {
            return Err(TransportError::Negotiation("answer before offer".into()));
        }
        if !answer.sdp.starts_with("v=") {
            return Err(TransportError::Negotiation("answer is not SDP".into()));
        }
        self.answered.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counters.peers_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
