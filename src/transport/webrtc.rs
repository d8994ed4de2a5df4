//! WebRTC transport
//!
//! One `TrackLocalStaticSample` per upstream session is shared by every
//! viewer's `RTCPeerConnection`. Frames are H.264 encoded before they become
//! samples. A new viewer or a picture loss indication from any viewer forces
//! the next frame to be a keyframe. Offers are sent after ICE gathering so the
//! viewer gets all candidates in one message; no trickle ICE.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::encoder::{VideoEncoder, DEFAULT_KEYFRAME_INTERVAL};
use super::{MediaTrack, MediaTransport, PeerConnection, TransportError};
use crate::capture::{Frame, PixelFormat, VIDEO_CLOCK_RATE};
use crate::protocol::SessionDescription;
use crate::registry::SourceId;

/// Default STUN server
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Constrained baseline, level 3.1, as browsers negotiate it
pub const H264_FMTP_LINE: &str =
    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

/// Frame duration assumed before two timestamps are known
const DEFAULT_FRAME_DURATION: Duration = Duration::from_nanos(1_000_000_000 / 30);

/// WebRTC transport configuration
#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    /// ICE server URLs
    pub ice_servers: Vec<String>,

    /// Codec MIME type advertised for the video track
    pub mime_type: String,

    /// RTP clock rate of the video track
    pub clock_rate: u32,

    /// SDP format parameters of the video codec
    pub sdp_fmtp_line: String,

    /// Frames between forced keyframes
    pub keyframe_interval: u64,

    /// Upper bound on waiting for ICE gathering before sending an offer
    pub gather_timeout: Duration,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            mime_type: MIME_TYPE_H264.to_string(),
            clock_rate: VIDEO_CLOCK_RATE as u32,
            sdp_fmtp_line: H264_FMTP_LINE.to_string(),
            keyframe_interval: DEFAULT_KEYFRAME_INTERVAL,
            gather_timeout: Duration::from_secs(5),
        }
    }
}

impl WebRtcConfig {
    /// Replace the ICE server list
    pub fn ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    /// Set the ICE gathering timeout
    pub fn gather_timeout(mut self, timeout: Duration) -> Self {
        self.gather_timeout = timeout;
        self
    }

    /// Set the number of frames between forced keyframes
    pub fn keyframe_interval(mut self, frames: u64) -> Self {
        self.keyframe_interval = frames;
        self
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

/// Transport backed by the `webrtc` crate
pub struct WebRtcTransport {
    api: API,
    config: WebRtcConfig,
}

impl WebRtcTransport {
    pub fn new(config: WebRtcConfig) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::Setup(format!("failed to register codecs: {e}")))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| TransportError::Setup(format!("failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, config })
    }

    /// Transport configuration
    pub fn config(&self) -> &WebRtcConfig {
        &self.config
    }
}

impl std::fmt::Debug for WebRtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransport")
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    type Track = WebRtcTrack;
    type Peer = WebRtcPeer;

    fn create_track(&self, source_id: &SourceId) -> Result<Arc<WebRtcTrack>, TransportError> {
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: self.config.mime_type.clone(),
                clock_rate: self.config.clock_rate,
                sdp_fmtp_line: self.config.sdp_fmtp_line.clone(),
                ..Default::default()
            },
            "video".to_owned(),
            source_id.to_string(),
        );

        Ok(Arc::new(WebRtcTrack {
            inner: Arc::new(track),
            encoder: Arc::new(Mutex::new(VideoEncoder::new(self.config.keyframe_interval)?)),
            keyframe_requested: Arc::new(AtomicBool::new(false)),
            last_pts: Mutex::new(None),
        }))
    }

    async fn create_peer(&self, track: &Arc<WebRtcTrack>) -> Result<WebRtcPeer, TransportError> {
        let pc = self
            .api
            .new_peer_connection(self.config.rtc_configuration())
            .await
            .map_err(|e| TransportError::Peer(e.to_string()))?;
        let pc = Arc::new(pc);

        let rtp_sender = pc
            .add_track(Arc::clone(&track.inner) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::Peer(format!("failed to add track: {e}")))?;

        // The new viewer cannot decode until the next keyframe
        track.request_keyframe();

        // RTCP has to be read for the interceptors (NACK, reports) to run
        let keyframe_requested = Arc::clone(&track.keyframe_requested);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while let Ok((packets, _)) = rtp_sender.read(&mut buf).await {
                let wants_keyframe = packets.iter().any(|p| {
                    let any = p.as_any();
                    any.is::<PictureLossIndication>() || any.is::<FullIntraRequest>()
                });
                if wants_keyframe {
                    keyframe_requested.store(true, Ordering::Release);
                }
            }
        });

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::debug!(state = %state, "Peer connection state changed");
            Box::pin(async {})
        }));

        Ok(WebRtcPeer {
            pc,
            gather_timeout: self.config.gather_timeout,
        })
    }
}

/// Shared outbound video track
pub struct WebRtcTrack {
    inner: Arc<TrackLocalStaticSample>,
    encoder: Arc<Mutex<VideoEncoder>>,
    keyframe_requested: Arc<AtomicBool>,
    last_pts: Mutex<Option<u64>>,
}

impl WebRtcTrack {
    /// Make the next written frame a keyframe
    pub fn request_keyframe(&self) {
        self.keyframe_requested.store(true, Ordering::Release);
    }

    /// Frames encoded onto this track so far
    pub fn frames_encoded(&self) -> u64 {
        self.encoder.lock().frames_encoded()
    }

    async fn encode(&self, frame: &Frame) -> Result<bytes::Bytes, TransportError> {
        let force_keyframe = self.keyframe_requested.swap(false, Ordering::AcqRel);
        let encoder = Arc::clone(&self.encoder);
        let frame = frame.clone();

        tokio::task::spawn_blocking(move || {
            let mut encoder = encoder.lock();
            if force_keyframe {
                encoder.request_keyframe();
            }
            encoder.encode(&frame)
        })
        .await
        .map_err(|e| TransportError::Write(format!("encoder task failed: {e}")))?
    }

    /// Duration of the sample ending at `pts`
    fn sample_duration(&self, pts: u64) -> Duration {
        let mut last = self.last_pts.lock();
        let duration = match *last {
            Some(prev) if pts > prev => {
                Duration::from_nanos((pts - prev) * 1_000_000_000 / VIDEO_CLOCK_RATE)
            }
            _ => DEFAULT_FRAME_DURATION,
        };
        *last = Some(pts);
        duration
    }
}

#[async_trait]
impl MediaTrack for WebRtcTrack {
    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Rgb24
    }

    async fn write_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let data = self.encode(frame).await?;
        let sample = Sample {
            data,
            duration: self.sample_duration(frame.pts),
            ..Default::default()
        };

        self.inner
            .write_sample(&sample)
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }
}

/// One viewer's `RTCPeerConnection`
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    gather_timeout: Duration,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let gathered = Arc::new(Notify::new());
        let gathered_tx = Arc::clone(&gathered);
        self.pc
            .on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
                if state == RTCIceGathererState::Complete {
                    gathered_tx.notify_one();
                }
                Box::pin(async {})
            }));

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Negotiation(format!("failed to create offer: {e}")))?;

        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| TransportError::Negotiation(format!("failed to set local description: {e}")))?;

        if tokio::time::timeout(self.gather_timeout, gathered.notified())
            .await
            .is_err()
        {
            tracing::debug!(
                timeout_ms = self.gather_timeout.as_millis() as u64,
                "ICE gathering incomplete, sending offer with current candidates"
            );
        }

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Negotiation("no local description".into()))?;

        Ok(SessionDescription::offer(local.sdp))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| TransportError::Negotiation(format!("invalid answer: {e}")))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| TransportError::Negotiation(format!("failed to set remote description: {e}")))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::debug!(error = %e, "Error closing peer connection");
        }
    }
}
