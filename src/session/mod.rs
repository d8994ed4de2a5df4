//! Per-client signaling
//!
//! Each WebSocket connection is driven by a [`SignalingHandler`] through the
//! handshake below, after which the client only receives media:
//!
//! ```text
//! client                         server
//!   │ ── "rtsp://cam1" ─────────► │  NEW → OFFERED
//!   │ ◄──────── {"sdp","type"} ── │
//!   │ ── {"sdp","type":"answer"} ►│  OFFERED → ANSWERED → ACTIVE
//!   │            ...              │
//!   │ ── "CLOSE" ───────────────► │  ACTIVE → CLOSED
//! ```

pub mod channel;
pub mod context;
pub mod error;
pub mod handler;
pub mod state;

pub use channel::{ChannelError, CloseReason, SignalChannel, MAX_CLOSE_REASON};
pub use context::ClientContext;
pub use error::SignalingError;
pub use handler::SignalingHandler;
pub use state::{SignalingPhase, SignalingState, TransitionError};
