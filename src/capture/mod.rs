//! Capture bridge
//!
//! Moves frames from a blocking upstream source onto the async runtime.
//!
//! ```text
//!   capture-<id> thread                 tokio runtime
//!  ┌──────────────────────┐          ┌──────────────────────┐
//!  │ FrameSource          │          │ FrameSampler::next() │
//!  │   .read_frame()      │  push    │   convert + clamp    │
//!  │ CaptureWorker loop ──┼──► FrameBuffer ──► pump task ──► track
//!  └──────────────────────┘ (drop-oldest)     └──────────────────────┘
//! ```
//!
//! The buffer is the only thing both sides touch. The producer never
//! blocks on it; the consumer is woken by a `Notify` rather than polling.

pub mod buffer;
pub mod config;
pub mod ffmpeg;
pub mod frame;
pub mod pattern;
pub mod sampler;
pub mod source;
pub mod worker;

pub use buffer::{FrameBuffer, DEFAULT_BUFFER_CAPACITY};
pub use config::CaptureConfig;
pub use ffmpeg::{FfmpegConfig, FfmpegSource, DEFAULT_CONNECT_TIMEOUT};
pub use frame::{Frame, PixelFormat, PresentationClock, VIDEO_CLOCK_RATE};
pub use pattern::{PatternSpec, TestPatternSource};
pub use sampler::FrameSampler;
pub use source::{DefaultSourceFactory, FrameSource, SourceError, SourceFactory};
pub use worker::CaptureWorker;
