//! Consumer side of the capture bridge
//!
//! `FrameSampler` is what the async pump awaits on. It parks until the
//! buffer has a frame, then hands it over in the pixel format the transport
//! track expects, with a timestamp that never goes backwards.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::buffer::FrameBuffer;
use super::frame::{Frame, PixelFormat};
use crate::stats::CaptureStats;

/// Async frame reader over a [`FrameBuffer`]
pub struct FrameSampler {
    buffer: Arc<FrameBuffer>,
    cancel: CancellationToken,
    format: PixelFormat,
    last_pts: Option<u64>,
    stats: Arc<CaptureStats>,
}

impl FrameSampler {
    pub fn new(
        buffer: Arc<FrameBuffer>,
        format: PixelFormat,
        cancel: CancellationToken,
        stats: Arc<CaptureStats>,
    ) -> Self {
        Self {
            buffer,
            cancel,
            format,
            last_pts: None,
            stats,
        }
    }

    /// Pixel format frames are converted to
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Wait for the next frame
    ///
    /// Returns `None` once the sampler is cancelled. Frames come out in
    /// capture order; gaps appear when the buffer evicted frames.
    pub async fn next(&mut self) -> Option<Frame> {
        let frame = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            frame = self.buffer.pop() => frame,
        };

        let mut frame = frame.convert(self.format);
        if let Some(last) = self.last_pts {
            frame.pts = frame.pts.max(last);
        }
        self.last_pts = Some(frame.pts);
        self.stats.record_delivered();

        Some(frame)
    }
}
