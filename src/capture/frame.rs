//! Captured frame types and the presentation clock
//!
//! Frames carry their pixel data as `Bytes` so handing a frame from the
//! capture thread to the pump task never copies the buffer.

use std::time::Instant;

use bytes::Bytes;

/// Presentation clock rate for video (90 kHz)
pub const VIDEO_CLOCK_RATE: u64 = 90_000;

/// Pixel layout of a frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Packed 8-bit blue, green, red
    Bgr24,
    /// Packed 8-bit red, green, blue
    Rgb24,
}

impl PixelFormat {
    /// Bytes per pixel
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => 3,
        }
    }

    /// Total buffer size for a frame of the given dimensions
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }

    /// Name as understood by ffmpeg's `-pix_fmt`
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Rgb24 => "rgb24",
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.ffmpeg_name())
    }
}

/// A single captured video frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Pixel data, tightly packed
    pub data: Bytes,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel layout of `data`
    pub format: PixelFormat,
    /// When the source handed the frame over
    pub captured_at: Instant,
    /// Presentation timestamp in 90 kHz units (set by the capture worker)
    pub pts: u64,
}

impl Frame {
    /// Create a frame captured now
    pub fn new(data: Bytes, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data,
            width,
            height,
            format,
            captured_at: Instant::now(),
            pts: 0,
        }
    }

    /// Size of the pixel buffer in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Convert to another pixel format
    ///
    /// Identical formats are returned as-is without copying.
    pub fn convert(self, target: PixelFormat) -> Frame {
        if self.format == target {
            return self;
        }

        let data = match (self.format, target) {
            (PixelFormat::Bgr24, PixelFormat::Rgb24) | (PixelFormat::Rgb24, PixelFormat::Bgr24) => {
                swap_red_blue(&self.data)
            }
            _ => self.data.clone(),
        };

        Frame {
            data,
            format: target,
            ..self
        }
    }
}

/// Swap the first and third byte of every 3-byte pixel
fn swap_red_blue(data: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(data.len());
    for px in data.chunks_exact(3) {
        out.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    // trailing partial pixel, if any, is copied unchanged
    out.extend_from_slice(data.chunks_exact(3).remainder());
    Bytes::from(out)
}

/// Maps capture instants onto the 90 kHz presentation timeline
#[derive(Debug, Clone, Copy)]
pub struct PresentationClock {
    start: Instant,
}

impl PresentationClock {
    /// Start a clock at the current instant
    pub fn start() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Start a clock at a given instant
    pub fn starting_at(start: Instant) -> Self {
        Self { start }
    }

    /// Instant the clock started at
    pub fn origin(&self) -> Instant {
        self.start
    }

    /// Presentation timestamp for a capture instant
    ///
    /// Instants before the clock origin map to 0.
    pub fn timestamp(&self, at: Instant) -> u64 {
        let elapsed = at.saturating_duration_since(self.start);
        (elapsed.as_nanos() * VIDEO_CLOCK_RATE as u128 / 1_000_000_000) as u64
    }
}
