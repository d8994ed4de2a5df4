//! H.264 encoding for the WebRTC track
//!
//! Browsers only decode what the negotiated codec carries, so RGB frames are
//! encoded to an Annex B H.264 access unit before they become samples.

use bytes::Bytes;
use openh264::encoder::{Encoder, EncoderConfig};
use openh264::formats::{RgbSliceU8, YUVBuffer};
use openh264::OpenH264API;

use super::TransportError;
use crate::capture::{Frame, PixelFormat};

/// Frames between forced keyframes
pub const DEFAULT_KEYFRAME_INTERVAL: u64 = 60;

/// Stateful H.264 encoder for one track
pub struct VideoEncoder {
    inner: Encoder,
    keyframe_interval: u64,
    frames_since_keyframe: u64,
    keyframe_requested: bool,
    frames_encoded: u64,
}

impl VideoEncoder {
    pub fn new(keyframe_interval: u64) -> Result<Self, TransportError> {
        let inner = Encoder::with_api_config(OpenH264API::from_source(), EncoderConfig::new())
            .map_err(|e| TransportError::Setup(format!("failed to create H.264 encoder: {e}")))?;

        Ok(Self {
            inner,
            keyframe_interval: keyframe_interval.max(1),
            frames_since_keyframe: 0,
            // The first frame is always a keyframe
            keyframe_requested: true,
            frames_encoded: 0,
        })
    }

    /// Make the next encoded frame a keyframe
    pub fn request_keyframe(&mut self) {
        self.keyframe_requested = true;
    }

    /// Frames encoded so far
    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    /// Encode one RGB24 frame into an Annex B access unit
    ///
    /// Odd dimensions are cropped by one pixel, since 4:2:0 needs even sizes.
    pub fn encode(&mut self, frame: &Frame) -> Result<Bytes, TransportError> {
        if frame.format != PixelFormat::Rgb24 {
            return Err(TransportError::Write(format!(
                "encoder expects rgb24, got {}",
                frame.format
            )));
        }
        let expected = frame.format.frame_size(frame.width, frame.height);
        if frame.size() != expected {
            return Err(TransportError::Write(format!(
                "frame holds {} bytes, expected {expected}",
                frame.size()
            )));
        }

        let width = (frame.width & !1) as usize;
        let height = (frame.height & !1) as usize;
        if width == 0 || height == 0 {
            return Err(TransportError::Write(format!(
                "frame {}x{} is too small to encode",
                frame.width, frame.height
            )));
        }

        let cropped;
        let rgb: &[u8] = if width == frame.width as usize && height == frame.height as usize {
            &frame.data
        } else {
            cropped = crop(&frame.data, frame.width as usize, width, height);
            &cropped
        };

        if self.keyframe_requested || self.frames_since_keyframe >= self.keyframe_interval {
            self.inner.force_intra_frame();
            self.keyframe_requested = false;
            self.frames_since_keyframe = 0;
        }

        let yuv = YUVBuffer::from_rgb_source(RgbSliceU8::new(rgb, (width, height)));
        let bitstream = self
            .inner
            .encode(&yuv)
            .map_err(|e| TransportError::Write(format!("H.264 encode failed: {e}")))?;

        self.frames_since_keyframe += 1;
        self.frames_encoded += 1;
        Ok(Bytes::from(bitstream.to_vec()))
    }
}

impl std::fmt::Debug for VideoEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoEncoder")
            .field("keyframe_interval", &self.keyframe_interval)
            .field("frames_encoded", &self.frames_encoded)
            .finish()
    }
}

fn crop(data: &[u8], stride_px: usize, width: usize, height: usize) -> Vec<u8> {
    let row = width * 3;
    let stride = stride_px * 3;
    let mut out = Vec::with_capacity(row * height);
    for y in 0..height {
        out.extend_from_slice(&data[y * stride..y * stride + row]);
    }
    out
}

/// NAL unit types in an Annex B stream
#[cfg(test)]
fn nal_types(data: &[u8]) -> Vec<u8> {
    let mut types = Vec::new();
    let mut i = 0;
    while i + 3 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            types.push(data[i + 3] & 0x1f);
            i += 3;
        } else {
            i += 1;
        }
    }
    types
}
