//! Synthetic test-pattern source
//!
//! Produces scrolling SMPTE-style colour bars at a fixed rate. `read_frame`
//! blocks until the next frame is due, which makes it behave like a real
//! camera feed for the capture thread.
//!
//! Identifier syntax: `pattern://WIDTHxHEIGHT[?fps=N]`

use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use super::frame::{Frame, PixelFormat};
use super::source::{FrameSource, SourceError};
use crate::registry::SourceId;

const MAX_DIMENSION: u32 = 4096;
const DEFAULT_FPS: u32 = 30;
const MAX_FPS: u32 = 120;

/// Colour bars in BGR order: white, yellow, cyan, green, magenta, red, blue, black
const BARS: [[u8; 3]; 8] = [
    [255, 255, 255],
    [0, 255, 255],
    [255, 255, 0],
    [0, 255, 0],
    [255, 0, 255],
    [0, 0, 255],
    [255, 0, 0],
    [0, 0, 0],
];

/// Parsed pattern parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternSpec {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl PatternSpec {
    /// Parse the parameters out of a `pattern://` identifier
    pub fn parse(source_id: &SourceId) -> Result<Self, String> {
        let url = source_id.url();
        let dims = url.host_str().ok_or("missing dimensions")?;
        let (w, h) = dims
            .split_once('x')
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {dims:?}"))?;
        let width: u32 = w.parse().map_err(|_| format!("invalid width {w:?}"))?;
        let height: u32 = h.parse().map_err(|_| format!("invalid height {h:?}"))?;

        if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(format!("dimensions {width}x{height} out of range"));
        }

        let mut fps = DEFAULT_FPS;
        for (key, value) in url.query_pairs() {
            if key == "fps" {
                fps = value
                    .parse()
                    .ok()
                    .filter(|f| (1..=MAX_FPS).contains(f))
                    .ok_or_else(|| format!("invalid fps {value:?}"))?;
            }
        }

        Ok(Self { width, height, fps })
    }

    /// Time between frames
    pub fn interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps
    }
}

struct Running {
    spec: PatternSpec,
    next_due: Instant,
    index: u64,
}

/// Blocking source of generated colour bars
pub struct TestPatternSource {
    state: Mutex<Option<Running>>,
    wake: Condvar,
}

impl TestPatternSource {
    /// Identifier scheme handled by this source
    pub const SCHEME: &'static str = "pattern";

    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            wake: Condvar::new(),
        }
    }
}

impl Default for TestPatternSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for TestPatternSource {
    fn connect(&self, source_id: &SourceId) -> Result<(), SourceError> {
        let spec = PatternSpec::parse(source_id).map_err(|e| SourceError::connect(source_id, e))?;

        *self.state.lock() = Some(Running {
            spec,
            next_due: Instant::now(),
            index: 0,
        });

        tracing::debug!(
            source = %source_id,
            width = spec.width,
            height = spec.height,
            fps = spec.fps,
            "Test pattern connected"
        );
        Ok(())
    }

    fn read_frame(&self) -> Result<Frame, SourceError> {
        let mut state = self.state.lock();

        loop {
            let due = match state.as_ref() {
                Some(running) => running.next_due,
                None => return Err(SourceError::Read("source is closed".into())),
            };
            if Instant::now() >= due {
                break;
            }
            // close() notifies, so a blocked read returns promptly
            self.wake.wait_until(&mut state, due);
        }

        let running = match state.as_mut() {
            Some(running) => running,
            None => return Err(SourceError::Read("source is closed".into())),
        };

        let data = render_bars(running.spec.width, running.spec.height, running.index);
        running.index += 1;
        running.next_due += running.spec.interval();

        // Fell far behind (slow consumer of the thread), resync instead of bursting
        let now = Instant::now();
        if running.next_due + running.spec.interval() < now {
            running.next_due = now;
        }

        Ok(Frame::new(
            Bytes::from(data),
            running.spec.width,
            running.spec.height,
            PixelFormat::Bgr24,
        ))
    }

    fn close(&self) {
        *self.state.lock() = None;
        self.wake.notify_all();
    }
}

/// Render one BGR24 frame of colour bars scrolled by `index`
fn render_bars(width: u32, height: u32, index: u64) -> Vec<u8> {
    let bar_width = (width / 8).max(1);
    let shift = (index * 4 % width as u64) as u32;

    let mut row = Vec::with_capacity(width as usize * 3);
    for x in 0..width {
        let bar = (((x + shift) % width) / bar_width).min(7) as usize;
        row.extend_from_slice(&BARS[bar]);
    }

    let mut data = Vec::with_capacity(row.len() * height as usize);
    for _ in 0..height {
        data.extend_from_slice(&row);
    }
    data
}
