//! ffmpeg subprocess source
//!
//! Decodes any input ffmpeg understands (RTSP, HTTP, files, devices) into raw
//! BGR24 frames of a fixed size on stdout, and reads them back one frame at a
//! time. Decoding stays out of process; this side only sees pixel buffers.
//!
//! `connect` waits at most `connect_timeout` for the first frame and kills
//! the child if it never arrives. When ffmpeg exits mid-stream the next read
//! spawns a fresh child, so the capture worker's back-off paces reconnects.

use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, RecvTimeoutError};
use parking_lot::Mutex;

use super::frame::{Frame, PixelFormat};
use super::source::{FrameSource, SourceError};
use crate::registry::SourceId;

/// Default bound on opening the input and decoding the first frame
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// ffmpeg invocation settings
#[derive(Debug, Clone)]
pub struct FfmpegConfig {
    /// Program to run
    pub program: String,
    /// Output frame width
    pub width: u32,
    /// Output frame height
    pub height: u32,
    /// Bound on connecting; also passed to ffmpeg as its I/O timeout
    pub connect_timeout: Duration,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            width: 640,
            height: 480,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl FfmpegConfig {
    /// Set the program path
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Set the output frame size
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bytes in one output frame
    pub fn frame_size(&self) -> usize {
        PixelFormat::Bgr24.frame_size(self.width, self.height)
    }

    /// Command-line arguments for decoding `source_id`
    pub fn args(&self, source_id: &SourceId) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
        let timeout_us = self.connect_timeout.as_micros().to_string();

        match source_id.scheme() {
            "rtsp" | "rtsps" => {
                args.extend(["-rtsp_transport".into(), "tcp".into()]);
                args.extend(["-timeout".into(), timeout_us]);
            }
            "file" => {}
            _ => args.extend(["-rw_timeout".into(), timeout_us]),
        }

        args.extend([
            "-i".to_string(),
            source_id.as_str().to_string(),
            "-an".to_string(),
            "-vf".to_string(),
            format!("scale={}:{}", self.width, self.height),
            "-pix_fmt".to_string(),
            PixelFormat::Bgr24.ffmpeg_name().to_string(),
            "-f".to_string(),
            "rawvideo".to_string(),
            "pipe:1".to_string(),
        ]);
        args
    }
}

/// Frame source backed by an ffmpeg child process
pub struct FfmpegSource {
    config: FfmpegConfig,
    source_id: Mutex<Option<SourceId>>,
    child: Arc<Mutex<Option<Child>>>,
    stdout: Mutex<Option<ChildStdout>>,
    /// First frame, read during connect to prove the stream opened
    pending: Mutex<Option<Frame>>,
    closed: AtomicBool,
    restarts: AtomicU64,
}

impl FfmpegSource {
    pub fn new(config: FfmpegConfig) -> Self {
        Self {
            config,
            source_id: Mutex::new(None),
            child: Arc::new(Mutex::new(None)),
            stdout: Mutex::new(None),
            pending: Mutex::new(None),
            closed: AtomicBool::new(false),
            restarts: AtomicU64::new(0),
        }
    }

    /// Number of times ffmpeg was respawned after exiting
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    fn spawn(&self, source_id: &SourceId) -> std::io::Result<()> {
        let args = self.config.args(source_id);
        tracing::debug!(source = %source_id, program = %self.config.program, ?args, "Spawning ffmpeg");

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(std::io::Error::other("ffmpeg stdout unavailable"));
        };

        *self.stdout.lock() = Some(stdout);
        *self.child.lock() = Some(child);

        // close() may have run while spawning
        if self.closed.load(Ordering::SeqCst) {
            self.reap();
            return Err(std::io::Error::other("source is closed"));
        }
        Ok(())
    }

    /// Kill and wait for the current child, dropping its pipe
    fn reap(&self) {
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(mut stdout) = self.stdout.try_lock() {
            stdout.take();
        }
    }

    fn respawn(&self) -> Result<(), SourceError> {
        let source_id = self
            .source_id
            .lock()
            .clone()
            .ok_or_else(|| SourceError::Read("not connected".into()))?;

        let restarts = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(source = %source_id, restarts, "ffmpeg exited, restarting");

        self.spawn(&source_id)
            .map_err(|e| SourceError::Read(format!("failed to restart ffmpeg: {e}")))
    }

    fn read_next(&self) -> Result<Frame, SourceError> {
        let mut stdout = self.stdout.lock();
        let reader = stdout
            .as_mut()
            .ok_or_else(|| SourceError::Read("not connected".into()))?;

        let mut buf = vec![0u8; self.config.frame_size()];
        reader
            .read_exact(&mut buf)
            .map_err(|e| SourceError::Read(e.to_string()))?;

        Ok(Frame::new(
            Bytes::from(buf),
            self.config.width,
            self.config.height,
            PixelFormat::Bgr24,
        ))
    }
}

impl FrameSource for FfmpegSource {
    fn connect(&self, source_id: &SourceId) -> Result<(), SourceError> {
        if self.config.frame_size() == 0 {
            return Err(SourceError::connect(source_id, "output size is empty"));
        }

        self.closed.store(false, Ordering::SeqCst);
        *self.source_id.lock() = Some(source_id.clone());
        self.spawn(source_id)
            .map_err(|e| SourceError::connect(source_id, format!("failed to spawn ffmpeg: {e}")))?;

        // Watchdog: kill the child if the first frame does not arrive in time
        let timeout = self.config.connect_timeout;
        let (done_tx, done_rx) = bounded::<()>(0);
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = {
            let child = Arc::clone(&self.child);
            let timed_out = Arc::clone(&timed_out);
            thread::Builder::new()
                .name("ffmpeg-connect".into())
                .spawn(move || {
                    if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(timeout) {
                        timed_out.store(true, Ordering::SeqCst);
                        if let Some(child) = child.lock().as_mut() {
                            let _ = child.kill();
                        }
                    }
                })
        };
        let watchdog = match watchdog {
            Ok(handle) => handle,
            Err(e) => {
                self.reap();
                return Err(SourceError::connect(source_id, format!("failed to start watchdog: {e}")));
            }
        };

        let first = self.read_next();
        drop(done_tx);
        let _ = watchdog.join();

        match first {
            Ok(frame) => {
                *self.pending.lock() = Some(frame);
                tracing::info!(
                    source = %source_id,
                    width = self.config.width,
                    height = self.config.height,
                    "ffmpeg source opened"
                );
                Ok(())
            }
            Err(e) => {
                self.close();
                let reason = if timed_out.load(Ordering::SeqCst) {
                    format!("no video within {}ms", timeout.as_millis())
                } else {
                    format!("no video received: {e}")
                };
                Err(SourceError::connect(source_id, reason))
            }
        }
    }

    fn read_frame(&self) -> Result<Frame, SourceError> {
        if let Some(frame) = self.pending.lock().take() {
            return Ok(frame);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(SourceError::Read("source is closed".into()));
        }
        if self.stdout.lock().is_none() {
            self.respawn()?;
        }

        self.read_next().map_err(|e| {
            // EOF or a broken pipe: the child is gone or useless
            self.reap();
            e
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Killing the child closes the pipe, which ends any blocked read
        self.reap();
        self.pending.lock().take();
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}
