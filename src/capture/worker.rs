//! Dedicated capture thread
//!
//! Each upstream session runs one OS thread that loops on the blocking
//! `read_frame` call and pushes timestamped frames into the session's
//! [`FrameBuffer`]. Read failures are retried after a back-off; the thread
//! only exits when asked to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use super::buffer::FrameBuffer;
use super::config::CaptureConfig;
use super::frame::PresentationClock;
use super::source::FrameSource;
use crate::stats::CaptureStats;

/// Handle to a running capture thread
pub struct CaptureWorker {
    name: String,
    stop: Arc<AtomicBool>,
    /// Dropping the sender wakes a back-off sleep early
    wake_tx: Option<Sender<()>>,
    /// Disconnects when the thread exits
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
    stop_timeout: Duration,
}

struct CaptureLoop {
    name: String,
    source: Arc<dyn FrameSource>,
    buffer: Arc<FrameBuffer>,
    stats: Arc<CaptureStats>,
    clock: PresentationClock,
    stop: Arc<AtomicBool>,
    wake_rx: Receiver<()>,
    retry_backoff: Duration,
    _done_tx: Sender<()>,
}

impl CaptureWorker {
    /// Spawn the capture thread for a connected source
    pub fn spawn(
        session_id: u64,
        source: Arc<dyn FrameSource>,
        buffer: Arc<FrameBuffer>,
        stats: Arc<CaptureStats>,
        config: &CaptureConfig,
    ) -> std::io::Result<Self> {
        let name = format!("capture-{session_id}");
        let stop = Arc::new(AtomicBool::new(false));
        let (wake_tx, wake_rx) = bounded::<()>(0);
        let (done_tx, done_rx) = bounded::<()>(0);

        let capture = CaptureLoop {
            name: name.clone(),
            source,
            buffer,
            stats,
            clock: PresentationClock::start(),
            stop: Arc::clone(&stop),
            wake_rx,
            retry_backoff: config.retry_backoff,
            _done_tx: done_tx,
        };

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || capture.run())?;

        tracing::debug!(worker = %name, "Capture thread started");

        Ok(Self {
            name,
            stop,
            wake_tx: Some(wake_tx),
            done_rx,
            handle: Some(handle),
            stop_timeout: config.stop_timeout,
        })
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the thread is still running
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the thread to stop and wait up to `timeout` for it to exit
    ///
    /// Returns `true` once the thread has exited; after that no frame is
    /// pushed into the buffer. On timeout the thread is detached and `false`
    /// is returned. A blocked `read_frame` can only be interrupted by closing
    /// the source.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };

        self.stop.store(true, Ordering::SeqCst);
        self.wake_tx.take();

        match self.done_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    worker = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Capture thread did not stop in time, detaching"
                );
                false
            }
            _ => {
                let _ = handle.join();
                tracing::debug!(worker = %self.name, "Capture thread stopped");
                true
            }
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        let timeout = self.stop_timeout;
        self.stop(timeout);
    }
}

impl std::fmt::Debug for CaptureWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureWorker")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl CaptureLoop {
    fn run(self) {
        let mut failures: u64 = 0;
        let mut failing_since = Instant::now();

        while !self.stop.load(Ordering::SeqCst) {
            match self.source.read_frame() {
                Ok(mut frame) => {
                    // Never touch the buffer once stop was requested
                    if self.stop.load(Ordering::SeqCst) {
                        break;
                    }

                    if failures > 0 {
                        tracing::info!(
                            worker = %self.name,
                            failures = failures,
                            outage_ms = failing_since.elapsed().as_millis() as u64,
                            "Capture recovered"
                        );
                        failures = 0;
                    }

                    frame.pts = self.clock.timestamp(Instant::now());
                    self.stats.record_captured();
                    if self.buffer.push(frame).is_some() {
                        self.stats.record_dropped();
                    }
                }
                Err(e) => {
                    self.stats.record_read_error();
                    failures += 1;

                    if failures == 1 {
                        failing_since = Instant::now();
                        if e.is_fatal() {
                            tracing::error!(worker = %self.name, error = %e, "Source lost, retrying");
                        } else {
                            tracing::warn!(worker = %self.name, error = %e, "Frame read failed, retrying");
                        }
                    } else {
                        tracing::debug!(
                            worker = %self.name,
                            error = %e,
                            failures = failures,
                            "Frame read still failing"
                        );
                    }

                    match self.wake_rx.recv_timeout(self.retry_backoff) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                }
            }
        }

        tracing::debug!(
            worker = %self.name,
            uptime_ms = self.clock.origin().elapsed().as_millis() as u64,
            "Capture loop exited"
        );
    }
}
