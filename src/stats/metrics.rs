//! Statistics for capture pipelines and the server

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Live counters for one upstream capture pipeline
///
/// Written by the capture thread and the pump task without locking.
#[derive(Debug)]
pub struct CaptureStats {
    started_at: Instant,
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    read_errors: AtomicU64,
    frames_delivered: AtomicU64,
}

impl CaptureStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            frames_captured: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            frames_delivered: AtomicU64::new(0),
        }
    }

    /// Record a frame read from the source
    pub fn record_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame evicted from a full buffer
    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed read
    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame handed to the transport
    pub fn record_delivered(&self) {
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent-enough copy of the counters
    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            uptime: self.started_at.elapsed(),
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
        }
    }
}

impl Default for CaptureStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`CaptureStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureSnapshot {
    /// Time since the pipeline started
    pub uptime: Duration,
    /// Frames read from the source
    pub frames_captured: u64,
    /// Frames evicted before delivery
    pub frames_dropped: u64,
    /// Failed reads
    pub read_errors: u64,
    /// Frames written to the transport track
    pub frames_delivered: u64,
}

impl CaptureSnapshot {
    /// Average capture rate in frames per second
    pub fn capture_fps(&self) -> f64 {
        let secs = self.uptime.as_secs_f64();
        if secs > 0.0 {
            self.frames_captured as f64 / secs
        } else {
            0.0
        }
    }
}

/// Server-wide connection counters
#[derive(Debug, Default)]
pub struct ServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted connection
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished connection
    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Record a connection turned away at the limit
    pub fn connection_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Total connections ever accepted
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Connections currently open
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Connections rejected by the connection limit
    pub fn rejected_connections(&self) -> u64 {
        self.rejected_connections.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_stats_snapshot() {
        let stats = CaptureStats::new();
        stats.record_captured();
        stats.record_captured();
        stats.record_dropped();
        stats.record_read_error();
        stats.record_delivered();

        let snap = stats.snapshot();
        assert_eq!(snap.frames_captured, 2);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.read_errors, 1);
        assert_eq!(snap.frames_delivered, 1);
    }

    #[test]
    fn test_capture_fps_zero_uptime() {
        let snap = CaptureSnapshot::default();
        assert_eq!(snap.capture_fps(), 0.0);
    }

    #[test]
    fn test_capture_fps() {
        let snap = CaptureSnapshot {
            uptime: Duration::from_secs(2),
            frames_captured: 60,
            ..Default::default()
        };
        assert!((snap.capture_fps() - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_server_stats() {
        let stats = ServerStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        stats.connection_rejected();

        assert_eq!(stats.total_connections(), 2);
        assert_eq!(stats.active_connections(), 1);
        assert_eq!(stats.rejected_connections(), 1);
    }

    #[test]
    fn test_active_connections_never_underflow() {
        let stats = ServerStats::new();
        stats.connection_closed();
        assert_eq!(stats.active_connections(), 0);
    }
}
