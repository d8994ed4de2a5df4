//! Capture pipeline configuration

use std::time::Duration;

use super::buffer::DEFAULT_BUFFER_CAPACITY;

/// Settings for one upstream capture pipeline
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Frames held between the capture thread and the pump (minimum 1)
    pub buffer_capacity: usize,

    /// Pause after a failed read before retrying
    pub retry_backoff: Duration,

    /// How long `stop` waits for the capture thread to exit
    pub stop_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            retry_backoff: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(1),
        }
    }
}

impl CaptureConfig {
    /// Set the buffer capacity
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self
    }

    /// Set the read retry back-off
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the stop timeout
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}
