//! Registry configuration

use std::time::Duration;

use crate::capture::CaptureConfig;

/// Configuration for the session registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Share one upstream session between all clients asking for the same
    /// source. When disabled every client gets a private session.
    pub reuse_sessions: bool,

    /// Capture settings applied to every upstream session
    pub capture: CaptureConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reuse_sessions: true,
            capture: CaptureConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Enable or disable upstream sharing
    pub fn reuse_sessions(mut self, reuse: bool) -> Self {
        self.reuse_sessions = reuse;
        self
    }

    /// Set the per-session frame buffer capacity
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.capture = self.capture.buffer_capacity(capacity);
        self
    }

    /// Set the read retry back-off
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.capture = self.capture.retry_backoff(backoff);
        self
    }

    /// Set the capture thread stop timeout
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.capture = self.capture.stop_timeout(timeout);
        self
    }
}
