//! Statistics and metrics

pub mod metrics;

pub use metrics::{CaptureSnapshot, CaptureStats, ServerStats};
