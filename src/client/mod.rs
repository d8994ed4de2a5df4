//! Client side of the signaling protocol
//!
//! Used by the integration tests and by tools that need to drive the relay
//! without a browser.

pub mod viewer;

pub use viewer::ViewerClient;
