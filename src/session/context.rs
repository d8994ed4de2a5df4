//! Client context
//!
//! Identity of one connected viewer, carried through the signaling handler
//! for logging and registry bookkeeping.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::registry::ClientId;

/// Information about a connected client
#[derive(Debug, Clone)]
pub struct ClientContext {
    /// Unique client ID
    pub client_id: ClientId,

    /// Remote peer address
    pub peer_addr: SocketAddr,

    /// When the connection was accepted
    pub connected_at: Instant,
}

impl ClientContext {
    pub fn new(client_id: ClientId, peer_addr: SocketAddr) -> Self {
        Self {
            client_id,
            peer_addr,
            connected_at: Instant::now(),
        }
    }

    /// Time since the connection was accepted
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
