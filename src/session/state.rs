//! Signaling state machine
//!
//! Tracks one client from connection to teardown. The machine only moves
//! forward: `New → Offered → Answered → Active → Closed`, with `Closed`
//! reachable from anywhere.

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::registry::SourceId;

/// Client signaling lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingPhase {
    /// Connected, waiting for the source identifier
    New,
    /// Offer sent, waiting for the answer
    Offered,
    /// Answer applied to the peer connection
    Answered,
    /// Streaming; only `CLOSE` is accepted
    Active,
    /// Terminal
    Closed,
}

impl std::fmt::Display for SignalingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SignalingPhase::New => "new",
            SignalingPhase::Offered => "offered",
            SignalingPhase::Answered => "answered",
            SignalingPhase::Active => "active",
            SignalingPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Rejected state transition
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid signaling transition from {from} to {to}")]
pub struct TransitionError {
    pub from: SignalingPhase,
    pub to: SignalingPhase,
}

/// Per-client signaling state
#[derive(Debug)]
pub struct SignalingState {
    phase: SignalingPhase,
    source_id: Option<SourceId>,
    created_at: Instant,
    offered_at: Option<Instant>,
    active_at: Option<Instant>,
}

impl SignalingState {
    pub fn new() -> Self {
        Self {
            phase: SignalingPhase::New,
            source_id: None,
            created_at: Instant::now(),
            offered_at: None,
            active_at: None,
        }
    }

    /// Current phase
    pub fn phase(&self) -> SignalingPhase {
        self.phase
    }

    /// Source the client asked for, once the offer went out
    pub fn source_id(&self) -> Option<&SourceId> {
        self.source_id.as_ref()
    }

    fn advance(&mut self, expected: SignalingPhase, to: SignalingPhase) -> Result<(), TransitionError> {
        if self.phase != expected {
            return Err(TransitionError { from: self.phase, to });
        }
        self.phase = to;
        Ok(())
    }

    /// The offer for `source_id` was sent
    pub fn on_offer(&mut self, source_id: SourceId) -> Result<(), TransitionError> {
        self.advance(SignalingPhase::New, SignalingPhase::Offered)?;
        self.source_id = Some(source_id);
        self.offered_at = Some(Instant::now());
        Ok(())
    }

    /// The client's answer was applied
    pub fn on_answer(&mut self) -> Result<(), TransitionError> {
        self.advance(SignalingPhase::Offered, SignalingPhase::Answered)
    }

    /// Handshake complete, streaming
    pub fn activate(&mut self) -> Result<(), TransitionError> {
        self.advance(SignalingPhase::Answered, SignalingPhase::Active)?;
        self.active_at = Some(Instant::now());
        Ok(())
    }

    /// Enter the terminal phase, returning the phase it was closed from
    pub fn close(&mut self) -> SignalingPhase {
        std::mem::replace(&mut self.phase, SignalingPhase::Closed)
    }

    /// Check if the handshake finished
    pub fn is_active(&self) -> bool {
        self.phase == SignalingPhase::Active
    }

    /// Time from connection to the offer going out
    pub fn time_to_offer(&self) -> Option<Duration> {
        self.offered_at.map(|at| at.duration_since(self.created_at))
    }

    /// Time spent streaming so far
    pub fn active_duration(&self) -> Option<Duration> {
        self.active_at.map(|at| at.elapsed())
    }
}

impl Default for SignalingState {
    fn default() -> Self {
        Self::new()
    }
}
