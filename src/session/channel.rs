//! Text message channel to one client
//!
//! The handler only needs to receive and send whole text messages and to
//! close the connection with a status. `SignalChannel` captures that, and is
//! implemented for tungstenite WebSocket streams.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

/// Longest close reason that fits a control frame
pub const MAX_CLOSE_REASON: usize = 123;

/// Channel failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("binary message received")]
    Binary,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Status sent with the close frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const INTERNAL_ERROR: u16 = 1011;

    /// Build a close reason, truncating the text to fit the frame
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        if reason.len() > MAX_CLOSE_REASON {
            let mut end = MAX_CLOSE_REASON;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason.truncate(end);
        }
        Self { code, reason }
    }

    pub fn normal() -> Self {
        Self::new(Self::NORMAL, "")
    }

    pub fn going_away(reason: impl Into<String>) -> Self {
        Self::new(Self::GOING_AWAY, reason)
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::new(Self::PROTOCOL_ERROR, reason)
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, reason)
    }
}

/// Bidirectional text channel to a client
#[async_trait]
pub trait SignalChannel: Send {
    /// Next text message, or `None` once the client disconnected
    async fn recv(&mut self) -> Result<Option<String>, ChannelError>;

    /// Send a text message
    async fn send(&mut self, text: String) -> Result<(), ChannelError>;

    /// Close the connection; errors are ignored since the peer may be gone
    async fn close(&mut self, reason: CloseReason);
}

#[async_trait]
impl<S> SignalChannel for WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<String>, ChannelError> {
        loop {
            let message = match self.next().await {
                None => return Ok(None),
                Some(Ok(message)) => message,
                Some(Err(
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake),
                )) => return Ok(None),
                Some(Err(e)) => return Err(ChannelError::Transport(e.to_string())),
            };

            match message {
                Message::Text(text) => return Ok(Some(text)),
                Message::Binary(_) => return Err(ChannelError::Binary),
                Message::Close(_) => return Ok(None),
                // Pongs are queued by tungstenite itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), ChannelError> {
        SinkExt::send(self, Message::Text(text))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn close(&mut self, reason: CloseReason) {
        let frame = CloseFrame {
            code: CloseCode::from(reason.code),
            reason: reason.reason.into(),
        };
        if let Err(e) = WebSocketStream::close(self, Some(frame)).await {
            tracing::debug!(error = %e, "Close handshake failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_truncated() {
        let reason = CloseReason::protocol("x".repeat(500));
        assert_eq!(reason.code, 1002);
        assert_eq!(reason.reason.len(), MAX_CLOSE_REASON);
    }

    #[test]
    fn test_close_reason_truncates_on_char_boundary() {
        // 'é' is two bytes; 62 of them straddle the limit
        let reason = CloseReason::internal("é".repeat(62));
        assert!(reason.reason.len() <= MAX_CLOSE_REASON);
        assert_eq!(reason.reason.chars().count(), 61);
    }

    #[test]
    fn test_close_reason_codes() {
        assert_eq!(CloseReason::normal().code, 1000);
        assert_eq!(CloseReason::going_away("bye").code, 1001);
        assert_eq!(CloseReason::internal("boom").code, 1011);
    }
}
