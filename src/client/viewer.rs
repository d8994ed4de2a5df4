//! Signaling viewer client
//!
//! Client side of the relay's signaling protocol: request a source, receive
//! the offer, return an answer, and later ask the server to close.
//!
//! # Example
//! ```no_run
//! use rtc_relay::client::ViewerClient;
//! use rtc_relay::protocol::SessionDescription;
//!
//! # async fn example() -> rtc_relay::error::Result<()> {
//! let mut viewer = ViewerClient::connect("ws://localhost:8080").await?;
//! let offer = viewer.request("rtsp://cam1").await?;
//!
//! // Hand the offer to a WebRTC stack and send back its answer
//! # let answer_sdp = offer.sdp.clone();
//! viewer.send_answer(&SessionDescription::answer(answer_sdp)).await?;
//!
//! viewer.close().await?;
//! # Ok(())
//! # }
//! ```

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{Error, Result};
use crate::protocol::{self, ProtocolError, SessionDescription};
use crate::session::CloseReason;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client for one viewer session
pub struct ViewerClient {
    ws: Socket,
}

impl ViewerClient {
    /// Connect to a relay server
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
        tracing::debug!(url = %url, "Viewer connected");
        Ok(Self { ws })
    }

    /// Request `source` and wait for the server's offer
    pub async fn request(&mut self, source: &str) -> Result<SessionDescription> {
        self.send_text(source).await?;
        let text = self.recv_text().await?;
        Ok(SessionDescription::from_json(&text)?)
    }

    /// Send the answer to the offer
    pub async fn send_answer(&mut self, answer: &SessionDescription) -> Result<()> {
        let text = answer.to_json()?;
        self.send_text(&text).await
    }

    /// Send an arbitrary text message
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.ws.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    /// Wait for the server to close the connection
    ///
    /// Returns the close status, or `None` if the connection dropped
    /// without a close frame. Any text received meanwhile is an error.
    pub async fn closed(&mut self) -> Result<Option<CloseReason>> {
        match self.recv_text().await {
            Err(Error::Closed(reason)) => Ok(reason),
            Err(e) => Err(e),
            Ok(text) => Err(ProtocolError::unexpected("closing", &text).into()),
        }
    }

    /// Ask the server to end the session and wait for its close frame
    pub async fn close(mut self) -> Result<Option<CloseReason>> {
        self.send_text(protocol::CLOSE).await?;
        self.closed().await
    }

    async fn recv_text(&mut self) -> Result<String> {
        loop {
            let message = match self.ws.next().await {
                Some(message) => message?,
                None => return Err(Error::Closed(None)),
            };

            match message {
                Message::Text(text) => return Ok(text),
                Message::Binary(_) => return Err(ProtocolError::BinaryMessage.into()),
                Message::Close(frame) => {
                    let reason =
                        frame.map(|f| CloseReason::new(u16::from(f.code), f.reason.into_owned()));
                    return Err(Error::Closed(reason));
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }
}
