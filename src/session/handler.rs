//! Signaling handler
//!
//! Drives one client through the offer/answer handshake and holds its
//! reference into the session registry until the connection ends.
//!
//! Whatever ends the session (a `CLOSE` message, a disconnect, a protocol
//! violation, an upstream failure, a timeout) goes through `finish`, which
//! releases the registry reference before anything else.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::channel::{CloseReason, SignalChannel};
use super::context::ClientContext;
use super::error::SignalingError;
use super::state::{SignalingPhase, SignalingState};
use crate::protocol::{self, ProtocolError};
use crate::registry::{SessionRegistry, SourceId};
use crate::transport::MediaTransport;
use crate::upstream::UpstreamSession;

/// Per-client signaling state machine
pub struct SignalingHandler<T: MediaTransport, C: SignalChannel> {
    ctx: ClientContext,
    channel: C,
    registry: Arc<SessionRegistry<T>>,
    state: SignalingState,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
    attached: Option<(SourceId, Arc<UpstreamSession<T>>)>,
}

impl<T: MediaTransport, C: SignalChannel> SignalingHandler<T, C> {
    pub fn new(
        ctx: ClientContext,
        channel: C,
        registry: Arc<SessionRegistry<T>>,
        handshake_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            channel,
            registry,
            state: SignalingState::new(),
            handshake_timeout,
            shutdown,
            attached: None,
        }
    }

    /// Current signaling phase
    pub fn phase(&self) -> SignalingPhase {
        self.state.phase()
    }

    /// Run the session to completion
    ///
    /// Returns the phase the session was in when it ended. The registry
    /// reference is released on every path.
    pub async fn run(mut self) -> Result<SignalingPhase, SignalingError> {
        tracing::debug!(
            client = %self.ctx.client_id,
            peer = %self.ctx.peer_addr,
            "Signaling started"
        );

        let result = self.drive().await;
        let ended_in = self.finish(&result).await;
        result.map(|()| ended_in)
    }

    async fn drive(&mut self) -> Result<(), SignalingError> {
        let client = self.ctx.client_id;

        // Step 1: source identifier
        let text = self.recv_handshake().await?;
        let source_id = protocol::parse_source(&text)?;

        // Opening a source can stall; shutdown must not wait for it
        let session = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(SignalingError::ShuttingDown),
            result = self.registry.get_or_create(&source_id, client) => result?,
        };
        self.attached = Some((source_id.clone(), Arc::clone(&session)));

        // Step 2: offer
        let offer = session.create_offer(client).await?;
        self.channel.send(offer.to_json()?).await?;
        self.state.on_offer(source_id.clone())?;

        tracing::debug!(
            client = %client,
            source = %source_id,
            session_id = session.id(),
            time_to_offer_ms = self.state.time_to_offer().map_or(0, |d| d.as_millis() as u64),
            "Offer sent"
        );

        // Step 3: answer
        let text = self.recv_handshake().await?;
        let answer = match protocol::parse_answer(&text) {
            Ok(answer) => answer,
            Err(e) if protocol::parse_source(&text).is_ok() => {
                tracing::debug!(client = %client, error = %e, "Second source identifier");
                return Err(ProtocolError::unexpected(self.state.phase(), &text).into());
            }
            Err(e) => return Err(e.into()),
        };
        session.apply_answer(client, answer).await?;
        self.state.on_answer()?;
        self.state.activate()?;

        tracing::info!(
            client = %client,
            peer = %self.ctx.peer_addr,
            source = %source_id,
            session_id = session.id(),
            "Client active"
        );

        // Step 4: only CLOSE is accepted from here on
        loop {
            match self.recv().await? {
                Some(text) if protocol::is_close(&text) => {
                    tracing::debug!(client = %client, "Close requested");
                    return Ok(());
                }
                Some(text) => {
                    return Err(ProtocolError::unexpected(self.state.phase(), &text).into());
                }
                None => {
                    tracing::debug!(client = %client, "Client disconnected");
                    return Ok(());
                }
            }
        }
    }

    /// Receive a message, giving up when the server shuts down
    async fn recv(&mut self) -> Result<Option<String>, SignalingError> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(SignalingError::ShuttingDown),
            message = self.channel.recv() => Ok(message?),
        }
    }

    /// Receive a handshake message within the handshake timeout
    async fn recv_handshake(&mut self) -> Result<String, SignalingError> {
        let phase = self.state.phase();
        match tokio::time::timeout(self.handshake_timeout, self.recv()).await {
            Err(_) => Err(SignalingError::Timeout(phase)),
            Ok(Ok(Some(text))) => Ok(text),
            Ok(Ok(None)) => Err(SignalingError::Disconnected(phase)),
            Ok(Err(e)) => Err(e),
        }
    }

    /// Tear down: release the registry reference, then close the connection
    async fn finish(&mut self, result: &Result<(), SignalingError>) -> SignalingPhase {
        let client = self.ctx.client_id;
        let was_active = self.state.is_active();
        let ended_in = self.state.close();

        if let Some((source_id, _session)) = self.attached.take() {
            let torn_down = self.registry.release(&source_id, client).await;
            tracing::debug!(
                client = %client,
                source = %source_id,
                session_closed = torn_down,
                "Registry reference released"
            );
        }

        match result {
            Ok(()) => {
                self.channel.close(CloseReason::normal()).await;
                tracing::info!(
                    client = %client,
                    source = self.state.source_id().map(SourceId::as_str),
                    phase = %ended_in,
                    duration_ms = self.ctx.duration().as_millis() as u64,
                    streamed_ms = self.state.active_duration().map_or(0, |d| d.as_millis() as u64),
                    "Client session closed"
                );
            }
            Err(e) if e.is_disconnect() => {
                // Completes a close handshake the client may have started
                self.channel.close(CloseReason::normal()).await;
                tracing::info!(client = %client, phase = %ended_in, "Client left during handshake");
            }
            Err(e) => {
                tracing::warn!(
                    client = %client,
                    peer = %self.ctx.peer_addr,
                    phase = %ended_in,
                    was_streaming = was_active,
                    error = %e,
                    "Client session failed"
                );
                if let Some(reason) = e.close_reason() {
                    self.channel.close(reason).await;
                }
            }
        }

        ended_in
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::net::SocketAddr;

    use parking_lot::Mutex;

    use super::*;
    use crate::capture::{Frame, FrameSource, SourceError, SourceFactory};
    use crate::protocol::SessionDescription;
    use crate::registry::{ClientId, RegistryConfig};
    use crate::session::channel::ChannelError;
    use crate::transport::LoopbackTransport;

    #[derive(Default)]
    struct Transcript {
        sent: Vec<String>,
        closed: Option<CloseReason>,
    }

    /// Scripted client: replays inbound messages, then hangs or disconnects
    struct ScriptedChannel {
        inbound: VecDeque<Result<String, ChannelError>>,
        hang_when_done: bool,
        transcript: Arc<Mutex<Transcript>>,
    }

    impl ScriptedChannel {
        fn new(inbound: Vec<Result<String, ChannelError>>, hang_when_done: bool) -> (Self, Arc<Mutex<Transcript>>) {
            let transcript = Arc::new(Mutex::new(Transcript::default()));
            let channel = Self {
                inbound: inbound.into(),
                hang_when_done,
                transcript: Arc::clone(&transcript),
            };
            (channel, transcript)
        }
    }

    #[async_trait::async_trait]
    impl SignalChannel for ScriptedChannel {
        async fn recv(&mut self) -> Result<Option<String>, ChannelError> {
            match self.inbound.pop_front() {
                Some(Ok(text)) => Ok(Some(text)),
                Some(Err(e)) => Err(e),
                None if self.hang_when_done => std::future::pending().await,
                None => Ok(None),
            }
        }

        async fn send(&mut self, text: String) -> Result<(), ChannelError> {
            self.transcript.lock().sent.push(text);
            Ok(())
        }

        async fn close(&mut self, reason: CloseReason) {
            self.transcript.lock().closed = Some(reason);
        }
    }

    fn answer() -> String {
        SessionDescription::answer("v=0\r\n").to_json().unwrap()
    }

    fn text(s: &str) -> Result<String, ChannelError> {
        Ok(s.to_string())
    }

    fn registry() -> Arc<SessionRegistry<LoopbackTransport>> {
        let config = RegistryConfig::default().stop_timeout(Duration::from_millis(500));
        Arc::new(SessionRegistry::with_config(LoopbackTransport::new(), config))
    }

    fn handler(
        registry: &Arc<SessionRegistry<LoopbackTransport>>,
        channel: ScriptedChannel,
        client: u64,
    ) -> SignalingHandler<LoopbackTransport, ScriptedChannel> {
        let addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        SignalingHandler::new(
            ClientContext::new(ClientId(client), addr),
            channel,
            Arc::clone(registry),
            Duration::from_millis(200),
            CancellationToken::new(),
        )
    }

    fn source() -> SourceId {
        SourceId::parse("pattern://8x8").unwrap()
    }

    #[tokio::test]
    async fn test_full_handshake_then_close() {
        let registry = registry();
        let (channel, transcript) =
            ScriptedChannel::new(vec![text("pattern://8x8"), Ok(answer()), text("CLOSE")], true);

        let phase = handler(&registry, channel, 1).run().await.unwrap();
        assert_eq!(phase, SignalingPhase::Active);

        let transcript = transcript.lock();
        assert_eq!(transcript.sent.len(), 1);
        let offer = SessionDescription::from_json(&transcript.sent[0]).unwrap();
        assert_eq!(offer.kind, crate::protocol::SdpType::Offer);
        assert!(!offer.sdp.is_empty());
        assert_eq!(transcript.closed.as_ref().map(|r| r.code), Some(1000));

        assert_eq!(registry.session_count().await, 0);
        assert_eq!(registry.transport().peers_closed(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_while_active_releases() {
        let registry = registry();
        let (channel, _) = ScriptedChannel::new(vec![text("pattern://8x8"), Ok(answer())], false);

        let phase = handler(&registry, channel, 1).run().await.unwrap();
        assert_eq!(phase, SignalingPhase::Active);
        assert_eq!(registry.reference_count(&source()).await, 0);
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_source_identifier() {
        let registry = registry();
        let (channel, transcript) = ScriptedChannel::new(vec![text("not a url")], true);

        let err = handler(&registry, channel, 1).run().await.unwrap_err();
        assert!(matches!(err, SignalingError::Protocol(ProtocolError::InvalidSource(_))));
        assert_eq!(transcript.lock().closed.as_ref().map(|r| r.code), Some(1002));
        assert!(transcript.lock().sent.is_empty());
        assert_eq!(registry.sessions_created(), 0);
    }

    #[tokio::test]
    async fn test_answer_before_source_rejected() {
        let registry = registry();
        let (channel, _) = ScriptedChannel::new(vec![Ok(answer())], true);

        let err = handler(&registry, channel, 1).run().await.unwrap_err();
        assert!(matches!(err, SignalingError::Protocol(ProtocolError::InvalidSource(_))));
    }

    #[tokio::test]
    async fn test_second_source_identifier_rejected() {
        let registry = registry();
        let (channel, transcript) =
            ScriptedChannel::new(vec![text("pattern://8x8"), text("pattern://8x8")], true);

        let err = handler(&registry, channel, 1).run().await.unwrap_err();
        assert!(matches!(
            err,
            SignalingError::Protocol(ProtocolError::UnexpectedMessage { .. })
        ));
        assert_eq!(transcript.lock().sent.len(), 1);
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_offer_as_answer_rejected() {
        let registry = registry();
        let offer = SessionDescription::offer("v=0\r\n").to_json().unwrap();
        let (channel, _) = ScriptedChannel::new(vec![text("pattern://8x8"), Ok(offer)], true);

        let err = handler(&registry, channel, 1).run().await.unwrap_err();
        assert!(matches!(
            err,
            SignalingError::Protocol(ProtocolError::UnexpectedDescriptionType { .. })
        ));
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_unexpected_message_while_active() {
        let registry = registry();
        let (channel, transcript) = ScriptedChannel::new(
            vec![text("pattern://8x8"), Ok(answer()), text("hello")],
            true,
        );

        let err = handler(&registry, channel, 1).run().await.unwrap_err();
        assert!(matches!(
            err,
            SignalingError::Protocol(ProtocolError::UnexpectedMessage { .. })
        ));
        assert_eq!(transcript.lock().closed.as_ref().map(|r| r.code), Some(1002));
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_binary_message_rejected() {
        let registry = registry();
        let (channel, _) = ScriptedChannel::new(vec![Err(ChannelError::Binary)], true);

        let err = handler(&registry, channel, 1).run().await.unwrap_err();
        assert_eq!(err, SignalingError::Protocol(ProtocolError::BinaryMessage));
    }

    #[tokio::test]
    async fn test_source_connect_failure_reported() {
        let registry = registry();
        let (channel, transcript) = ScriptedChannel::new(vec![text("pattern://0x0")], true);

        let err = handler(&registry, channel, 1).run().await.unwrap_err();
        assert!(matches!(err, SignalingError::Registry(_)));
        assert_eq!(transcript.lock().closed.as_ref().map(|r| r.code), Some(1011));
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let registry = registry();
        let (channel, transcript) = ScriptedChannel::new(vec![text("pattern://8x8")], true);

        let err = handler(&registry, channel, 1).run().await.unwrap_err();
        assert_eq!(err, SignalingError::Timeout(SignalingPhase::Offered));
        assert_eq!(transcript.lock().closed.as_ref().map(|r| r.code), Some(1002));
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_during_handshake() {
        let registry = registry();
        let (channel, transcript) = ScriptedChannel::new(vec![text("pattern://8x8")], false);

        let err = handler(&registry, channel, 1).run().await.unwrap_err();
        assert!(err.is_disconnect());
        assert_eq!(transcript.lock().closed.as_ref().map(|r| r.code), Some(1000));
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_ends_active_session() {
        let registry = registry();
        let (channel, transcript) = ScriptedChannel::new(vec![text("pattern://8x8"), Ok(answer())], true);
        let shutdown = CancellationToken::new();

        let addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let handler = SignalingHandler::new(
            ClientContext::new(ClientId(1), addr),
            channel,
            Arc::clone(&registry),
            Duration::from_secs(5),
            shutdown.clone(),
        );
        let task = tokio::spawn(handler.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err, SignalingError::ShuttingDown);
        assert_eq!(transcript.lock().closed.as_ref().map(|r| r.code), Some(1001));
        assert_eq!(registry.session_count().await, 0);
    }

    /// Upstream that accepts the connection but never finishes connecting
    #[derive(Default)]
    struct SilentSource {
        closed: std::sync::atomic::AtomicBool,
    }

    impl FrameSource for SilentSource {
        fn connect(&self, source_id: &SourceId) -> Result<(), SourceError> {
            while !self.closed.load(std::sync::atomic::Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(SourceError::connect(source_id, "closed while connecting"))
        }

        fn read_frame(&self) -> Result<Frame, SourceError> {
            Err(SourceError::Read("not connected".into()))
        }

        fn close(&self) {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    struct SilentSources;

    impl SourceFactory for SilentSources {
        fn create(&self, _source_id: &SourceId) -> Result<Arc<dyn FrameSource>, SourceError> {
            Ok(Arc::new(SilentSource::default()))
        }
    }

    #[tokio::test]
    async fn test_shutdown_while_source_opens() {
        let config = RegistryConfig::default().stop_timeout(Duration::from_millis(500));
        let registry = Arc::new(SessionRegistry::with_sources(
            LoopbackTransport::new(),
            Arc::new(SilentSources),
            config,
        ));
        let (channel, transcript) = ScriptedChannel::new(vec![text("rtsp://cam1")], true);
        let shutdown = CancellationToken::new();

        let addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let handler = SignalingHandler::new(
            ClientContext::new(ClientId(1), addr),
            channel,
            Arc::clone(&registry),
            Duration::from_secs(30),
            shutdown.clone(),
        );
        let task = tokio::spawn(handler.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());
        shutdown.cancel();

        let err = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("handler stuck behind a stalled open")
            .unwrap()
            .unwrap_err();
        assert_eq!(err, SignalingError::ShuttingDown);
        assert_eq!(transcript.lock().closed.as_ref().map(|r| r.code), Some(1001));
        assert!(transcript.lock().sent.is_empty());
        assert_eq!(registry.session_count().await, 0);
    }
}
