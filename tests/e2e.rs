//! End-to-end signaling over real WebSocket connections
//!
//! Uses the loopback transport and an in-memory camera so the tests need
//! neither network media nor ffmpeg.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;

use rtc_relay::capture::{Frame, FrameSource, PixelFormat, SourceError, SourceFactory};
use rtc_relay::client::ViewerClient;
use rtc_relay::protocol::{SdpType, SessionDescription};
use rtc_relay::registry::{RegistryConfig, SessionRegistry, SourceId};
use rtc_relay::server::{RelayServer, ServerConfig};
use rtc_relay::transport::LoopbackTransport;

#[derive(Default)]
struct CameraCounters {
    connects: AtomicU64,
    closes: AtomicU64,
}

/// 2x2 camera producing a frame every 10ms; host `refused` cannot connect
struct FakeCamera {
    counters: Arc<CameraCounters>,
    closed: AtomicBool,
}

impl FrameSource for FakeCamera {
    fn connect(&self, source_id: &SourceId) -> Result<(), SourceError> {
        if source_id.url().host_str() == Some("refused") {
            return Err(SourceError::connect(source_id, "connection refused"));
        }
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_frame(&self) -> Result<Frame, SourceError> {
        std::thread::sleep(Duration::from_millis(10));
        if self.closed.load(Ordering::SeqCst) {
            return Err(SourceError::Read("closed".into()));
        }
        Ok(Frame::new(Bytes::from(vec![0u8; 12]), 2, 2, PixelFormat::Bgr24))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct FakeCameras {
    counters: Arc<CameraCounters>,
}

impl SourceFactory for FakeCameras {
    fn create(&self, _source_id: &SourceId) -> Result<Arc<dyn FrameSource>, SourceError> {
        Ok(Arc::new(FakeCamera {
            counters: Arc::clone(&self.counters),
            closed: AtomicBool::new(false),
        }))
    }
}

struct Relay {
    url: String,
    server: Arc<RelayServer<LoopbackTransport>>,
    cameras: Arc<CameraCounters>,
}

impl Relay {
    async fn start(reuse: bool) -> Self {
        let cameras = Arc::new(CameraCounters::default());
        let factory = Arc::new(FakeCameras {
            counters: Arc::clone(&cameras),
        });
        let config = RegistryConfig::default()
            .reuse_sessions(reuse)
            .stop_timeout(Duration::from_millis(500));
        let registry = Arc::new(SessionRegistry::with_sources(
            LoopbackTransport::new(),
            factory,
            config,
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let server = Arc::new(RelayServer::new(
            ServerConfig::default().handshake_timeout(Duration::from_secs(5)),
            registry,
        ));

        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve(listener).await });

        Self {
            url: format!("ws://{addr}"),
            server,
            cameras,
        }
    }

    fn registry(&self) -> &Arc<SessionRegistry<LoopbackTransport>> {
        self.server.registry()
    }

    async fn viewer(&self) -> ViewerClient {
        ViewerClient::connect(&self.url).await.unwrap()
    }

    async fn stop(self) {
        self.server.shutdown_token().cancel();
        self.registry().shutdown().await;
    }
}

fn answer() -> SessionDescription {
    SessionDescription::answer("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n")
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_handshake_reaches_active() {
    let relay = Relay::start(true).await;
    let mut viewer = relay.viewer().await;

    let offer = viewer.request("rtsp://cam1").await.unwrap();
    assert_eq!(offer.kind, SdpType::Offer);
    assert!(!offer.sdp.is_empty());

    viewer.send_answer(&answer()).await.unwrap();

    // Frames reach the track once the session is up
    let transport = relay.registry().transport().clone();
    wait_for(|| {
        let transport = transport.clone();
        async move { transport.frames_written() > 0 }
    })
    .await;

    // CLOSE is only honoured while active
    let reason = viewer.close().await.unwrap().unwrap();
    assert_eq!(reason.code, 1000);

    relay.stop().await;
}

#[tokio::test]
async fn test_two_viewers_share_one_upstream() {
    let relay = Relay::start(true).await;

    let mut first = relay.viewer().await;
    let mut second = relay.viewer().await;

    first.request("rtsp://cam1").await.unwrap();
    second.request("rtsp://cam1").await.unwrap();
    first.send_answer(&answer()).await.unwrap();
    second.send_answer(&answer()).await.unwrap();

    let source = SourceId::parse("rtsp://cam1").unwrap();
    assert_eq!(relay.registry().sessions_created(), 1);
    assert_eq!(relay.cameras.connects.load(Ordering::SeqCst), 1);
    assert_eq!(relay.registry().reference_count(&source).await, 2);

    // The first viewer leaving keeps the upstream alive for the second
    assert_eq!(first.close().await.unwrap().map(|r| r.code), Some(1000));
    assert_eq!(relay.registry().reference_count(&source).await, 1);
    assert_eq!(relay.cameras.closes.load(Ordering::SeqCst), 0);

    assert_eq!(second.close().await.unwrap().map(|r| r.code), Some(1000));
    assert_eq!(relay.registry().session_count().await, 0);
    assert_eq!(relay.cameras.closes.load(Ordering::SeqCst), 1);

    relay.stop().await;
}

#[tokio::test]
async fn test_close_releases_last_reference() {
    let relay = Relay::start(true).await;
    let mut viewer = relay.viewer().await;

    viewer.request("rtsp://cam1").await.unwrap();
    viewer.send_answer(&answer()).await.unwrap();

    viewer.close().await.unwrap();

    // Released before the close frame went out
    assert_eq!(relay.registry().session_count().await, 0);
    assert_eq!(relay.cameras.closes.load(Ordering::SeqCst), 1);
    assert_eq!(relay.registry().transport().peers_closed(), 1);

    relay.stop().await;
}

#[tokio::test]
async fn test_disconnect_releases_reference() {
    let relay = Relay::start(true).await;
    let mut viewer = relay.viewer().await;

    viewer.request("rtsp://cam1").await.unwrap();
    viewer.send_answer(&answer()).await.unwrap();
    drop(viewer);

    let registry = Arc::clone(relay.registry());
    wait_for(|| {
        let registry = Arc::clone(&registry);
        async move { registry.session_count().await == 0 }
    })
    .await;
    assert_eq!(relay.cameras.closes.load(Ordering::SeqCst), 1);

    relay.stop().await;
}

#[tokio::test]
async fn test_connect_failure_reported_as_internal_error() {
    let relay = Relay::start(true).await;
    let mut viewer = relay.viewer().await;

    let err = viewer.request("rtsp://refused").await.unwrap_err();
    assert_eq!(err.close_reason().map(|r| r.code), Some(1011));
    assert_eq!(relay.registry().session_count().await, 0);
    assert_eq!(relay.cameras.connects.load(Ordering::SeqCst), 0);

    relay.stop().await;
}

#[tokio::test]
async fn test_reuse_disabled_opens_private_sessions() {
    let relay = Relay::start(false).await;

    let mut first = relay.viewer().await;
    let mut second = relay.viewer().await;
    first.request("rtsp://cam1").await.unwrap();
    second.request("rtsp://cam1").await.unwrap();

    assert_eq!(relay.registry().sessions_created(), 2);
    assert_eq!(relay.cameras.connects.load(Ordering::SeqCst), 2);

    first.send_answer(&answer()).await.unwrap();
    first.close().await.unwrap();
    assert_eq!(relay.cameras.closes.load(Ordering::SeqCst), 1);
    assert_eq!(relay.registry().session_count().await, 1);

    let cameras = Arc::clone(&relay.cameras);
    relay.stop().await;

    // The second viewer's handler may still be releasing its session
    wait_for(|| {
        let cameras = Arc::clone(&cameras);
        async move { cameras.closes.load(Ordering::SeqCst) == 2 }
    })
    .await;
}

#[tokio::test]
async fn test_message_while_active_is_protocol_error() {
    let relay = Relay::start(true).await;
    let mut viewer = relay.viewer().await;

    viewer.request("rtsp://cam1").await.unwrap();
    viewer.send_answer(&answer()).await.unwrap();
    viewer.send_text("rtsp://cam2").await.unwrap();

    let reason = viewer.closed().await.unwrap().unwrap();
    assert_eq!(reason.code, 1002);
    assert_eq!(relay.registry().session_count().await, 0);

    relay.stop().await;
}

#[tokio::test]
async fn test_malformed_answer_is_protocol_error() {
    let relay = Relay::start(true).await;
    let mut viewer = relay.viewer().await;

    viewer.request("rtsp://cam1").await.unwrap();
    viewer.send_text(r#"{"sdp":"","type":"answer"}"#).await.unwrap();

    let reason = viewer.closed().await.unwrap().unwrap();
    assert_eq!(reason.code, 1002);
    assert!(!reason.reason.is_empty());
    assert_eq!(relay.registry().session_count().await, 0);
    assert_eq!(relay.cameras.closes.load(Ordering::SeqCst), 1);

    relay.stop().await;
}

#[tokio::test]
async fn test_invalid_source_identifier() {
    let relay = Relay::start(true).await;
    let mut viewer = relay.viewer().await;

    let err = viewer.request("cam 1").await.unwrap_err();
    assert_eq!(err.close_reason().map(|r| r.code), Some(1002));
    assert_eq!(relay.registry().sessions_created(), 0);

    relay.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_viewers_and_upstreams() {
    let relay = Relay::start(true).await;
    let mut viewer = relay.viewer().await;

    viewer.request("rtsp://cam1").await.unwrap();
    viewer.send_answer(&answer()).await.unwrap();

    let cameras = Arc::clone(&relay.cameras);
    relay.server.shutdown_token().cancel();

    let reason = viewer.closed().await.unwrap().unwrap();
    assert_eq!(reason.code, 1001);

    relay.stop().await;
    wait_for(|| {
        let cameras = Arc::clone(&cameras);
        async move { cameras.closes.load(Ordering::SeqCst) == 1 }
    })
    .await;
}
