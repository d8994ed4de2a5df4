//! rtc-relay server binary
//!
//! Run with: rtc-relay --port 8080
//!
//! Then open a WebSocket to `ws://localhost:8080`, send a source identifier
//! (`rtsp://camera/stream`, or `pattern://640x480?fps=30` for generated
//! colour bars), and answer the offer that comes back.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rtc_relay::capture::{
    DefaultSourceFactory, FfmpegConfig, DEFAULT_BUFFER_CAPACITY, DEFAULT_CONNECT_TIMEOUT,
};
use rtc_relay::registry::{RegistryConfig, SessionRegistry};
use rtc_relay::server::{RelayServer, ServerConfig, DEFAULT_PORT};
use rtc_relay::transport::{WebRtcConfig, WebRtcTransport, DEFAULT_KEYFRAME_INTERVAL};

#[derive(Parser, Debug)]
#[command(name = "rtc-relay", version, about = "Relay blocking video sources to WebRTC viewers")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Give every client its own upstream session instead of sharing
    #[arg(long)]
    no_reuse: bool,

    /// Frames buffered between capture and delivery
    #[arg(long, default_value_t = DEFAULT_BUFFER_CAPACITY)]
    buffer_capacity: usize,

    /// Maximum concurrent connections (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_connections: usize,

    /// Seconds allowed for each handshake step
    #[arg(long, default_value_t = 30)]
    handshake_timeout: u64,

    /// STUN/TURN server URL (repeatable)
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    /// ffmpeg executable used to decode upstream sources
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: String,

    /// Width of decoded frames
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Height of decoded frames
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Seconds allowed for an upstream to deliver its first frame
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT.as_secs())]
    connect_timeout: u64,

    /// Frames between forced H.264 keyframes
    #[arg(long, default_value_t = DEFAULT_KEYFRAME_INTERVAL)]
    keyframe_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut webrtc = WebRtcConfig::default().keyframe_interval(args.keyframe_interval);
    if !args.ice_servers.is_empty() {
        webrtc = webrtc.ice_servers(args.ice_servers);
    }
    let transport = WebRtcTransport::new(webrtc).context("failed to set up WebRTC")?;

    let sources = Arc::new(DefaultSourceFactory::new(
        FfmpegConfig::default()
            .program(args.ffmpeg)
            .size(args.width, args.height)
            .connect_timeout(Duration::from_secs(args.connect_timeout)),
    ));
    let registry_config = RegistryConfig::default()
        .reuse_sessions(!args.no_reuse)
        .buffer_capacity(args.buffer_capacity);
    let registry = Arc::new(SessionRegistry::with_sources(transport, sources, registry_config));

    let config = ServerConfig::default()
        .bind(SocketAddr::new(args.host, args.port))
        .max_connections(args.max_connections)
        .handshake_timeout(Duration::from_secs(args.handshake_timeout));

    tracing::info!(
        addr = %config.bind_addr,
        reuse = !args.no_reuse,
        buffer_capacity = args.buffer_capacity,
        "Starting relay"
    );

    let server = RelayServer::new(config, Arc::clone(&registry));
    let result = server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    registry.shutdown().await;
    tracing::info!(
        sessions_created = registry.sessions_created(),
        connections = server.stats().total_connections(),
        "Relay stopped"
    );

    result.context("server failed")
}
