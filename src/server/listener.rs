//! Signaling server listener
//!
//! Handles the TCP accept loop, upgrades connections to WebSocket and spawns
//! one signaling handler per client.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::registry::{ClientId, SessionRegistry};
use crate::server::config::ServerConfig;
use crate::session::{ClientContext, SignalingHandler};
use crate::stats::ServerStats;
use crate::transport::MediaTransport;

/// WebSocket signaling server
pub struct RelayServer<T: MediaTransport> {
    config: ServerConfig,
    registry: Arc<SessionRegistry<T>>,
    stats: Arc<ServerStats>,
    next_client_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
}

impl<T: MediaTransport> RelayServer<T> {
    /// Create a new server serving sessions from `registry`
    pub fn new(config: ServerConfig, registry: Arc<SessionRegistry<T>>) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config,
            registry,
            stats: Arc::new(ServerStats::new()),
            next_client_id: AtomicU64::new(1),
            connection_semaphore,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get a reference to the session registry
    pub fn registry(&self) -> &Arc<SessionRegistry<T>> {
        &self.registry
    }

    /// Connection counters
    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Get the configured bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Token cancelled when the server shuts down
    ///
    /// Cancelling it stops the accept loop and ends every client session
    /// with a "going away" close frame.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the server
    ///
    /// This method blocks until the shutdown token is cancelled.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;

        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                self.shutdown.cancel();
                Ok(())
            }
            result = self.serve(listener) => result,
        }
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "Relay server listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!(
                        total = self.stats.total_connections(),
                        rejected = self.stats.rejected_connections(),
                        "Relay server stopped accepting"
                    );
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit; over-limit sockets never see a WebSocket handshake
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.stats.connection_rejected();
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let client_id = ClientId(self.next_client_id.fetch_add(1, Ordering::Relaxed));

        tracing::debug!(client = %client_id, peer = %peer_addr, "New connection");

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        let registry = Arc::clone(&self.registry);
        let stats = Arc::clone(&self.stats);
        let shutdown = self.shutdown.clone();
        let handshake_timeout = self.config.handshake_timeout;

        stats.connection_opened();

        tokio::spawn(async move {
            // Held for the lifetime of the connection
            let _permit = permit;

            let upgrade = tokio::time::timeout(
                handshake_timeout,
                tokio_tungstenite::accept_async(socket),
            )
            .await;

            match upgrade {
                Ok(Ok(ws)) => {
                    let ctx = ClientContext::new(client_id, peer_addr);
                    let handler =
                        SignalingHandler::new(ctx, ws, registry, handshake_timeout, shutdown);

                    if let Err(e) = handler.run().await {
                        tracing::debug!(client = %client_id, error = %e, "Connection error");
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!(client = %client_id, error = %e, "WebSocket upgrade failed");
                }
                Err(_) => {
                    tracing::debug!(client = %client_id, "WebSocket upgrade timed out");
                }
            }

            stats.connection_closed();
            tracing::debug!(client = %client_id, "Connection closed");
        });
    }
}
