//! A single upstream session
//!
//! Owns the source, the capture thread, the frame buffer, the outbound
//! track and the pump task between them, plus one peer connection per
//! attached client. Viewers of the same upstream share the track.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{UpstreamError, UpstreamFactory};
use crate::capture::{CaptureWorker, FrameBuffer, FrameSampler, FrameSource};
use crate::protocol::SessionDescription;
use crate::registry::{ClientId, SourceId};
use crate::stats::{CaptureSnapshot, CaptureStats};
use crate::transport::{MediaTrack, MediaTransport, PeerConnection};

struct PeerSlot<P> {
    peer: Arc<P>,
    answered: bool,
}

/// One live connection to one upstream source
pub struct UpstreamSession<T: MediaTransport> {
    id: u64,
    source_id: SourceId,
    transport: Arc<T>,
    source: Arc<dyn FrameSource>,
    buffer: Arc<FrameBuffer>,
    stats: Arc<CaptureStats>,
    stop_timeout: Duration,
    worker: Mutex<Option<CaptureWorker>>,
    track: Mutex<Option<Arc<T::Track>>>,
    peers: Mutex<HashMap<ClientId, PeerSlot<T::Peer>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl<T: MediaTransport> UpstreamSession<T> {
    /// Connect to the upstream and start capturing
    ///
    /// The blocking connect runs on the blocking pool. Whatever was started
    /// before a failure is torn down again before the error is returned.
    pub async fn open(
        id: u64,
        source_id: SourceId,
        factory: &UpstreamFactory<T>,
    ) -> Result<Arc<Self>, UpstreamError> {
        let source = factory.sources().create(&source_id)?;
        let capture = factory.capture_config();

        let session = Arc::new(Self {
            id,
            source_id,
            transport: Arc::clone(factory.transport()),
            source,
            buffer: Arc::new(FrameBuffer::new(capture.buffer_capacity)),
            stats: Arc::new(CaptureStats::new()),
            stop_timeout: capture.stop_timeout,
            worker: Mutex::new(None),
            track: Mutex::new(None),
            peers: Mutex::new(HashMap::new()),
            pump: Mutex::new(None),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        if let Err(e) = session.start(factory).await {
            tracing::warn!(
                session_id = id,
                source = %session.source_id,
                error = %e,
                "Failed to open upstream session"
            );
            session.close().await;
            return Err(e);
        }

        tracing::info!(
            session_id = id,
            source = %session.source_id,
            buffer_capacity = session.buffer.capacity(),
            "Upstream session opened"
        );
        Ok(session)
    }

    async fn start(&self, factory: &UpstreamFactory<T>) -> Result<(), UpstreamError> {
        let source = Arc::clone(&self.source);
        let source_id = self.source_id.clone();
        tokio::task::spawn_blocking(move || source.connect(&source_id))
            .await
            .map_err(|e| UpstreamError::Blocking(e.to_string()))??;

        let worker = CaptureWorker::spawn(
            self.id,
            Arc::clone(&self.source),
            Arc::clone(&self.buffer),
            Arc::clone(&self.stats),
            factory.capture_config(),
        )
        .map_err(|e| UpstreamError::Spawn(e.to_string()))?;
        *self.worker.lock() = Some(worker);

        let track = self.transport.create_track(&self.source_id)?;
        *self.track.lock() = Some(Arc::clone(&track));

        let sampler = FrameSampler::new(
            Arc::clone(&self.buffer),
            track.pixel_format(),
            self.cancel.child_token(),
            Arc::clone(&self.stats),
        );
        let handle = tokio::spawn(pump(self.id, sampler, track));
        *self.pump.lock() = Some(handle);

        Ok(())
    }

    /// Session id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Upstream source this session is connected to
    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    /// Check if the session has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Capture counters
    pub fn stats(&self) -> CaptureSnapshot {
        self.stats.snapshot()
    }

    /// Number of attached peer connections
    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Check if the capture thread is running
    pub fn is_capturing(&self) -> bool {
        self.worker.lock().as_ref().is_some_and(CaptureWorker::is_running)
    }

    /// Create a peer connection for `client` and return its offer
    pub async fn create_offer(&self, client: ClientId) -> Result<SessionDescription, UpstreamError> {
        if self.is_closed() {
            return Err(UpstreamError::negotiation("upstream session is closed"));
        }
        if self.peers.lock().contains_key(&client) {
            return Err(UpstreamError::negotiation("offer already created for this client"));
        }

        let track = self
            .track
            .lock()
            .clone()
            .ok_or_else(|| UpstreamError::negotiation("upstream session has no track"))?;
        let peer = Arc::new(self.transport.create_peer(&track).await?);

        let rejected = {
            let mut peers = self.peers.lock();
            if self.is_closed() {
                Some("upstream session is closed")
            } else if peers.contains_key(&client) {
                Some("offer already created for this client")
            } else {
                peers.insert(
                    client,
                    PeerSlot {
                        peer: Arc::clone(&peer),
                        answered: false,
                    },
                );
                None
            }
        };
        if let Some(reason) = rejected {
            peer.close().await;
            return Err(UpstreamError::negotiation(reason));
        }

        match peer.create_offer().await {
            Ok(offer) => {
                tracing::debug!(session_id = self.id, client = %client, "Offer created");
                Ok(offer)
            }
            Err(e) => {
                self.peers.lock().remove(&client);
                peer.close().await;
                Err(e.into())
            }
        }
    }

    /// Apply `client`'s answer to its pending offer
    pub async fn apply_answer(
        &self,
        client: ClientId,
        answer: SessionDescription,
    ) -> Result<(), UpstreamError> {
        if self.is_closed() {
            return Err(UpstreamError::negotiation("upstream session is closed"));
        }

        let peer = {
            let mut peers = self.peers.lock();
            let slot = peers
                .get_mut(&client)
                .ok_or_else(|| UpstreamError::negotiation("answer without a pending offer"))?;
            if slot.answered {
                return Err(UpstreamError::negotiation("answer already applied"));
            }
            slot.answered = true;
            Arc::clone(&slot.peer)
        };

        peer.apply_answer(answer).await?;
        tracing::debug!(session_id = self.id, client = %client, "Answer applied");
        Ok(())
    }

    /// Close and forget `client`'s peer connection
    pub async fn detach(&self, client: ClientId) {
        let slot = self.peers.lock().remove(&client);
        if let Some(slot) = slot {
            slot.peer.close().await;
            tracing::debug!(session_id = self.id, client = %client, "Peer detached");
        }
    }

    /// Tear the session down
    ///
    /// Idempotent and safe on a half-opened session. The capture thread is
    /// stopped with a bounded wait before the source is closed, so a
    /// successful stop guarantees no further buffer writes.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();

        let worker = self.worker.lock().take();
        let source = Arc::clone(&self.source);
        let stop_timeout = self.stop_timeout;
        let stopped = tokio::task::spawn_blocking(move || {
            let stopped = match worker {
                Some(mut worker) => worker.stop(stop_timeout),
                None => true,
            };
            source.close();
            stopped
        })
        .await
        .unwrap_or(false);

        let peers: Vec<Arc<T::Peer>> = self.peers.lock().drain().map(|(_, slot)| slot.peer).collect();
        for peer in &peers {
            peer.close().await;
        }

        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        self.track.lock().take();

        let stats = self.stats.snapshot();
        tracing::info!(
            session_id = self.id,
            source = %self.source_id,
            capture_stopped = stopped,
            peers_closed = peers.len(),
            frames_captured = stats.frames_captured,
            frames_dropped = stats.frames_dropped,
            frames_delivered = stats.frames_delivered,
            read_errors = stats.read_errors,
            capture_fps = stats.capture_fps(),
            "Upstream session closed"
        );
    }
}

impl<T: MediaTransport> Drop for UpstreamSession<T> {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            tracing::warn!(session_id = self.id, source = %self.source_id, "Upstream session dropped without close");
            self.cancel.cancel();
            // Unblock the capture thread before the worker's own drop joins it
            self.source.close();
        }

        // Joining may take up to the stop timeout; keep it off runtime threads
        if let Some(worker) = self.worker.get_mut().take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(move || drop(worker));
                }
                Err(_) => drop(worker),
            }
        }
    }
}

impl<T: MediaTransport> std::fmt::Debug for UpstreamSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSession")
            .field("id", &self.id)
            .field("source_id", &self.source_id.as_str())
            .field("closed", &self.is_closed())
            .field("peers", &self.peer_count())
            .finish()
    }
}

/// Move frames from the sampler to the track until cancelled
async fn pump<K: MediaTrack>(session_id: u64, mut sampler: FrameSampler, track: Arc<K>) {
    let mut failures: u64 = 0;

    while let Some(frame) = sampler.next().await {
        match track.write_frame(&frame).await {
            Ok(()) => {
                if failures > 0 {
                    tracing::info!(session_id = session_id, failures = failures, "Track writes recovered");
                    failures = 0;
                }
            }
            Err(e) => {
                failures += 1;
                if failures == 1 {
                    tracing::warn!(session_id = session_id, error = %e, "Track write failed");
                } else {
                    tracing::debug!(session_id = session_id, error = %e, failures = failures, "Track write failed");
                }
            }
        }
    }

    tracing::debug!(session_id = session_id, "Pump stopped");
}
