//! Session registry implementation
//!
//! Maps upstream source identifiers to live upstream sessions and counts the
//! clients attached to each. The state mutex is only held for bookkeeping,
//! never across I/O. Opening a source goes through a per-source pending slot:
//! the first caller runs the open, concurrent callers for the same source
//! wait on the slot and share its result, and callers for other sources are
//! not held up at all.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;

use super::config::RegistryConfig;
use super::error::RegistryError;
use super::key::{ClientId, SourceId};
use crate::capture::SourceFactory;
use crate::transport::MediaTransport;
use crate::upstream::{UpstreamFactory, UpstreamSession};

type OpenResult<T> = Result<Arc<UpstreamSession<T>>, RegistryError>;

/// An open in flight; every waiter for the source shares its outcome
type PendingOpen<T> = Arc<OnceCell<OpenResult<T>>>;

struct SharedEntry<T: MediaTransport> {
    session: Arc<UpstreamSession<T>>,
    clients: HashSet<ClientId>,
}

struct RegistryState<T: MediaTransport> {
    /// Sessions shared by source, when reuse is enabled
    shared: HashMap<SourceId, SharedEntry<T>>,
    /// One session per client, when reuse is disabled
    private: HashMap<ClientId, Arc<UpstreamSession<T>>>,
    /// Shared opens not yet registered
    opening: HashMap<SourceId, PendingOpen<T>>,
    shutting_down: bool,
}

impl<T: MediaTransport> RegistryState<T> {
    fn is_attached(&self, client: ClientId) -> bool {
        self.private.contains_key(&client)
            || self.shared.values().any(|entry| entry.clients.contains(&client))
    }

    /// Pending slot for `source_id`, replacing one that holds a stale failure
    fn pending(&mut self, source_id: &SourceId) -> PendingOpen<T> {
        let slot = self.opening.entry(source_id.clone()).or_default();
        if matches!(slot.get(), Some(Err(_))) {
            *slot = Arc::default();
        }
        Arc::clone(slot)
    }
}

/// Registry of live upstream sessions
pub struct SessionRegistry<T: MediaTransport> {
    state: Mutex<RegistryState<T>>,
    factory: UpstreamFactory<T>,
    config: RegistryConfig,
    /// Cancelled by `shutdown`; aborts opens still in flight
    closing: CancellationToken,
    next_session_id: AtomicU64,
    sessions_created: AtomicU64,
}

impl<T: MediaTransport> SessionRegistry<T> {
    /// Create a registry with default configuration
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, RegistryConfig::default())
    }

    /// Create a registry with custom configuration
    pub fn with_config(transport: T, config: RegistryConfig) -> Self {
        let factory = UpstreamFactory::new(transport, config.capture.clone());
        Self::with_factory(factory, config)
    }

    /// Create a registry opening sources through a custom factory
    pub fn with_sources(transport: T, sources: Arc<dyn SourceFactory>, config: RegistryConfig) -> Self {
        let factory = UpstreamFactory::with_sources(Arc::new(transport), sources, config.capture.clone());
        Self::with_factory(factory, config)
    }

    fn with_factory(factory: UpstreamFactory<T>, config: RegistryConfig) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                shared: HashMap::new(),
                private: HashMap::new(),
                opening: HashMap::new(),
                shutting_down: false,
            }),
            factory,
            config,
            closing: CancellationToken::new(),
            next_session_id: AtomicU64::new(1),
            sessions_created: AtomicU64::new(0),
        }
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Get the media transport sessions are opened with
    pub fn transport(&self) -> &Arc<T> {
        self.factory.transport()
    }

    /// Get the session for `source_id`, opening it if needed, and attach `client`
    ///
    /// With reuse disabled every call opens a private session. A failed open
    /// registers nothing. Concurrent calls for the same unseen source share
    /// one open. `shutdown` makes calls still waiting on an open return
    /// [`RegistryError::ShuttingDown`].
    pub async fn get_or_create(&self, source_id: &SourceId, client: ClientId) -> OpenResult<T> {
        if !self.config.reuse_sessions {
            return self.create_private(source_id, client).await;
        }

        loop {
            let pending = {
                let mut state = self.state.lock().await;

                if state.shutting_down {
                    return Err(RegistryError::ShuttingDown);
                }
                if state.is_attached(client) {
                    return Err(RegistryError::AlreadyAttached(client));
                }

                if let Some(entry) = state.shared.get_mut(source_id) {
                    if !entry.session.is_closed() {
                        entry.clients.insert(client);

                        tracing::info!(
                            source = %source_id,
                            client = %client,
                            session_id = entry.session.id(),
                            clients = entry.clients.len(),
                            "Client attached (existing session)"
                        );
                        return Ok(Arc::clone(&entry.session));
                    }
                    state.shared.remove(source_id);
                }

                state.pending(source_id)
            };

            let opened = tokio::select! {
                _ = self.closing.cancelled() => Err(RegistryError::ShuttingDown),
                result = pending.get_or_init(|| self.open(source_id)) => result.clone(),
            };

            let mut state = self.state.lock().await;

            // The first waiter back registers the session; the rest find it in `shared`
            let first = state
                .opening
                .get(source_id)
                .is_some_and(|slot| Arc::ptr_eq(slot, &pending));
            if first {
                state.opening.remove(source_id);
            }

            let session = opened?;

            let refused = if state.shutting_down {
                Some(RegistryError::ShuttingDown)
            } else if state.is_attached(client) {
                Some(RegistryError::AlreadyAttached(client))
            } else {
                None
            };
            if let Some(err) = refused {
                drop(state);
                if first || err == RegistryError::ShuttingDown {
                    session.close().await;
                }
                return Err(err);
            }

            if first {
                state.shared.insert(
                    source_id.clone(),
                    SharedEntry {
                        session: Arc::clone(&session),
                        clients: HashSet::from([client]),
                    },
                );

                tracing::info!(
                    source = %source_id,
                    client = %client,
                    session_id = session.id(),
                    "Client attached (new session)"
                );
                return Ok(session);
            }

            match state.shared.get_mut(source_id) {
                Some(entry) if Arc::ptr_eq(&entry.session, &session) && !session.is_closed() => {
                    entry.clients.insert(client);

                    tracing::info!(
                        source = %source_id,
                        client = %client,
                        session_id = session.id(),
                        clients = entry.clients.len(),
                        "Client attached (joined open)"
                    );
                    return Ok(session);
                }
                // Torn down before this waiter got back; start over
                _ => continue,
            }
        }
    }

    async fn create_private(&self, source_id: &SourceId, client: ClientId) -> OpenResult<T> {
        {
            let state = self.state.lock().await;
            if state.shutting_down {
                return Err(RegistryError::ShuttingDown);
            }
            if state.is_attached(client) {
                return Err(RegistryError::AlreadyAttached(client));
            }
        }

        let session = tokio::select! {
            _ = self.closing.cancelled() => return Err(RegistryError::ShuttingDown),
            result = self.open(source_id) => result?,
        };

        let mut state = self.state.lock().await;
        let refused = if state.shutting_down {
            Some(RegistryError::ShuttingDown)
        } else if state.is_attached(client) {
            Some(RegistryError::AlreadyAttached(client))
        } else {
            None
        };
        if let Some(err) = refused {
            drop(state);
            session.close().await;
            return Err(err);
        }

        state.private.insert(client, Arc::clone(&session));

        tracing::info!(
            source = %source_id,
            client = %client,
            session_id = session.id(),
            "Client attached (private session)"
        );
        Ok(session)
    }

    async fn open(&self, source_id: &SourceId) -> OpenResult<T> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = UpstreamSession::open(id, source_id.clone(), &self.factory).await?;
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
        Ok(session)
    }

    /// Drop `client`'s reference to `source_id`
    ///
    /// Detaches the client's peer connection. When this was the last
    /// reference the session is unregistered, then closed before returning.
    /// Returns whether the session was torn down.
    pub async fn release(&self, source_id: &SourceId, client: ClientId) -> bool {
        let (session, last) = {
            let mut state = self.state.lock().await;

            let owns_private = state
                .private
                .get(&client)
                .is_some_and(|session| session.source_id() == source_id);

            if owns_private {
                match state.private.remove(&client) {
                    Some(session) => (session, true),
                    None => return false,
                }
            } else {
                let Some(entry) = state.shared.get_mut(source_id) else {
                    tracing::debug!(source = %source_id, client = %client, "Release for unknown source ignored");
                    return false;
                };
                if !entry.clients.remove(&client) {
                    tracing::debug!(source = %source_id, client = %client, "Release for unattached client ignored");
                    return false;
                }

                let session = Arc::clone(&entry.session);
                let remaining = entry.clients.len();
                if remaining == 0 {
                    state.shared.remove(source_id);
                } else {
                    tracing::info!(
                        source = %source_id,
                        client = %client,
                        session_id = session.id(),
                        clients = remaining,
                        "Client released"
                    );
                }
                (session, remaining == 0)
            }
        };

        session.detach(client).await;
        if !last {
            return false;
        }

        session.close().await;
        tracing::info!(
            source = %source_id,
            client = %client,
            session_id = session.id(),
            "Last client released, session closed"
        );
        true
    }

    /// Close every session and refuse new ones
    ///
    /// Opens still in flight are abandoned; their callers get
    /// [`RegistryError::ShuttingDown`].
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<UpstreamSession<T>>> = {
            let mut state = self.state.lock().await;
            state.shutting_down = true;
            self.closing.cancel();

            let mut sessions: Vec<_> = state.shared.drain().map(|(_, entry)| entry.session).collect();
            sessions.extend(state.private.drain().map(|(_, session)| session));
            sessions.extend(
                state
                    .opening
                    .drain()
                    .filter_map(|(_, slot)| slot.get().and_then(|opened| opened.as_ref().ok()).cloned()),
            );
            sessions
        };

        join_all(sessions.iter().map(|session| session.close())).await;

        tracing::info!(sessions = sessions.len(), "Session registry shut down");
    }

    /// Check if `shutdown` has been called
    pub async fn is_shutting_down(&self) -> bool {
        self.state.lock().await.shutting_down
    }

    /// Number of registered sessions, shared and private
    pub async fn session_count(&self) -> usize {
        let state = self.state.lock().await;
        state.shared.len() + state.private.len()
    }

    /// Number of clients attached to sessions for `source_id`
    pub async fn reference_count(&self, source_id: &SourceId) -> usize {
        let state = self.state.lock().await;
        let shared = state
            .shared
            .get(source_id)
            .map_or(0, |entry| entry.clients.len());
        let private = state
            .private
            .values()
            .filter(|session| session.source_id() == source_id)
            .count();
        shared + private
    }

    /// Shared session registered for `source_id`, if any
    pub async fn session(&self, source_id: &SourceId) -> Option<Arc<UpstreamSession<T>>> {
        let state = self.state.lock().await;
        state.shared.get(source_id).map(|entry| Arc::clone(&entry.session))
    }

    /// Total sessions successfully opened
    pub fn sessions_created(&self) -> u64 {
        self.sessions_created.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::{Duration, Instant};

    use super::*;
    use crate::capture::{Frame, FrameSource, SourceError};
    use crate::transport::LoopbackTransport;
    use crate::upstream::UpstreamError;

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        closed: AtomicUsize,
    }

    /// Slow-connecting source that records lifecycle calls
    ///
    /// `refused://` sources fail to connect; `stalled://` sources never finish
    /// connecting until closed.
    struct SlowSource {
        counters: Arc<Counters>,
        fail_connect: bool,
        stalled: bool,
        released: AtomicBool,
    }

    impl FrameSource for SlowSource {
        fn connect(&self, source_id: &SourceId) -> Result<(), SourceError> {
            std::thread::sleep(Duration::from_millis(30));
            if self.fail_connect {
                return Err(SourceError::connect(source_id, "refused"));
            }
            if self.stalled {
                let deadline = Instant::now() + Duration::from_secs(10);
                while !self.released.load(Ordering::SeqCst) && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(10));
                }
                return Err(SourceError::connect(source_id, "no video"));
            }
            Ok(())
        }

        fn read_frame(&self) -> Result<Frame, SourceError> {
            std::thread::sleep(Duration::from_millis(5));
            Err(SourceError::Read("idle".into()))
        }

        fn close(&self) {
            self.released.store(true, Ordering::SeqCst);
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct SlowFactory {
        counters: Arc<Counters>,
    }

    impl SourceFactory for SlowFactory {
        fn create(&self, source_id: &SourceId) -> Result<Arc<dyn FrameSource>, SourceError> {
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(SlowSource {
                counters: Arc::clone(&self.counters),
                fail_connect: source_id.scheme() == "refused",
                stalled: source_id.scheme() == "stalled",
                released: AtomicBool::new(false),
            }))
        }
    }

    fn registry(config: RegistryConfig) -> (Arc<SessionRegistry<LoopbackTransport>>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let factory = Arc::new(SlowFactory {
            counters: Arc::clone(&counters),
        });
        let registry = SessionRegistry::with_sources(LoopbackTransport::new(), factory, config);
        (Arc::new(registry), counters)
    }

    fn id(s: &str) -> SourceId {
        SourceId::parse(s).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_opens_once() {
        let (registry, counters) = registry(RegistryConfig::default());
        let source = id("rtsp://cam1");

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let source = source.clone();
                tokio::spawn(async move { registry.get_or_create(&source, ClientId(i)).await.unwrap() })
            })
            .collect();

        let sessions: Vec<_> = join_all(tasks).await.into_iter().map(Result::unwrap).collect();

        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.sessions_created(), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(registry.reference_count(&source).await, 8);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_release_last_reference_tears_down() {
        let (registry, counters) = registry(RegistryConfig::default());
        let source = id("rtsp://cam1");

        let session = registry.get_or_create(&source, ClientId(1)).await.unwrap();
        registry.get_or_create(&source, ClientId(2)).await.unwrap();

        assert!(!registry.release(&source, ClientId(1)).await);
        assert!(!session.is_closed());
        assert_eq!(registry.reference_count(&source).await, 1);

        assert!(registry.release(&source, ClientId(2)).await);
        // Teardown completed synchronously
        assert!(session.is_closed());
        assert!(!session.is_capturing());
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_release_unknown_is_noop() {
        let (registry, _) = registry(RegistryConfig::default());
        let source = id("rtsp://cam1");

        assert!(!registry.release(&source, ClientId(1)).await);

        registry.get_or_create(&source, ClientId(1)).await.unwrap();
        assert!(!registry.release(&source, ClientId(99)).await);
        assert!(!registry.release(&id("rtsp://cam2"), ClientId(1)).await);
        assert_eq!(registry.reference_count(&source).await, 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_failure_registers_nothing() {
        let (registry, counters) = registry(RegistryConfig::default());
        let source = id("refused://cam1");

        let err = registry.get_or_create(&source, ClientId(1)).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Upstream(UpstreamError::Source(SourceError::Connect { .. }))
        ));
        assert_eq!(registry.session_count().await, 0);
        assert_eq!(registry.sessions_created(), 0);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);

        // The client can try again
        assert!(registry.get_or_create(&source, ClientId(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_no_reuse_gives_private_sessions() {
        let (registry, counters) = registry(RegistryConfig::default().reuse_sessions(false));
        let source = id("rtsp://cam1");

        let a = registry.get_or_create(&source, ClientId(1)).await.unwrap();
        let b = registry.get_or_create(&source, ClientId(2)).await.unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
        assert_eq!(registry.session_count().await, 2);
        assert_eq!(registry.reference_count(&source).await, 2);
        assert!(registry.session(&source).await.is_none());

        assert!(registry.release(&source, ClientId(1)).await);
        assert!(a.is_closed());
        assert!(!b.is_closed());

        registry.shutdown().await;
        assert!(b.is_closed());
    }

    #[tokio::test]
    async fn test_already_attached() {
        let (registry, _) = registry(RegistryConfig::default());

        registry.get_or_create(&id("rtsp://cam1"), ClientId(1)).await.unwrap();
        let err = registry
            .get_or_create(&id("rtsp://cam2"), ClientId(1))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::AlreadyAttached(ClientId(1)));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (registry, counters) = registry(RegistryConfig::default());

        let a = registry.get_or_create(&id("rtsp://cam1"), ClientId(1)).await.unwrap();
        let b = registry.get_or_create(&id("rtsp://cam2"), ClientId(2)).await.unwrap();

        registry.shutdown().await;

        assert!(a.is_closed() && b.is_closed());
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
        assert_eq!(registry.session_count().await, 0);
        assert!(registry.is_shutting_down().await);
        assert_eq!(
            registry.get_or_create(&id("rtsp://cam1"), ClientId(3)).await.unwrap_err(),
            RegistryError::ShuttingDown
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stalled_open_does_not_block_other_sources() {
        let (registry, _) = registry(RegistryConfig::default());

        let stalled = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.get_or_create(&id("stalled://cam0"), ClientId(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let other = tokio::time::timeout(
            Duration::from_secs(2),
            registry.get_or_create(&id("rtsp://cam1"), ClientId(2)),
        )
        .await
        .expect("open of another source blocked")
        .unwrap();
        assert!(!other.is_closed());

        let count = tokio::time::timeout(Duration::from_secs(1), registry.session_count())
            .await
            .expect("registry lock held across open");
        assert_eq!(count, 1);
        assert!(!stalled.is_finished());

        registry.release(&id("rtsp://cam1"), ClientId(2)).await;
        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_aborts_stalled_open() {
        let (registry, counters) = registry(RegistryConfig::default());

        let waiters: Vec<_> = (0..2)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.get_or_create(&id("stalled://cam0"), ClientId(i)).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(2), registry.shutdown())
            .await
            .expect("shutdown blocked by a stalled open");

        for waiter in waiters {
            let result = tokio::time::timeout(Duration::from_secs(2), waiter)
                .await
                .expect("waiter not woken by shutdown")
                .unwrap();
            assert_eq!(result.unwrap_err(), RegistryError::ShuttingDown);
        }

        // Only one open was attempted for the two waiters
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.sessions_created(), 0);
    }

    #[tokio::test]
    async fn test_failed_open_can_be_retried() {
        let (registry, counters) = registry(RegistryConfig::default());
        let source = id("refused://cam1");

        assert!(registry.get_or_create(&source, ClientId(1)).await.is_err());
        assert!(registry.get_or_create(&source, ClientId(2)).await.is_err());

        // Each attempt opened afresh instead of replaying the first failure
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
    }
}
