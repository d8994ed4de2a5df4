//! Bounded drop-oldest frame buffer
//!
//! The only synchronization point between a capture thread and the async
//! consumer. The producer never blocks: when the buffer is full the oldest
//! frame is evicted to make room. The consumer awaits a `Notify` instead of
//! polling.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;
use tokio::sync::Notify;

use super::frame::Frame;

/// Default buffer capacity in frames
pub const DEFAULT_BUFFER_CAPACITY: usize = 30;

/// Bounded FIFO of captured frames with drop-oldest eviction
pub struct FrameBuffer {
    queue: ArrayQueue<Frame>,
    ready: Notify,
    pushed: AtomicU64,
    evicted: AtomicU64,
}

impl FrameBuffer {
    /// Create a buffer holding at most `capacity` frames (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            ready: Notify::new(),
            pushed: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Insert a frame, evicting the oldest one if full
    ///
    /// Returns the evicted frame, if any.
    pub fn push(&self, frame: Frame) -> Option<Frame> {
        let evicted = self.queue.force_push(frame);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        if evicted.is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
        evicted
    }

    /// Take the oldest frame without waiting
    pub fn try_pop(&self) -> Option<Frame> {
        self.queue.pop()
    }

    /// Take the oldest frame, waiting until one is available
    pub async fn pop(&self) -> Frame {
        loop {
            // Register interest before checking so a push between the check
            // and the await is not missed.
            let notified = self.ready.notified();
            if let Some(frame) = self.queue.pop() {
                return frame;
            }
            notified.await;
        }
    }

    /// Number of buffered frames
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if no frames are buffered
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Maximum number of buffered frames
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Total frames ever pushed
    pub fn pushed_count(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Total frames evicted to make room
    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("evicted", &self.evicted_count())
            .finish()
    }
}
