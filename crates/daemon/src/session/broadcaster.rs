//! Session output broadcaster.
//!
//! This module fans PTY output out to every attached consumer. Each consumer
//! owns a bounded queue; when a slow consumer's queue overflows, its oldest
//! buffered chunks are discarded so the shared reader never waits on it.
//! Consumers only see output produced after they attached.

use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use webterm_protocol::SessionId;

/// Unique identifier for a consumer within one session.
pub type ConsumerId = u64;

/// Default number of chunks a consumer may have buffered.
pub const DEFAULT_QUEUE_CHUNKS: usize = 256;

/// Default number of bytes a consumer may have buffered.
pub const DEFAULT_QUEUE_BYTES: usize = 1024 * 1024;

/// Default buffer size for reading from the PTY.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Per-consumer buffering limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Maximum number of buffered chunks.
    pub max_chunks: usize,
    /// Maximum number of buffered bytes. A single chunk larger than this is
    /// still delivered on its own.
    pub max_bytes: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_chunks: DEFAULT_QUEUE_CHUNKS,
            max_bytes: DEFAULT_QUEUE_BYTES,
        }
    }
}

/// Statistics about a consumer's delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Chunks accepted into the consumer's queue.
    pub chunks_queued: u64,
    /// Chunks discarded because the queue overflowed.
    pub chunks_dropped: u64,
    /// Bytes discarded because the queue overflowed.
    pub bytes_dropped: u64,
    /// Whether the consumer is currently losing data.
    pub is_backpressured: bool,
}

#[derive(Default)]
struct QueueState {
    chunks: VecDeque<Bytes>,
    buffered_bytes: usize,
    closed: bool,
    stats: ConsumerStats,
}

/// Bounded drop-oldest queue feeding one consumer.
struct ConsumerQueue {
    id: ConsumerId,
    limits: QueueLimits,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ConsumerQueue {
    fn new(id: ConsumerId, limits: QueueLimits) -> Self {
        Self {
            id,
            limits,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a chunk without ever blocking.
    ///
    /// Returns false if the queue is closed or older data had to be dropped.
    fn push(&self, chunk: Bytes) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }

        state.buffered_bytes += chunk.len();
        state.chunks.push_back(chunk);
        state.stats.chunks_queued += 1;

        let mut dropped = false;
        while state.chunks.len() > 1
            && (state.chunks.len() > self.limits.max_chunks
                || state.buffered_bytes > self.limits.max_bytes)
        {
            if let Some(old) = state.chunks.pop_front() {
                state.buffered_bytes -= old.len();
                state.stats.chunks_dropped += 1;
                state.stats.bytes_dropped += old.len() as u64;
                dropped = true;
            }
        }

        if dropped && !state.stats.is_backpressured {
            state.stats.is_backpressured = true;
            tracing::warn!(
                consumer_id = self.id,
                dropped = state.stats.chunks_dropped,
                "Consumer is backpressured, dropping oldest output"
            );
        }
        drop(state);

        self.notify.notify_one();
        !dropped
    }

    /// Marks the queue closed. With `discard`, pending chunks are thrown away.
    fn close(&self, discard: bool) {
        let mut state = self.lock();
        state.closed = true;
        if discard {
            state.chunks.clear();
            state.buffered_bytes = 0;
        }
        drop(state);
        self.notify.notify_one();
    }

    async fn recv(&self) -> Option<Bytes> {
        loop {
            {
                let mut state = self.lock();
                if let Some(chunk) = state.chunks.pop_front() {
                    state.buffered_bytes -= chunk.len();
                    if state.chunks.is_empty() && state.stats.is_backpressured {
                        state.stats.is_backpressured = false;
                        tracing::debug!(consumer_id = self.id, "Consumer recovered from backpressure");
                    }
                    return Some(chunk);
                }
                if state.closed {
                    return None;
                }
            }
            // A permit stored by push/close between the unlock and here
            // completes this immediately.
            self.notify.notified().await;
        }
    }

    fn stats(&self) -> ConsumerStats {
        self.lock().stats.clone()
    }
}

struct Consumers {
    queues: HashMap<ConsumerId, Arc<ConsumerQueue>>,
    finished: bool,
}

struct BroadcasterInner {
    session_id: SessionId,
    limits: QueueLimits,
    consumers: Mutex<Consumers>,
    next_id: AtomicU64,
    /// Last output timestamp (Unix epoch milliseconds).
    last_activity: AtomicU64,
    reading: AtomicBool,
    finished_tx: watch::Sender<bool>,
}

impl BroadcasterInner {
    fn lock(&self) -> MutexGuard<'_, Consumers> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: ConsumerId) -> bool {
        self.lock().queues.remove(&id).is_some()
    }
}

/// A consumer attached to a session's output.
///
/// Receives every chunk produced while it is attached, in production order.
/// Dropping the subscription detaches it.
pub struct Subscription {
    id: ConsumerId,
    session_id: SessionId,
    queue: Arc<ConsumerQueue>,
    broadcaster: Weak<BroadcasterInner>,
    detached: bool,
}

impl Subscription {
    /// Returns the consumer ID.
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Returns the session this subscription reads from.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Receives the next chunk, or `None` at end-of-stream or after detach.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.queue.recv().await
    }

    /// Stops delivery to this consumer. Idempotent.
    pub fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;

        let removed = self
            .broadcaster
            .upgrade()
            .map(|inner| inner.remove(self.id))
            .unwrap_or(false);
        self.queue.close(true);

        if removed {
            tracing::debug!(
                session_id = %self.session_id,
                consumer_id = self.id,
                "Consumer detached"
            );
        }
    }

    /// Returns whether [`detach`](Self::detach) has run.
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Returns this consumer's delivery statistics.
    pub fn stats(&self) -> ConsumerStats {
        self.queue.stats()
    }

    /// Converts the subscription into a stream of chunks.
    ///
    /// The stream owns the subscription, so dropping the stream (for example
    /// when an HTTP client goes away) detaches the consumer.
    pub fn into_stream(self) -> impl Stream<Item = Bytes> + Send + 'static {
        futures_util::stream::unfold(self, |mut subscription| async move {
            let chunk = subscription.recv().await?;
            Some((chunk, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("detached", &self.detached)
            .finish()
    }
}

/// Broadcasts PTY output to multiple attached consumers.
///
/// Cloning yields another handle to the same broadcaster.
#[derive(Clone)]
pub struct OutputBroadcaster {
    inner: Arc<BroadcasterInner>,
}

impl OutputBroadcaster {
    /// Creates a new broadcaster for `session_id`.
    pub fn new(session_id: SessionId, limits: QueueLimits) -> Self {
        let (finished_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(BroadcasterInner {
                session_id,
                limits,
                consumers: Mutex::new(Consumers {
                    queues: HashMap::new(),
                    finished: false,
                }),
                next_id: AtomicU64::new(1),
                last_activity: AtomicU64::new(now_millis()),
                reading: AtomicBool::new(false),
                finished_tx,
            }),
        }
    }

    /// Returns the session this broadcaster serves.
    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    /// Attaches a new consumer.
    ///
    /// After [`finish`](Self::finish) the returned subscription is already
    /// at end-of-stream.
    pub fn attach(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(ConsumerQueue::new(id, self.inner.limits));

        let mut consumers = self.inner.lock();
        if consumers.finished {
            queue.close(false);
        } else {
            consumers.queues.insert(id, Arc::clone(&queue));
        }
        let count = consumers.queues.len();
        drop(consumers);

        tracing::debug!(
            session_id = %self.inner.session_id,
            consumer_id = id,
            consumers = count,
            "Consumer attached"
        );

        Subscription {
            id,
            session_id: self.inner.session_id.clone(),
            queue,
            broadcaster: Arc::downgrade(&self.inner),
            detached: false,
        }
    }

    /// Removes a consumer by ID. Idempotent; returns whether it was attached.
    pub fn detach(&self, id: ConsumerId) -> bool {
        let queue = self.inner.lock().queues.remove(&id);
        match queue {
            Some(queue) => {
                queue.close(true);
                true
            }
            None => false,
        }
    }

    /// Delivers a chunk to every attached consumer.
    ///
    /// Never blocks on a consumer. Returns the number of consumers that
    /// received the chunk without losing older data.
    pub fn broadcast(&self, chunk: Bytes) -> usize {
        self.inner
            .last_activity
            .store(now_millis(), Ordering::Relaxed);

        let consumers = self.inner.lock();
        if consumers.finished {
            return 0;
        }
        consumers
            .queues
            .values()
            .filter(|queue| queue.push(chunk.clone()))
            .count()
    }

    /// Signals end-of-stream to every consumer and discards them. Idempotent.
    ///
    /// Consumers still receive what was queued before the call.
    pub fn finish(&self) {
        let mut consumers = self.inner.lock();
        if consumers.finished {
            return;
        }
        consumers.finished = true;
        let queues: Vec<_> = consumers.queues.drain().map(|(_, q)| q).collect();
        drop(consumers);

        for queue in &queues {
            queue.close(false);
        }
        self.inner.finished_tx.send_replace(true);

        tracing::debug!(
            session_id = %self.inner.session_id,
            consumers = queues.len(),
            "Output stream finished"
        );
    }

    /// Returns whether [`finish`](Self::finish) has run.
    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// Waits until the stream is finished, up to `timeout`.
    ///
    /// Returns whether it finished in time.
    pub async fn wait_finished(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.finished_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|finished| *finished))
            .await
            .map(|res| res.is_ok())
            .unwrap_or(false)
    }

    /// Returns the number of attached consumers.
    pub fn consumer_count(&self) -> usize {
        self.inner.lock().queues.len()
    }

    /// Returns statistics for a specific consumer.
    pub fn consumer_stats(&self, id: ConsumerId) -> Option<ConsumerStats> {
        self.inner.lock().queues.get(&id).map(|q| q.stats())
    }

    /// Returns statistics for all attached consumers.
    pub fn all_consumer_stats(&self) -> HashMap<ConsumerId, ConsumerStats> {
        self.inner
            .lock()
            .queues
            .iter()
            .map(|(id, q)| (*id, q.stats()))
            .collect()
    }

    /// Returns the last output timestamp in Unix milliseconds.
    pub fn last_activity(&self) -> u64 {
        self.inner.last_activity.load(Ordering::Relaxed)
    }

    /// Returns whether the reader loop is running.
    pub fn is_reading(&self) -> bool {
        self.inner.reading.load(Ordering::SeqCst)
    }

    /// Starts the PTY reader loop.
    ///
    /// Reads `reader` on the blocking pool and broadcasts every chunk until
    /// EOF or a read error, then finishes the stream. Returns `None` if a
    /// reader loop was already started.
    pub fn start_reader_loop<R>(&self, reader: R, buffer_size: usize) -> Option<JoinHandle<()>>
    where
        R: Read + Send + 'static,
    {
        if self.inner.reading.swap(true, Ordering::SeqCst) {
            tracing::warn!(session_id = %self.inner.session_id, "Reader loop already running");
            return None;
        }

        let broadcaster = self.clone();
        let reader = Arc::new(Mutex::new(reader));
        let buffer_size = buffer_size.max(1);

        Some(tokio::spawn(async move {
            let session_id = broadcaster.session_id().clone();

            loop {
                let reader = Arc::clone(&reader);
                let result = tokio::task::spawn_blocking(move || {
                    let mut buffer = vec![0u8; buffer_size];
                    let mut reader = reader.lock().unwrap_or_else(PoisonError::into_inner);
                    match reader.read(&mut buffer) {
                        Ok(0) => Ok(None),
                        Ok(n) => {
                            buffer.truncate(n);
                            Ok(Some(buffer))
                        }
                        Err(e) => Err(e),
                    }
                })
                .await;

                match result {
                    Ok(Ok(Some(data))) => {
                        if broadcaster.is_finished() {
                            break;
                        }
                        broadcaster.broadcast(Bytes::from(data));
                    }
                    Ok(Ok(None)) => {
                        tracing::debug!(session_id = %session_id, "PTY EOF");
                        break;
                    }
                    Ok(Err(e)) => {
                        // Linux reports EIO once the slave side is gone.
                        tracing::debug!(session_id = %session_id, error = %e, "PTY read ended");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(session_id = %session_id, error = %e, "Read task panicked");
                        break;
                    }
                }
            }

            broadcaster.inner.reading.store(false, Ordering::SeqCst);
            broadcaster.finish();
            tracing::debug!(session_id = %session_id, "Reader loop ended");
        }))
    }
}

/// Returns the current Unix timestamp in milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
