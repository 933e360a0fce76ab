//! Subscriber Sessions
//!
//! A [`SubscriberSession`] is the state bound to one subscriber: its sink,
//! filter, delivery cursor, completion signal and dispatch queue. Sessions
//! are created by the registry and handed to callers as `Arc`s.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::dispatch_queue::{BatchHandler, DispatchQueue};
use crate::application::ports::StreamSink;
use crate::domain::streaming::{ItemId, StreamBatch};
use crate::domain::subscription::{
    DeliveryCursor, SessionId, SessionState, StalePolicy, StreamFilter,
};

// =============================================================================
// Stream Info
// =============================================================================

/// Transport-side description of a subscriber, supplied at subscribe time.
pub struct StreamInfo<B> {
    sink: Arc<dyn StreamSink<B>>,
    cancellation: Option<CancellationToken>,
    keys: Vec<String>,
    peer: String,
}

impl<B: StreamBatch> StreamInfo<B> {
    /// Create stream info for a sink with no keys and an anonymous peer.
    #[must_use]
    pub fn new(sink: Arc<dyn StreamSink<B>>) -> Self {
        Self {
            sink,
            cancellation: None,
            keys: Vec::new(),
            peer: String::from("anonymous"),
        }
    }

    /// Set the peer descriptor used in logs.
    #[must_use]
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    /// Set the partition keys (tenant and similar tags).
    #[must_use]
    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Attach the transport's cancellation signal.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// The subscriber's sink.
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn StreamSink<B>> {
        &self.sink
    }

    /// The transport's cancellation signal, if any.
    #[must_use]
    pub const fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    /// Partition keys.
    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Peer descriptor.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl<B> std::fmt::Debug for StreamInfo<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamInfo")
            .field("peer", &self.peer)
            .field("keys", &self.keys)
            .field("cancellable", &self.cancellation.is_some())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Subscriber Session
// =============================================================================

struct DeliveryState<B: StreamBatch> {
    cursor: DeliveryCursor<ItemId<B>>,
    last_sent: Option<B>,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    /// Session id.
    pub id: SessionId,
    /// Lifecycle state.
    pub state: SessionState,
    /// Batches waiting in the dispatch queue.
    pub pending_batches: usize,
    /// Successful sink writes, pings included.
    pub writes: u64,
    /// When the session was registered.
    pub registered_at: DateTime<Utc>,
}

/// State bound to one subscriber.
pub struct SubscriberSession<B: StreamBatch> {
    id: SessionId,
    info: StreamInfo<B>,
    filter: Box<dyn StreamFilter<B::Item>>,
    delivery: Mutex<DeliveryState<B>>,
    state: RwLock<SessionState>,
    completion: CancellationToken,
    queue: DispatchQueue<B>,
    registered_at: DateTime<Utc>,
    writes: AtomicU64,
}

impl<B: StreamBatch> SubscriberSession<B> {
    /// Build a session whose queue delivers through the handler made by
    /// `handler`, which receives a weak reference to the new session.
    pub(crate) fn new<F>(
        info: StreamInfo<B>,
        filter: Box<dyn StreamFilter<B::Item>>,
        queue_capacity: usize,
        handler: F,
    ) -> Arc<Self>
    where
        F: FnOnce(&Weak<Self>) -> Arc<dyn BatchHandler<B>>,
    {
        Arc::new_cyclic(|weak| Self {
            id: SessionId::new(),
            info,
            filter,
            delivery: Mutex::new(DeliveryState {
                cursor: DeliveryCursor::new(),
                last_sent: None,
            }),
            state: RwLock::new(SessionState::Registered),
            completion: CancellationToken::new(),
            queue: DispatchQueue::new(queue_capacity, handler(weak)),
            registered_at: Utc::now(),
            writes: AtomicU64::new(0),
        })
    }

    /// Session id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Peer descriptor.
    #[must_use]
    pub fn peer(&self) -> &str {
        self.info.peer()
    }

    /// Partition keys.
    #[must_use]
    pub fn keys(&self) -> &[String] {
        self.info.keys()
    }

    /// Transport-side description.
    #[must_use]
    pub const fn info(&self) -> &StreamInfo<B> {
        &self.info
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Id of the last delivered item.
    #[must_use]
    pub fn cursor(&self) -> Option<ItemId<B>> {
        self.delivery.lock().cursor.position().cloned()
    }

    /// Last batch written with data, as sent after post-processing.
    #[must_use]
    pub fn last_sent(&self) -> Option<B> {
        self.delivery.lock().last_sent.clone()
    }

    /// Batches waiting in the dispatch queue.
    #[must_use]
    pub fn pending_batches(&self) -> usize {
        self.queue.len()
    }

    /// Whether the transport has signalled cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.info
            .cancellation()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Whether the session has been removed from its registry.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completion.is_cancelled()
    }

    /// Resolves once the session is removed.
    ///
    /// A transport awaits this to know when to close its connection.
    pub async fn completed(&self) {
        self.completion.cancelled().await;
    }

    /// Successful sink writes, pings included.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// When the session was registered.
    #[must_use]
    pub const fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Snapshot of the session.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            id: self.id,
            state: self.state(),
            pending_batches: self.pending_batches(),
            writes: self.writes(),
            registered_at: self.registered_at,
        }
    }

    /// Whether every item in the batch passes the filter.
    #[must_use]
    pub fn is_matched(&self, batch: &B) -> bool {
        batch
            .items()
            .iter()
            .all(|item| self.filter.is_matched(item))
    }

    pub(crate) const fn queue(&self) -> &DispatchQueue<B> {
        &self.queue
    }

    pub(crate) fn sink(&self) -> &Arc<dyn StreamSink<B>> {
        self.info.sink()
    }

    pub(crate) fn is_stale(&self, batch: &B, policy: StalePolicy) -> bool {
        self.delivery.lock().cursor.is_stale(batch.items(), policy)
    }

    /// `Registered → Active`, starting the dispatch worker.
    pub(crate) fn activate(&self) -> bool {
        {
            let mut state = self.state.write();
            if *state != SessionState::Registered {
                return false;
            }
            *state = SessionState::Active;
        }
        self.queue.start()
    }

    /// Move to `Removed`, resolve completion and close the queue.
    ///
    /// Returns `false` if the session was already removed.
    pub(crate) fn mark_removed(&self) -> bool {
        {
            let mut state = self.state.write();
            if *state == SessionState::Removed {
                return false;
            }
            *state = SessionState::Removed;
        }
        self.completion.cancel();
        self.queue.close();
        true
    }

    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Remember a data batch and advance the cursor to its last item.
    pub(crate) fn record_delivery(&self, processed: &B) {
        let mut delivery = self.delivery.lock();
        if let Some(id) = processed.representative_id() {
            delivery.cursor.advance(id);
        }
        delivery.last_sent = Some(processed.clone());
    }
}

impl<B: StreamBatch> std::fmt::Debug for SubscriberSession<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberSession")
            .field("id", &self.id)
            .field("peer", &self.info.peer)
            .field("state", &self.state())
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
