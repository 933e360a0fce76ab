//! Stream Registry
//!
//! Holds the live set of subscriber sessions and fans published batches out
//! to them.
//!
//! # Paths
//!
//! - **Live**: single-item batches are matched against each session's filter
//!   and enqueued on its dispatch queue. Publishing never waits on a sink.
//! - **Historical**: backfill batches are written directly to every session,
//!   one after another, and the call returns once every write was attempted.
//! - **Ping**: the last sent batch (or an empty batch) is replayed to keep
//!   transports alive.
//!
//! All three pass through one delivery routine that drops stale batches,
//! writes to the sink and advances the session cursor. A failed write removes
//! that one session; nothing propagates to the publisher.
//!
//! # Maintenance
//!
//! Two background loops run while the registry lives: a health sweep that
//! reaps sessions whose transport cancelled, and an optional ping loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::dispatch_queue::{BatchHandler, DeliveryKind};
use super::session::{StreamInfo, SubscriberSession};
use crate::application::ports::{HookError, NoHooks, StreamHooks};
use crate::domain::streaming::{DEFAULT_HEAP_CAPACITY, StreamBatch};
use crate::domain::subscription::{SessionState, StalePolicy, StreamFilter};
use crate::infrastructure::metrics::{self, DeliveryPath, RemovalReason};

// =============================================================================
// Configuration and Errors
// =============================================================================

/// Shortest period the sweep and ping loops run at.
pub const MIN_LOOP_PERIOD: Duration = Duration::from_millis(10);

/// Registry behaviour settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Period of the cancelled-session sweep. Floored at [`MIN_LOOP_PERIOD`].
    pub sweep_interval: Duration,
    /// Period of the ping loop; `None` disables pinging.
    pub ping_interval: Option<Duration>,
    /// Bound on after-removed hooks during [`StreamRegistry::stop`].
    pub removal_timeout: Duration,
    /// Initial heap capacity of each dispatch queue.
    pub queue_capacity: usize,
    /// When a batch counts as already delivered.
    pub stale_policy: StalePolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10),
            ping_interval: None,
            removal_timeout: Duration::from_secs(60),
            queue_capacity: DEFAULT_HEAP_CAPACITY,
            stale_policy: StalePolicy::default(),
        }
    }
}

impl RegistryConfig {
    /// Enable the ping loop with the given period.
    #[must_use]
    pub const fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    /// Set the stale policy.
    #[must_use]
    pub const fn with_stale_policy(mut self, policy: StalePolicy) -> Self {
        self.stale_policy = policy;
        self
    }

    /// Raise loop periods below [`MIN_LOOP_PERIOD`] to that floor.
    fn clamped(mut self) -> Self {
        if self.sweep_interval < MIN_LOOP_PERIOD {
            tracing::warn!(
                configured = ?self.sweep_interval,
                using = ?MIN_LOOP_PERIOD,
                "Sweep interval too short, clamping"
            );
            self.sweep_interval = MIN_LOOP_PERIOD;
        }
        if let Some(period) = self.ping_interval
            && period < MIN_LOOP_PERIOD
        {
            tracing::warn!(
                configured = ?period,
                using = ?MIN_LOOP_PERIOD,
                "Ping interval too short, clamping"
            );
            self.ping_interval = Some(MIN_LOOP_PERIOD);
        }
        self
    }
}

/// Registry operation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Live batches must carry exactly one item.
    #[error("live batch must contain exactly one item, got {len}")]
    InvalidBatch {
        /// Number of items in the rejected batch.
        len: usize,
    },
    /// A lifecycle hook failed.
    #[error(transparent)]
    Hook(#[from] HookError),
    /// The registry has been stopped.
    #[error("registry stopped")]
    Stopped,
}

/// Point-in-time registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Registered sessions.
    pub sessions: usize,
    /// Sessions whose worker is running.
    pub active_sessions: usize,
    /// Sessions whose transport has cancelled but were not yet reaped.
    pub cancelled_sessions: usize,
    /// Batches waiting across all dispatch queues.
    pub pending_batches: usize,
}

// =============================================================================
// Registry
// =============================================================================

struct RegistryShared<B: StreamBatch> {
    config: RegistryConfig,
    hooks: Arc<dyn StreamHooks<B>>,
    sessions: RwLock<Vec<Arc<SubscriberSession<B>>>>,
    shutdown: CancellationToken,
    stopped: AtomicBool,
}

/// Fan-out registry over subscriber sessions.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use stream_fanout::{
///     AcceptAll, ItemBatch, RegistryConfig, StreamInfo, StreamItem, StreamRegistry,
///     channel_sink,
/// };
///
/// #[derive(Debug, Clone)]
/// struct Tick(u64);
///
/// impl StreamItem for Tick {
///     type Id = u64;
///
///     fn stream_item_id(&self) -> &u64 {
///         &self.0
///     }
/// }
///
/// async fn example() -> Result<(), Box<dyn std::error::Error>> {
///     let registry = StreamRegistry::without_hooks(RegistryConfig::default());
///     let (sink, mut rx) = channel_sink::<ItemBatch<Tick>>(64);
///
///     let session = registry
///         .subscribe(StreamInfo::new(Arc::new(sink)), AcceptAll)
///         .await?;
///     registry.publish_historical(ItemBatch::new(vec![Tick(1), Tick(2)])).await;
///     registry.activate(&session);
///     registry.publish_live(ItemBatch::single(Tick(3)))?;
///
///     while let Some(batch) = rx.recv().await {
///         println!("received {} items", batch.len());
///     }
///     registry.stop().await;
///     Ok(())
/// }
/// ```
pub struct StreamRegistry<B: StreamBatch> {
    shared: Arc<RegistryShared<B>>,
}

impl<B: StreamBatch> StreamRegistry<B> {
    /// Create a registry and start its maintenance loops.
    ///
    /// Must be called from within a Tokio runtime. Loop periods shorter
    /// than [`MIN_LOOP_PERIOD`] are raised to it.
    #[must_use]
    pub fn new<H>(config: RegistryConfig, hooks: Arc<H>) -> Self
    where
        H: StreamHooks<B> + 'static,
    {
        let config = config.clamped();
        let shared = Arc::new(RegistryShared {
            config,
            hooks,
            sessions: RwLock::new(Vec::new()),
            shutdown: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        });

        tokio::spawn(run_sweep_loop(
            Arc::downgrade(&shared),
            config.sweep_interval,
            shared.shutdown.clone(),
        ));
        if let Some(period) = config.ping_interval {
            tokio::spawn(run_ping_loop(
                Arc::downgrade(&shared),
                period,
                shared.shutdown.clone(),
            ));
        }

        tracing::info!(
            sweep_interval = ?config.sweep_interval,
            ping_interval = ?config.ping_interval,
            stale_policy = config.stale_policy.as_str(),
            "Stream registry started"
        );

        Self { shared }
    }

    /// Create a registry with no hooks.
    #[must_use]
    pub fn without_hooks(config: RegistryConfig) -> Self {
        Self::new(config, Arc::new(NoHooks))
    }

    /// The registry's settings.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    /// Register a subscriber.
    ///
    /// Runs the before-registered hook first; its error aborts the
    /// subscription. The returned session buffers live traffic but does not
    /// deliver it until [`activate`](Self::activate) is called.
    pub async fn subscribe<F>(
        &self,
        info: StreamInfo<B>,
        filter: F,
    ) -> Result<Arc<SubscriberSession<B>>, RegistryError>
    where
        F: StreamFilter<B::Item> + 'static,
    {
        if self.is_stopped() {
            return Err(RegistryError::Stopped);
        }

        self.shared.hooks.before_registered(&info).await?;

        let registry = Arc::downgrade(&self.shared);
        let session = SubscriberSession::new(
            info,
            Box::new(filter),
            self.shared.config.queue_capacity,
            |session| {
                let handler: Arc<dyn BatchHandler<B>> = Arc::new(SessionDelivery {
                    registry,
                    session: session.clone(),
                });
                handler
            },
        );

        let count = {
            let mut sessions = self.shared.sessions.write();
            if self.is_stopped() {
                drop(sessions);
                session.mark_removed();
                return Err(RegistryError::Stopped);
            }
            sessions.push(Arc::clone(&session));
            sessions.len()
        };
        metrics::set_sessions(count);

        tracing::info!(
            session_id = %session.id(),
            peer = session.peer(),
            keys = ?session.keys(),
            sessions = count,
            "Subscriber registered"
        );

        Ok(session)
    }

    /// Start delivering queued traffic to a session.
    ///
    /// Returns `false` if the session was already active or removed.
    pub fn activate(&self, session: &SubscriberSession<B>) -> bool {
        let activated = session.activate();
        if activated {
            tracing::debug!(
                session_id = %session.id(),
                pending = session.pending_batches(),
                "Subscriber activated"
            );
        }
        activated
    }

    /// Enqueue a live batch on every matching session.
    ///
    /// Returns the number of sessions the batch was enqueued on.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidBatch`] unless the batch holds exactly
    /// one item.
    pub fn publish_live(&self, batch: B) -> Result<usize, RegistryError> {
        let len = batch.items().len();
        if len != 1 {
            return Err(RegistryError::InvalidBatch { len });
        }

        let mut routed = 0;
        for session in self.shared.snapshot() {
            if session.is_cancelled() || !session.is_matched(&batch) {
                continue;
            }
            if session.queue().enqueue(batch.clone()) {
                routed += 1;
            }
        }

        metrics::record_batch_published(DeliveryPath::Live, routed);
        Ok(routed)
    }

    /// Write a backfill batch directly to every session.
    ///
    /// Sessions are served one after another, each after its in-flight
    /// delivery finishes. Filters are not applied. Returns the number of
    /// sessions a write was attempted for.
    pub async fn publish_historical(&self, batch: B) -> usize {
        let mut attempted = 0;
        for session in self.shared.snapshot() {
            if session.is_cancelled() {
                continue;
            }
            if session
                .queue()
                .deliver_now(batch.clone(), DeliveryKind::Historical)
                .await
            {
                attempted += 1;
            }
        }

        metrics::record_batch_published(DeliveryPath::Historical, attempted);
        attempted
    }

    /// Write a backfill batch to one session.
    ///
    /// Returns `false` if the session is cancelled or removed.
    pub async fn send_historical(&self, session: &SubscriberSession<B>, batch: B) -> bool {
        if session.is_cancelled() {
            return false;
        }

        let attempted = session
            .queue()
            .deliver_now(batch, DeliveryKind::Historical)
            .await;
        metrics::record_batch_published(DeliveryPath::Historical, usize::from(attempted));
        attempted
    }

    /// Remove a session.
    ///
    /// Waits for the session's worker to exit, then runs the after-removed
    /// hook. Returns `false` if the session was already removed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Hook`] if the after-removed hook fails. The
    /// session is removed regardless.
    pub async fn unsubscribe(
        &self,
        session: &Arc<SubscriberSession<B>>,
    ) -> Result<bool, RegistryError> {
        if !self.shared.detach(session, RemovalReason::Unsubscribed) {
            return Ok(false);
        }

        session.queue().shutdown().await;
        self.shared.hooks.after_removed(session).await?;
        Ok(true)
    }

    /// Remove every session whose transport has cancelled.
    ///
    /// Returns the number of sessions removed.
    pub async fn sweep_cancelled(&self) -> usize {
        self.shared.sweep_cancelled().await
    }

    /// Send a ping to every session.
    ///
    /// Returns the number of sessions pinged.
    pub async fn ping_all(&self) -> usize {
        self.shared.ping_all().await
    }

    /// Snapshot of the registered sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<SubscriberSession<B>>> {
        self.shared.snapshot()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let sessions = self.shared.sessions.read();
        let mut stats = RegistryStats {
            sessions: sessions.len(),
            ..RegistryStats::default()
        };
        for session in sessions.iter() {
            if session.state() == SessionState::Active {
                stats.active_sessions += 1;
            }
            if session.is_cancelled() {
                stats.cancelled_sessions += 1;
            }
            stats.pending_batches += session.pending_batches();
        }
        stats
    }

    /// Whether [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Stop the registry and remove every session.
    ///
    /// Cancels the maintenance loops, completes every session and closes its
    /// queue, then waits up to `removal_timeout` for the workers to exit and
    /// the after-removed hooks to finish. Hooks still running after the
    /// timeout are abandoned. Hook failures are logged per session.
    pub async fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.shutdown.cancel();

        let sessions = std::mem::take(&mut *self.shared.sessions.write());
        let removed: Vec<_> = sessions
            .into_iter()
            .filter(|session| session.mark_removed())
            .collect();
        metrics::set_sessions(0);
        metrics::record_sessions_removed(RemovalReason::Shutdown, removed.len() as u64);

        let count = removed.len();
        let mut teardown = JoinSet::new();
        for session in removed {
            let hooks = Arc::clone(&self.shared.hooks);
            teardown.spawn(async move {
                session.queue().shutdown().await;
                if let Err(e) = hooks.after_removed(&session).await {
                    tracing::warn!(
                        session_id = %session.id(),
                        peer = session.peer(),
                        error = %e,
                        "After-removed hook failed during shutdown"
                    );
                }
            });
        }

        let timeout = self.shared.config.removal_timeout;
        let joined = tokio::time::timeout(timeout, async {
            while let Some(result) = teardown.join_next().await {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Session teardown task failed");
                }
            }
        })
        .await;

        match joined {
            Ok(()) => tracing::info!(sessions = count, "Stream registry stopped"),
            Err(_) => {
                tracing::warn!(
                    sessions = count,
                    outstanding = teardown.len(),
                    timeout_secs = timeout.as_secs(),
                    "Stream registry stop timed out, abandoning remaining hooks"
                );
                teardown.detach_all();
            }
        }
    }
}

impl<B: StreamBatch> Drop for StreamRegistry<B> {
    fn drop(&mut self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.shutdown.cancel();

        let sessions = std::mem::take(&mut *self.shared.sessions.write());
        for session in &sessions {
            session.mark_removed();
        }
        tracing::debug!(sessions = sessions.len(), "Stream registry dropped without stop");
    }
}

impl<B: StreamBatch> std::fmt::Debug for StreamRegistry<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("config", &self.shared.config)
            .field("sessions", &self.shared.sessions.read().len())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Shared State
// =============================================================================

/// Outcome of one pass through the delivery routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryOutcome {
    Written,
    Stale,
    Failed,
}

impl<B: StreamBatch> RegistryShared<B> {
    fn snapshot(&self) -> Vec<Arc<SubscriberSession<B>>> {
        self.sessions.read().clone()
    }

    /// Mark a session removed and drop it from the set.
    ///
    /// Returns `false` if another path removed it first.
    fn detach(&self, session: &Arc<SubscriberSession<B>>, reason: RemovalReason) -> bool {
        if !session.mark_removed() {
            return false;
        }

        let remaining = {
            let mut sessions = self.sessions.write();
            sessions.retain(|other| !Arc::ptr_eq(other, session));
            sessions.len()
        };
        metrics::set_sessions(remaining);
        metrics::record_sessions_removed(reason, 1);

        tracing::info!(
            session_id = %session.id(),
            peer = session.peer(),
            reason = reason.as_str(),
            sessions = remaining,
            "Subscriber removed"
        );
        true
    }

    /// Remove a session from inside the registry and run its hook.
    ///
    /// Does not wait for the worker, which may be the caller.
    async fn remove(&self, session: &Arc<SubscriberSession<B>>, reason: RemovalReason) -> bool {
        if !self.detach(session, reason) {
            return false;
        }

        if let Err(e) = self.hooks.after_removed(session).await {
            tracing::warn!(
                session_id = %session.id(),
                peer = session.peer(),
                error = %e,
                "After-removed hook failed"
            );
        }
        true
    }

    async fn sweep_cancelled(&self) -> usize {
        let cancelled: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|session| session.is_cancelled())
            .collect();

        let mut removed = 0;
        for session in &cancelled {
            if self.remove(session, RemovalReason::Cancelled).await {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!(removed, "Swept cancelled subscribers");
        }
        removed
    }

    async fn ping_all(&self) -> usize {
        let pings = self
            .snapshot()
            .into_iter()
            .filter(|session| !session.is_cancelled())
            .map(|session| async move {
                let frame = session.last_sent().unwrap_or_else(B::empty);
                session.queue().deliver_now(frame, DeliveryKind::Ping).await
            });

        let pinged = futures::future::join_all(pings)
            .await
            .into_iter()
            .filter(|delivered| *delivered)
            .count();

        metrics::record_ping_pass(pinged);
        pinged
    }

    /// Deliver one batch to one session.
    ///
    /// Pings skip the stale check and leave the cursor alone. A failed write
    /// removes the session.
    async fn deliver(
        &self,
        session: &Arc<SubscriberSession<B>>,
        batch: B,
        kind: DeliveryKind,
    ) -> DeliveryOutcome {
        let path = DeliveryPath::from(kind);
        let ping = kind == DeliveryKind::Ping || batch.is_ping();

        if !ping && session.is_stale(&batch, self.config.stale_policy) {
            tracing::debug!(
                session_id = %session.id(),
                batch_id = ?batch.representative_id(),
                cursor = ?session.cursor(),
                kind = kind.as_str(),
                "Skipping stale batch"
            );
            metrics::record_stale_skip(path);
            return DeliveryOutcome::Stale;
        }

        let processed = self.hooks.process_before_send(batch, session);
        let started = Instant::now();
        let result = session.sink().write(&processed).await;
        metrics::record_sink_write_duration(path, started.elapsed());

        match result {
            Ok(()) => {
                session.record_write();
                if !ping {
                    session.record_delivery(&processed);
                }
                metrics::record_batch_delivered(path);
                DeliveryOutcome::Written
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id(),
                    peer = session.peer(),
                    kind = kind.as_str(),
                    error = %e,
                    "Sink write failed, removing subscriber"
                );
                metrics::record_sink_failure(path);
                self.remove(session, RemovalReason::SinkFailure).await;
                DeliveryOutcome::Failed
            }
        }
    }
}

/// Delivery callback installed in every session's dispatch queue.
struct SessionDelivery<B: StreamBatch> {
    registry: Weak<RegistryShared<B>>,
    session: Weak<SubscriberSession<B>>,
}

#[async_trait]
impl<B: StreamBatch> BatchHandler<B> for SessionDelivery<B> {
    async fn handle(&self, batch: B, kind: DeliveryKind) {
        let (Some(registry), Some(session)) = (self.registry.upgrade(), self.session.upgrade())
        else {
            return;
        };

        let outcome = registry.deliver(&session, batch, kind).await;
        tracing::trace!(session_id = %session.id(), ?outcome, "Delivery finished");
    }
}

// =============================================================================
// Maintenance Loops
// =============================================================================

async fn run_sweep_loop<B: StreamBatch>(
    shared: Weak<RegistryShared<B>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("Sweep loop cancelled");
                break;
            }
            _ = interval.tick() => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.sweep_cancelled().await;
            }
        }
    }
}

async fn run_ping_loop<B: StreamBatch>(
    shared: Weak<RegistryShared<B>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("Ping loop cancelled");
                break;
            }
            _ = interval.tick() => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let pinged = shared.ping_all().await;
                tracing::trace!(pinged, "Ping pass finished");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::application::ports::{SinkError, StreamSink};
    use crate::domain::streaming::{ItemBatch, StreamItem};
    use crate::domain::subscription::AcceptAll;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Item(u64);

    impl StreamItem for Item {
        type Id = u64;

        fn stream_item_id(&self) -> &u64 {
            &self.0
        }
    }

    type Batch = ItemBatch<Item>;

    #[derive(Default)]
    struct Collect {
        writes: Mutex<Vec<Vec<u64>>>,
    }

    #[async_trait]
    impl StreamSink<Batch> for Collect {
        async fn write(&self, batch: &Batch) -> Result<(), SinkError> {
            self.writes
                .lock()
                .push(batch.items().iter().map(|item| item.0).collect());
            Ok(())
        }
    }

    fn registry() -> StreamRegistry<Batch> {
        StreamRegistry::without_hooks(RegistryConfig::default())
    }

    #[tokio::test]
    async fn live_batch_must_hold_one_item() {
        let registry = registry();
        assert_eq!(
            registry.publish_live(ItemBatch::new(vec![Item(1), Item(2)])),
            Err(RegistryError::InvalidBatch { len: 2 })
        );
        assert_eq!(
            registry.publish_live(ItemBatch::empty()),
            Err(RegistryError::InvalidBatch { len: 0 })
        );
        registry.stop().await;
    }

    #[tokio::test]
    async fn live_traffic_waits_for_activation() {
        let registry = registry();
        let sink = Arc::new(Collect::default());
        let session = registry
            .subscribe(StreamInfo::new(sink.clone()), AcceptAll)
            .await
            .unwrap();

        assert_eq!(registry.publish_live(ItemBatch::single(Item(1))), Ok(1));
        assert_eq!(session.pending_batches(), 1);
        assert!(sink.writes.lock().is_empty());

        assert!(registry.activate(&session));
        assert!(!registry.activate(&session));
        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.writes.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(session.cursor(), Some(1));
        registry.stop().await;
    }

    #[tokio::test]
    async fn historical_writes_every_session_and_moves_cursor() {
        let registry = registry();
        let first = Arc::new(Collect::default());
        let second = Arc::new(Collect::default());
        let a = registry
            .subscribe(StreamInfo::new(first.clone()), AcceptAll)
            .await
            .unwrap();
        let b = registry
            .subscribe(StreamInfo::new(second.clone()), |item: &Item| item.0 > 100)
            .await
            .unwrap();

        let attempted = registry
            .publish_historical(ItemBatch::new(vec![Item(4), Item(5)]))
            .await;

        assert_eq!(attempted, 2);
        assert_eq!(*first.writes.lock(), vec![vec![4, 5]]);
        assert_eq!(*second.writes.lock(), vec![vec![4, 5]]);
        assert_eq!(a.cursor(), Some(5));
        assert_eq!(b.cursor(), Some(5));
        registry.stop().await;
    }

    #[tokio::test]
    async fn ping_replays_last_sent_without_moving_cursor() {
        let registry = registry();
        let sink = Arc::new(Collect::default());
        let session = registry
            .subscribe(StreamInfo::new(sink.clone()), AcceptAll)
            .await
            .unwrap();

        assert_eq!(registry.ping_all().await, 1);
        registry
            .send_historical(&session, ItemBatch::new(vec![Item(7), Item(8)]))
            .await;
        assert_eq!(registry.ping_all().await, 1);

        let writes = sink.writes.lock().clone();
        assert_eq!(writes, vec![vec![], vec![7, 8], vec![7, 8]]);
        assert_eq!(session.cursor(), Some(8));
        assert_eq!(session.writes(), 3);
        registry.stop().await;
    }

    #[tokio::test]
    async fn stats_reflect_sessions() {
        let registry = registry();
        let token = CancellationToken::new();
        let session = registry
            .subscribe(
                StreamInfo::new(Arc::new(Collect::default())).with_cancellation(token.clone()),
                AcceptAll,
            )
            .await
            .unwrap();
        registry.publish_live(ItemBatch::single(Item(3))).unwrap();
        token.cancel();

        let stats = registry.stats();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.cancelled_sessions, 1);
        assert_eq!(stats.pending_batches, 1);

        assert_eq!(registry.sweep_cancelled().await, 1);
        assert_eq!(registry.stats(), RegistryStats::default());
        assert!(session.is_completed());
        registry.stop().await;
    }

    #[tokio::test]
    async fn zero_loop_periods_are_clamped_and_loops_keep_running() {
        let config = RegistryConfig {
            sweep_interval: Duration::ZERO,
            ..RegistryConfig::default()
        }
        .with_ping_interval(Duration::ZERO);
        let registry = StreamRegistry::<Batch>::without_hooks(config);
        assert_eq!(registry.config().sweep_interval, MIN_LOOP_PERIOD);
        assert_eq!(registry.config().ping_interval, Some(MIN_LOOP_PERIOD));

        let token = CancellationToken::new();
        let sink = Arc::new(Collect::default());
        let session = registry
            .subscribe(
                StreamInfo::new(sink.clone()).with_cancellation(token.clone()),
                AcceptAll,
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.writes.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), session.completed())
            .await
            .unwrap();
        assert_eq!(registry.stats().sessions, 0);
        registry.stop().await;
    }

    /// Records the name of every metric registered through it.
    #[derive(Default)]
    struct NameRecorder {
        names: Mutex<Vec<String>>,
    }

    impl ::metrics::Recorder for NameRecorder {
        fn describe_counter(
            &self,
            _key: ::metrics::KeyName,
            _unit: Option<::metrics::Unit>,
            _description: ::metrics::SharedString,
        ) {
        }

        fn describe_gauge(
            &self,
            _key: ::metrics::KeyName,
            _unit: Option<::metrics::Unit>,
            _description: ::metrics::SharedString,
        ) {
        }

        fn describe_histogram(
            &self,
            _key: ::metrics::KeyName,
            _unit: Option<::metrics::Unit>,
            _description: ::metrics::SharedString,
        ) {
        }

        fn register_counter(
            &self,
            key: &::metrics::Key,
            _metadata: &::metrics::Metadata<'_>,
        ) -> ::metrics::Counter {
            self.names.lock().push(key.name().to_string());
            ::metrics::Counter::noop()
        }

        fn register_gauge(
            &self,
            key: &::metrics::Key,
            _metadata: &::metrics::Metadata<'_>,
        ) -> ::metrics::Gauge {
            self.names.lock().push(key.name().to_string());
            ::metrics::Gauge::noop()
        }

        fn register_histogram(
            &self,
            key: &::metrics::Key,
            _metadata: &::metrics::Metadata<'_>,
        ) -> ::metrics::Histogram {
            self.names.lock().push(key.name().to_string());
            ::metrics::Histogram::noop()
        }
    }

    #[test]
    fn ping_pass_is_counted_apart_from_publishing() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (registry, _session) = runtime.block_on(async {
            let registry = registry();
            let session = registry
                .subscribe(StreamInfo::new(Arc::new(Collect::default())), AcceptAll)
                .await
                .unwrap();
            (registry, session)
        });

        let recorder = NameRecorder::default();
        let pinged =
            ::metrics::with_local_recorder(&recorder, || runtime.block_on(registry.ping_all()));
        assert_eq!(pinged, 1);

        let names = recorder.names.lock().clone();
        assert!(names.iter().any(|name| name == "stream_fanout_pings_sent_total"));
        assert!(names.iter().any(|name| name == "stream_fanout_ping_passes_total"));
        assert!(!names
            .iter()
            .any(|name| name == "stream_fanout_batches_published_total"));

        runtime.block_on(registry.stop());
    }

    #[tokio::test]
    async fn dropping_registry_completes_sessions() {
        let registry = registry();
        let session = registry
            .subscribe(StreamInfo::new(Arc::new(Collect::default())), AcceptAll)
            .await
            .unwrap();
        registry.activate(&session);

        drop(registry);
        assert!(session.is_completed());
        assert_eq!(session.state(), SessionState::Removed);
    }
}
