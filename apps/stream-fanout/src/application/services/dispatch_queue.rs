//! Per-Subscriber Dispatch Queue
//!
//! Buffers batches for one subscriber in an [`OrderedBatchHeap`] and drains
//! them from a single background task, in representative-id order.
//!
//! # Locking
//!
//! - The heap sits behind a short `parking_lot::Mutex`, so `enqueue` never
//!   waits on a sink write. Closing happens under the same lock, so an
//!   accepted batch is never left behind in a closed heap.
//! - Every delivery (queued, historical or ping) holds the async delivery
//!   gate while the handler runs, so writes to one subscriber never overlap.
//!
//! The worker idles on a [`Notify`] while the heap is empty. A permit stored
//! by `notify_one` before the worker starts waiting is not lost.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::streaming::{OrderedBatchHeap, StreamBatch};

/// How a batch reached the delivery routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryKind {
    /// Drained from the queue by the worker.
    Live,
    /// Backfill written directly, bypassing the queue.
    Historical,
    /// Keep-alive frame.
    Ping,
}

impl DeliveryKind {
    /// Get the kind name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Historical => "historical",
            Self::Ping => "ping",
        }
    }
}

/// Callback that delivers one batch to the queue's subscriber.
#[async_trait]
pub trait BatchHandler<B>: Send + Sync + 'static {
    /// Deliver a batch. Failures are handled inside the callback.
    async fn handle(&self, batch: B, kind: DeliveryKind);
}

struct QueueShared<B> {
    heap: Mutex<OrderedBatchHeap<B>>,
    gate: tokio::sync::Mutex<()>,
    wake: Notify,
    cancel: CancellationToken,
    handler: Arc<dyn BatchHandler<B>>,
}

/// Ordered queue with a single draining worker.
///
/// Batches can be enqueued before the worker starts; they are held until
/// [`start`](Self::start) is called.
pub struct DispatchQueue<B> {
    shared: Arc<QueueShared<B>>,
    started: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<B: StreamBatch> DispatchQueue<B> {
    /// Create a queue with the given heap capacity and delivery callback.
    #[must_use]
    pub fn new(capacity: usize, handler: Arc<dyn BatchHandler<B>>) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                heap: Mutex::new(OrderedBatchHeap::with_capacity(capacity)),
                gate: tokio::sync::Mutex::new(()),
                wake: Notify::new(),
                cancel: CancellationToken::new(),
                handler,
            }),
            started: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    /// Add a batch and wake the worker.
    ///
    /// Returns `false` if the queue is closed.
    pub fn enqueue(&self, batch: B) -> bool {
        {
            let mut heap = self.shared.heap.lock();
            if self.is_closed() {
                return false;
            }
            heap.push(batch);
        }
        self.shared.wake.notify_one();
        true
    }

    /// Start the worker. Returns `false` if it was already started or the
    /// queue is closed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let shared = Arc::clone(&self.shared);
        *self.worker.lock() = Some(tokio::spawn(run_worker(shared)));
        true
    }

    /// Deliver a batch immediately, bypassing the heap.
    ///
    /// Waits for any in-flight delivery to this subscriber to finish first.
    /// Returns `false` if the queue is closed.
    pub async fn deliver_now(&self, batch: B, kind: DeliveryKind) -> bool {
        if self.is_closed() {
            return false;
        }

        let _gate = self.shared.gate.lock().await;
        if self.is_closed() {
            return false;
        }
        self.shared.handler.handle(batch, kind).await;
        true
    }

    /// Signal the worker to stop and drop pending batches.
    ///
    /// Does not wait for the worker; an in-flight delivery runs to completion.
    pub fn close(&self) {
        let mut heap = self.shared.heap.lock();
        self.shared.cancel.cancel();
        *heap = OrderedBatchHeap::with_capacity(0);
    }

    /// Close the queue and wait for the worker to exit.
    ///
    /// Called from the worker itself this only closes, since the worker
    /// cannot wait for its own exit.
    pub async fn shutdown(&self) {
        self.close();

        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if tokio::task::try_id() == Some(handle.id()) {
            return;
        }
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Dispatch worker terminated abnormally");
        }
    }

    /// Number of batches waiting in the heap.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.heap.lock().len()
    }

    /// Whether no batches are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.heap.lock().is_empty()
    }

    /// Whether the worker has been started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Whether the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

impl<B> Drop for DispatchQueue<B> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl<B> std::fmt::Debug for DispatchQueue<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("closed", &self.shared.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

async fn run_worker<B: StreamBatch>(shared: Arc<QueueShared<B>>) {
    tracing::trace!("Dispatch worker started");

    loop {
        if shared.cancel.is_cancelled() {
            break;
        }

        let delivered = {
            let _gate = shared.gate.lock().await;
            let next = shared.heap.lock().pop();
            match next {
                Some(batch) if !shared.cancel.is_cancelled() => {
                    shared.handler.handle(batch, DeliveryKind::Live).await;
                    true
                }
                _ => false,
            }
        };

        if !delivered {
            tokio::select! {
                () = shared.cancel.cancelled() => break,
                () = shared.wake.notified() => {}
            }
        }
    }

    tracing::trace!("Dispatch worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::domain::streaming::{ItemBatch, StreamItem};

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
    struct Recorder {
        seen: Mutex<Vec<(Option<u64>, DeliveryKind)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Option<Duration>,
    }

    impl Recorder {
        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        fn ids(&self) -> Vec<u64> {
            self.seen.lock().iter().filter_map(|(id, _)| *id).collect()
        }

        fn count(&self) -> usize {
            self.seen.lock().len()
        }
    }

    #[async_trait]
    impl BatchHandler<Batch> for Recorder {
        async fn handle(&self, batch: Batch, kind: DeliveryKind) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.seen
                .lock()
                .push((batch.representative_id().copied(), kind));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn batch(id: u64) -> Batch {
        ItemBatch::single(Item(id))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn holds_batches_until_started_then_drains_in_id_order() {
        let recorder = Arc::new(Recorder::default());
        let queue = DispatchQueue::new(8, recorder.clone());

        for id in [5, 3, 9, 1] {
            assert!(queue.enqueue(batch(id)));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(recorder.count(), 0);
        assert_eq!(queue.len(), 4);

        assert!(queue.start());
        wait_until(|| recorder.count() == 4).await;
        assert_eq!(recorder.ids(), vec![1, 3, 5, 9]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let queue = DispatchQueue::new(8, Arc::new(Recorder::default()));
        assert!(queue.start());
        assert!(!queue.start());
        assert!(queue.is_started());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn worker_wakes_for_batches_enqueued_after_idle() {
        let recorder = Arc::new(Recorder::default());
        let queue = DispatchQueue::new(8, recorder.clone());
        queue.start();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(batch(7));
        wait_until(|| recorder.count() == 1).await;

        queue.enqueue(batch(8));
        wait_until(|| recorder.count() == 2).await;
        assert_eq!(recorder.ids(), vec![7, 8]);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn direct_delivery_never_overlaps_worker_delivery() {
        let recorder = Arc::new(Recorder::slow(Duration::from_millis(10)));
        let queue = Arc::new(DispatchQueue::new(8, recorder.clone()));
        queue.start();

        for id in 0..5 {
            queue.enqueue(batch(id));
        }
        let direct = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                for id in 100..103 {
                    queue.deliver_now(batch(id), DeliveryKind::Historical).await;
                }
            })
        };
        direct.await.unwrap();

        wait_until(|| recorder.count() == 8).await;
        assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 1);
        let historical = recorder
            .seen
            .lock()
            .iter()
            .filter(|(_, kind)| *kind == DeliveryKind::Historical)
            .count();
        assert_eq!(historical, 3);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn closed_queue_rejects_work() {
        let recorder = Arc::new(Recorder::default());
        let queue = DispatchQueue::new(8, recorder.clone());
        queue.enqueue(batch(1));

        queue.shutdown().await;
        assert!(queue.is_closed());
        assert!(queue.is_empty());
        assert!(!queue.enqueue(batch(2)));
        assert!(!queue.start());
        assert!(!queue.deliver_now(batch(3), DeliveryKind::Ping).await);
        assert_eq!(recorder.count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn enqueue_racing_close_leaves_nothing_behind() {
        for _ in 0..50 {
            let queue = Arc::new(DispatchQueue::new(8, Arc::new(Recorder::default())));
            let producers: Vec<_> = (0..3u64)
                .map(|offset| {
                    let queue = Arc::clone(&queue);
                    tokio::spawn(async move {
                        let mut id = offset;
                        while queue.enqueue(batch(id)) {
                            id += 3;
                            if id % 64 == 0 {
                                tokio::task::yield_now().await;
                            }
                        }
                    })
                })
                .collect();

            tokio::task::yield_now().await;
            queue.close();
            for producer in producers {
                producer.await.unwrap();
            }

            assert!(queue.is_empty());
            assert!(!queue.enqueue(batch(0)));
        }
    }

    #[tokio::test]
    async fn shutdown_joins_running_worker() {
        let recorder = Arc::new(Recorder::slow(Duration::from_millis(30)));
        let queue = DispatchQueue::new(8, recorder.clone());
        queue.enqueue(batch(1));
        queue.start();

        wait_until(|| recorder.in_flight.load(Ordering::SeqCst) == 1).await;
        queue.shutdown().await;
        assert_eq!(recorder.count(), 1);
        assert!(queue.worker.lock().is_none());
    }
}
