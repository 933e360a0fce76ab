//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use stream_fanout::{ItemBatch, SinkError, StreamBatch, StreamItem, StreamSink};

/// Event tagged with a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: u64,
    pub tenant: &'static str,
}

impl StreamItem for Event {
    type Id = u64;

    fn stream_item_id(&self) -> &u64 {
        &self.id
    }
}

pub type EventBatch = ItemBatch<Event>;

/// Batch of `acme` events with the given ids.
pub fn batch(ids: &[u64]) -> EventBatch {
    ItemBatch::new(
        ids.iter()
            .map(|id| Event {
                id: *id,
                tenant: "acme",
            })
            .collect(),
    )
}

/// Single-event batch for a tenant.
pub fn tenant_event(id: u64, tenant: &'static str) -> EventBatch {
    ItemBatch::single(Event { id, tenant })
}

/// Sink that records every write and tracks overlapping writes.
#[derive(Default)]
pub struct RecordingSink {
    writes: Mutex<Vec<Vec<Event>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingSink {
    pub fn count(&self) -> usize {
        self.writes.lock().len()
    }

    /// Item ids of every write, one vector per write.
    pub fn writes(&self) -> Vec<Vec<u64>> {
        self.writes
            .lock()
            .iter()
            .map(|write| write.iter().map(|event| event.id).collect())
            .collect()
    }

    /// Item ids of every write, flattened.
    pub fn ids(&self) -> Vec<u64> {
        self.writes().into_iter().flatten().collect()
    }

    pub fn tenants(&self) -> Vec<&'static str> {
        self.writes
            .lock()
            .iter()
            .flatten()
            .map(|event| event.tenant)
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamSink<EventBatch> for RecordingSink {
    async fn write(&self, batch: &EventBatch) -> Result<(), SinkError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::task::yield_now().await;
        self.writes.lock().push(batch.items().to_vec());

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sink whose every write fails.
#[derive(Default)]
pub struct FailingSink {
    attempts: AtomicUsize,
}

impl FailingSink {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamSink<EventBatch> for FailingSink {
    async fn write(&self, _batch: &EventBatch) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::Transport("connection reset".to_string()))
    }
}

/// Poll `condition` until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
