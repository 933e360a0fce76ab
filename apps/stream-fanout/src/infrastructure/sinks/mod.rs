//! Channel Sink Adapter
//!
//! A [`StreamSink`] backed by a bounded `tokio::sync::mpsc` channel, so a
//! transport can drain a subscriber's deliveries as a stream. Dropping the
//! receiver makes the next write fail with [`SinkError::Closed`], which
//! removes the session from its registry.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::application::ports::{SinkError, StreamSink};
use crate::domain::streaming::StreamBatch;

/// Sink that forwards each batch into an mpsc channel.
///
/// A full channel makes the write wait, which holds back only this
/// subscriber's dispatch queue.
#[derive(Debug, Clone)]
pub struct ChannelSink<B> {
    tx: mpsc::Sender<B>,
}

impl<B> ChannelSink<B> {
    /// Wrap an existing sender.
    #[must_use]
    pub const fn new(tx: mpsc::Sender<B>) -> Self {
        Self { tx }
    }

    /// Whether the receiving side has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a channel sink and the receiver that drains it.
#[must_use]
pub fn channel_sink<B>(capacity: usize) -> (ChannelSink<B>, mpsc::Receiver<B>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelSink::new(tx), rx)
}

#[async_trait]
impl<B: StreamBatch> StreamSink<B> for ChannelSink<B> {
    async fn write(&self, batch: &B) -> Result<(), SinkError> {
        self.tx
            .send(batch.clone())
            .await
            .map_err(|_| SinkError::Closed)
    }
}
