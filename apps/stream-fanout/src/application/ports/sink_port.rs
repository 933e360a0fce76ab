//! Stream Sink Port (Driven Port)
//!
//! Interface for writing batches to one subscriber's transport.

use async_trait::async_trait;

/// Error returned by a sink write.
///
/// Any error is fatal to the subscriber that produced it; the registry
/// removes the session and keeps delivering to everyone else.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// The transport was closed by the peer.
    #[error("sink closed")]
    Closed,
    /// The transport failed while writing.
    #[error("sink transport error: {0}")]
    Transport(String),
}

/// Port for delivering batches to a single subscriber.
#[async_trait]
pub trait StreamSink<B>: Send + Sync {
    /// Write one batch to the subscriber.
    async fn write(&self, batch: &B) -> Result<(), SinkError>;
}
