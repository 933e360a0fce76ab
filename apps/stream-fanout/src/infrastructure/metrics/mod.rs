//! Prometheus Metrics Module
//!
//! Exposes fan-out metrics in Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Publishing**: Batches published per path and the sessions they reached
//! - **Pings**: Ping passes and the sessions each one reached
//! - **Delivery**: Sink writes, stale skips and sink failures
//! - **Sessions**: Registered session count and removals by reason
//! - **Latency**: Sink write duration
//!
//! # Integration
//!
//! The exporter serves `/metrics` on its own HTTP listener. Without an
//! installed recorder every recording call below is a no-op.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::application::services::DeliveryKind;

// =============================================================================
// Exporter
// =============================================================================

/// Install the Prometheus recorder and serve `/metrics` on `0.0.0.0:port`.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns an error if a recorder is already installed or the listener
/// cannot be configured.
pub fn init_metrics(port: u16) -> Result<(), MetricsError> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;

    register_metrics();
    tracing::info!(addr = %addr, "Prometheus metrics exporter started");
    Ok(())
}

/// Error type for metrics operations.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to install metrics exporter.
    #[error("metrics installation error: {0}")]
    Installation(String),
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Publishing
    describe_counter!(
        "stream_fanout_batches_published_total",
        "Total batches published to the registry"
    );
    describe_counter!(
        "stream_fanout_batches_routed_total",
        "Total session deliveries scheduled by publishing"
    );

    // Pings
    describe_counter!(
        "stream_fanout_ping_passes_total",
        "Total ping passes over the session set"
    );
    describe_counter!(
        "stream_fanout_pings_sent_total",
        "Total sessions pinged"
    );

    // Delivery
    describe_counter!(
        "stream_fanout_batches_delivered_total",
        "Total batches written to subscriber sinks"
    );
    describe_counter!(
        "stream_fanout_stale_skips_total",
        "Total batches skipped because the subscriber cursor had passed them"
    );
    describe_counter!(
        "stream_fanout_sink_failures_total",
        "Total failed sink writes"
    );

    // Sessions
    describe_gauge!(
        "stream_fanout_sessions",
        "Number of registered subscriber sessions"
    );
    describe_counter!(
        "stream_fanout_sessions_removed_total",
        "Total sessions removed by reason"
    );

    // Latency
    describe_histogram!(
        "stream_fanout_sink_write_seconds",
        "Time spent in a single sink write"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for delivery paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    /// Queued live traffic.
    Live,
    /// Direct historical backfill.
    Historical,
    /// Keep-alive ping.
    Ping,
}

impl DeliveryPath {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Historical => "historical",
            Self::Ping => "ping",
        }
    }
}

impl From<DeliveryKind> for DeliveryPath {
    fn from(kind: DeliveryKind) -> Self {
        match kind {
            DeliveryKind::Live => Self::Live,
            DeliveryKind::Historical => Self::Historical,
            DeliveryKind::Ping => Self::Ping,
        }
    }
}

/// Why a session left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// A sink write failed.
    SinkFailure,
    /// The transport cancelled and the sweep reaped it.
    Cancelled,
    /// Explicit unsubscribe.
    Unsubscribed,
    /// Registry stopped.
    Shutdown,
}

impl RemovalReason {
    /// Get the reason label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SinkFailure => "sink_failure",
            Self::Cancelled => "cancelled",
            Self::Unsubscribed => "unsubscribed",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Record a published batch and the number of sessions it was routed to.
///
/// Only the live and historical paths publish; pings go through
/// [`record_ping_pass`].
pub fn record_batch_published(path: DeliveryPath, sessions: usize) {
    counter!(
        "stream_fanout_batches_published_total",
        "path" => path.as_str()
    )
    .increment(1);
    counter!(
        "stream_fanout_batches_routed_total",
        "path" => path.as_str()
    )
    .increment(sessions as u64);
}

/// Record one ping pass and the number of sessions it reached.
pub fn record_ping_pass(sessions: usize) {
    counter!("stream_fanout_ping_passes_total").increment(1);
    counter!("stream_fanout_pings_sent_total").increment(sessions as u64);
}

/// Record a successful sink write.
pub fn record_batch_delivered(path: DeliveryPath) {
    counter!(
        "stream_fanout_batches_delivered_total",
        "path" => path.as_str()
    )
    .increment(1);
}

/// Record a batch skipped by the cursor check.
pub fn record_stale_skip(path: DeliveryPath) {
    counter!(
        "stream_fanout_stale_skips_total",
        "path" => path.as_str()
    )
    .increment(1);
}

/// Record a failed sink write.
pub fn record_sink_failure(path: DeliveryPath) {
    counter!(
        "stream_fanout_sink_failures_total",
        "path" => path.as_str()
    )
    .increment(1);
}

/// Update the registered session count.
#[allow(clippy::cast_precision_loss)]
pub fn set_sessions(count: usize) {
    gauge!("stream_fanout_sessions").set(count as f64);
}

/// Record removed sessions.
pub fn record_sessions_removed(reason: RemovalReason, count: u64) {
    counter!(
        "stream_fanout_sessions_removed_total",
        "reason" => reason.as_str()
    )
    .increment(count);
}

/// Record sink write duration.
pub fn record_sink_write_duration(path: DeliveryPath, duration: Duration) {
    histogram!(
        "stream_fanout_sink_write_seconds",
        "path" => path.as_str()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
