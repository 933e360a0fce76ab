#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Stream Fanout - Ordered Subscriber Fan-out
//!
//! A streaming core that lets many concurrent subscribers attach to one
//! logical feed, each with its own filter and delivery cursor, while a
//! producer pushes historical (backfill) and live batches.
//!
//! # Guarantees
//!
//! - Batches reach each subscriber in representative-id order, never
//!   interleaved.
//! - A batch the subscriber's cursor has passed is not written again.
//! - A failing subscriber is removed without affecting the others.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types and delivery rules
//!   - `streaming`: Items, batches and the ordered batch heap
//!   - `subscription`: Filters, delivery cursors and session identity
//!
//! - **Application**: Services and port definitions
//!   - `ports`: Sink and lifecycle hook interfaces
//!   - `services`: Dispatch queues, sessions and the stream registry
//!
//! - **Infrastructure**: Adapters and ambient plumbing
//!   - `config`: Environment configuration
//!   - `sinks`: Channel-backed sink adapter
//!   - `metrics`: Prometheus instrumentation
//!   - `telemetry`: Tracing and OpenTelemetry setup
//!
//! # Data Flow
//!
//! ```text
//! Producer ─┬─ publish_live ──► filter ──► DispatchQueue ──► worker ─┐
//!           │                                                        ├─► deliver ─► Sink
//!           └─ publish_historical ───────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no runtime dependencies.
pub mod domain;

/// Application layer - Fan-out services and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{
    DEFAULT_HEAP_CAPACITY, ItemBatch, ItemId, OrderedBatchHeap, StreamBatch, StreamItem,
};
pub use domain::subscription::{
    AcceptAll, DeliveryCursor, SessionId, SessionState, StalePolicy, StreamFilter,
};

// Ports
pub use application::ports::{HookError, NoHooks, SinkError, StreamHooks, StreamSink};

// Services
pub use application::services::{
    BatchHandler, DeliveryKind, DispatchQueue, MIN_LOOP_PERIOD, RegistryConfig, RegistryError,
    RegistryStats, SessionStats, StreamInfo, StreamRegistry, SubscriberSession,
};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, DemoSettings, ServerSettings, ServiceConfig, StreamSettings,
};

// Sinks
pub use infrastructure::sinks::{ChannelSink, channel_sink};

// Metrics
pub use infrastructure::metrics::{MetricsError, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{
    TelemetryConfig, TelemetryError, TelemetryGuard, init as init_telemetry,
};
