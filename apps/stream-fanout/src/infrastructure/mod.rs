//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete sink adapter, environment
//! configuration and the observability plumbing (tracing, metrics).

/// Environment configuration.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Channel-backed sink adapter.
pub mod sinks;

/// Tracing subscriber and OpenTelemetry integration.
pub mod telemetry;
