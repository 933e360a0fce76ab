//! Application Layer - Fan-out services and port definitions.
//!
//! This layer contains the registry, sessions and dispatch queues, and the
//! port interfaces through which they reach subscriber transports.

/// Port interfaces for subscriber sinks and lifecycle hooks.
pub mod ports;

/// Registry, session and dispatch queue services.
pub mod services;
