//! Configuration Module
//!
//! Environment-driven configuration for the fan-out service.

mod settings;

pub use settings::{ConfigError, DemoSettings, ServerSettings, ServiceConfig, StreamSettings};
