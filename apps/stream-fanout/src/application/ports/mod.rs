//! Port Interfaces
//!
//! Defines the interfaces (ports) the fan-out core consumes, following
//! the Hexagonal Architecture pattern. Infrastructure adapters implement
//! these to connect the registry to a real transport.
//!
//! ## Driven Ports (Outbound)
//!
//! - `StreamSink`: Writes one batch to a single subscriber's transport
//! - `StreamHooks`: Optional lifecycle and post-processing callbacks

mod hooks_port;
mod sink_port;

pub use hooks_port::{HookError, NoHooks, StreamHooks};
pub use sink_port::{SinkError, StreamSink};
