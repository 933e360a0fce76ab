//! Application Services
//!
//! Services that run the fan-out core on top of the domain types.
//!
//! - `DispatchQueue`: Ordered per-subscriber buffer with one draining worker
//! - `SubscriberSession`: State bound to one subscriber
//! - `StreamRegistry`: Session set, fan-out paths and maintenance loops

mod dispatch_queue;
mod registry;
mod session;

pub use dispatch_queue::{BatchHandler, DeliveryKind, DispatchQueue};
pub use registry::{
    MIN_LOOP_PERIOD, RegistryConfig, RegistryError, RegistryStats, StreamRegistry,
};
pub use session::{SessionStats, StreamInfo, SubscriberSession};
