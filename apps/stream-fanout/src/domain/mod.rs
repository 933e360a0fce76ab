//! Domain Layer - Core streaming types and delivery rules.
//!
//! This layer holds the pure types of the fan-out core: items, batches,
//! the ordered batch heap, filters and delivery cursors. Nothing here
//! touches the async runtime.

/// Items, batches and the ordered batch heap.
pub mod streaming;

/// Filters, delivery cursors and session identity.
pub mod subscription;
