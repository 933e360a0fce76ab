//! Stream Hooks Port (Driven Port)
//!
//! Optional callbacks the registry invokes around a subscriber's lifecycle
//! and before each delivery. Every method has a no-op default, so an
//! implementation only overrides what it needs.

use async_trait::async_trait;

use crate::application::services::{StreamInfo, SubscriberSession};
use crate::domain::streaming::StreamBatch;

/// Error returned by a lifecycle hook.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HookError {
    /// The hook refused the subscriber.
    #[error("subscriber rejected: {0}")]
    Rejected(String),
    /// The hook failed while running.
    #[error("hook failed: {0}")]
    Failed(String),
}

/// Lifecycle and post-processing callbacks for a registry.
#[async_trait]
pub trait StreamHooks<B: StreamBatch>: Send + Sync {
    /// Called before a subscriber joins the session set.
    ///
    /// An error aborts the subscription and is returned to the caller.
    async fn before_registered(&self, _info: &StreamInfo<B>) -> Result<(), HookError> {
        Ok(())
    }

    /// Called once after a session has been removed.
    async fn after_removed(&self, _session: &SubscriberSession<B>) -> Result<(), HookError> {
        Ok(())
    }

    /// Transform a batch before it is written to a session's sink.
    ///
    /// Runs on every delivery attempt, pings included. Must be pure.
    fn process_before_send(&self, batch: B, _session: &SubscriberSession<B>) -> B {
        batch
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl<B: StreamBatch> StreamHooks<B> for NoHooks {}
