//! Subscription Domain Types
//!
//! Per-subscriber rules that do not depend on the runtime: which items a
//! subscriber wants (filters), where its delivery stands (cursor) and which
//! lifecycle state it is in.
//!
//! # Design
//!
//! The delivery cursor is the id of the last item written to a subscriber.
//! It only moves forward, and it is used to drop re-deliveries of batches the
//! subscriber has already moved past.

use std::fmt;
use std::str::FromStr;

use super::streaming::StreamItem;

// =============================================================================
// Identity and State
// =============================================================================

/// Unique identifier for a subscriber session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    /// Generate a new random session id.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

/// Lifecycle state of a subscriber session.
///
/// Transitions only move forward: `Registered → Active → Removed`, or
/// `Registered → Removed` for sessions that never activate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Registered with the registry; the dispatch worker has not started.
    Registered,
    /// Dispatch worker running, eligible for live fan-out.
    Active,
    /// Terminal: completion resolved, queue closed.
    Removed,
}

impl SessionState {
    /// Get the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Active => "active",
            Self::Removed => "removed",
        }
    }
}

// =============================================================================
// Filters
// =============================================================================

/// Predicate deciding whether a subscriber wants an item.
///
/// Must be side-effect free; it runs on the publisher's thread during fan-out.
pub trait StreamFilter<I>: Send + Sync {
    /// Whether the item matches.
    fn is_matched(&self, item: &I) -> bool;
}

impl<I, F> StreamFilter<I> for F
where
    F: Fn(&I) -> bool + Send + Sync,
{
    fn is_matched(&self, item: &I) -> bool {
        self(item)
    }
}

/// Filter that matches every item.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl<I> StreamFilter<I> for AcceptAll {
    fn is_matched(&self, _item: &I) -> bool {
        true
    }
}

// =============================================================================
// Delivery Cursor
// =============================================================================

/// Rule deciding when a batch counts as already delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StalePolicy {
    /// Stale when every item id is strictly below the cursor.
    ///
    /// Batches carrying the cursor's own id are written again.
    #[default]
    OlderThanCursor,
    /// Stale when every item id is at or below the cursor.
    NotAfterCursor,
}

impl StalePolicy {
    /// Get the policy name used in configuration.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OlderThanCursor => "older",
            Self::NotAfterCursor => "not-after",
        }
    }
}

impl FromStr for StalePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "older" | "older-than-cursor" => Ok(Self::OlderThanCursor),
            "not-after" | "not-after-cursor" => Ok(Self::NotAfterCursor),
            other => Err(format!("unknown stale policy: {other}")),
        }
    }
}

/// Position of the last item delivered to a subscriber.
///
/// Starts before every id and never moves backwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryCursor<Id> {
    position: Option<Id>,
}

impl<Id> Default for DeliveryCursor<Id> {
    fn default() -> Self {
        Self { position: None }
    }
}

impl<Id: Ord + Clone> DeliveryCursor<Id> {
    /// Create a cursor positioned before every id.
    #[must_use]
    pub const fn new() -> Self {
        Self { position: None }
    }

    /// Id of the last delivered item, if any.
    #[must_use]
    pub const fn position(&self) -> Option<&Id> {
        self.position.as_ref()
    }

    /// Whether a batch with these items was already delivered.
    ///
    /// Empty item lists are never stale.
    pub fn is_stale<I>(&self, items: &[I], policy: StalePolicy) -> bool
    where
        I: StreamItem<Id = Id>,
    {
        let Some(position) = &self.position else {
            return false;
        };
        if items.is_empty() {
            return false;
        }

        items.iter().all(|item| {
            let id = item.stream_item_id();
            match policy {
                StalePolicy::OlderThanCursor => id < position,
                StalePolicy::NotAfterCursor => id <= position,
            }
        })
    }

    /// Move the cursor to `id` if that is forward.
    ///
    /// Returns whether the position changed.
    pub fn advance(&mut self, id: &Id) -> bool {
        match &self.position {
            Some(current) if current >= id => false,
            _ => {
                self.position = Some(id.clone());
                true
            }
        }
    }
}
