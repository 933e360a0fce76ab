//! Streaming Data Types
//!
//! Items, batches and the ordered batch heap. A batch is the unit of delivery:
//! an internally ordered collection of items that a subscriber receives in one
//! write. Batches are ordered against each other by their representative id,
//! the id of the last item.

mod heap;

pub use heap::{DEFAULT_HEAP_CAPACITY, OrderedBatchHeap};

use std::fmt::Debug;
use std::sync::Arc;

/// An item carried in a stream batch.
pub trait StreamItem {
    /// Totally ordered item identifier.
    type Id: Ord + Clone + Debug + Send + Sync + 'static;

    /// The item's identifier.
    fn stream_item_id(&self) -> &Self::Id;
}

/// The id type of a batch's items.
pub type ItemId<B> = <<B as StreamBatch>::Item as StreamItem>::Id;

/// A collection of items delivered to a subscriber as one write.
///
/// Items are expected in ascending id order. An empty batch is a ping frame.
pub trait StreamBatch: Clone + Send + Sync + 'static {
    /// Item type.
    type Item: StreamItem + Send + Sync;

    /// The items in this batch.
    fn items(&self) -> &[Self::Item];

    /// An empty batch, used as the ping frame when nothing was sent yet.
    fn empty() -> Self;

    /// Id used to order batches: the id of the last item.
    ///
    /// `None` for an empty batch, which sorts before every other batch.
    fn representative_id(&self) -> Option<&ItemId<Self>> {
        self.items().last().map(StreamItem::stream_item_id)
    }

    /// Whether this batch carries no items.
    fn is_ping(&self) -> bool {
        self.items().is_empty()
    }
}

/// Default batch implementation over a shared slice of items.
///
/// Cloning is cheap, so a published batch can be handed to every matching
/// subscriber without copying the items.
#[derive(Debug, PartialEq, Eq)]
pub struct ItemBatch<I> {
    items: Arc<[I]>,
}

impl<I> ItemBatch<I> {
    /// Create a batch from items in ascending id order.
    #[must_use]
    pub fn new(items: Vec<I>) -> Self {
        Self {
            items: items.into(),
        }
    }

    /// Create a batch holding one item, the shape of live traffic.
    #[must_use]
    pub fn single(item: I) -> Self {
        Self::new(vec![item])
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch has no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<I> Clone for ItemBatch<I> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<I> Default for ItemBatch<I> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<I> From<Vec<I>> for ItemBatch<I> {
    fn from(items: Vec<I>) -> Self {
        Self::new(items)
    }
}

impl<I> StreamBatch for ItemBatch<I>
where
    I: StreamItem + Send + Sync + 'static,
{
    type Item = I;

    fn items(&self) -> &[I] {
        &self.items
    }

    fn empty() -> Self {
        Self::default()
    }
}
