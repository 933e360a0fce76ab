//! Ordered Batch Heap
//!
//! Binary min-heap over batches keyed by their representative id. Each
//! subscriber's dispatch queue drains one of these, so delivery order follows
//! item ids rather than the order in which publishers raced to enqueue.
//!
//! Capacity is managed explicitly: it doubles when a push finds the heap full
//! and falls back to the initial floor once the heap drains to empty, which
//! bounds the memory an idle subscriber keeps after a burst.

use super::StreamBatch;

/// Initial capacity and shrink floor used by dispatch queues.
pub const DEFAULT_HEAP_CAPACITY: usize = 128;

/// Binary min-heap of batches ordered by representative id.
///
/// Equal representative ids come out in unspecified order.
#[derive(Debug)]
pub struct OrderedBatchHeap<B> {
    entries: Vec<B>,
    capacity: usize,
    floor: usize,
}

impl<B: StreamBatch> Default for OrderedBatchHeap<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: StreamBatch> OrderedBatchHeap<B> {
    /// Create an empty heap with [`DEFAULT_HEAP_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HEAP_CAPACITY)
    }

    /// Create an empty heap whose initial capacity is also its shrink floor.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            floor: capacity,
        }
    }

    /// Build a heap from existing batches in O(n).
    #[must_use]
    pub fn from_vec(entries: Vec<B>) -> Self {
        let floor = DEFAULT_HEAP_CAPACITY;
        let capacity = entries.len().max(floor);
        let mut heap = Self {
            entries,
            capacity,
            floor,
        };
        let len = heap.entries.len();
        heap.entries.reserve_exact(capacity - len);

        for index in (0..len / 2).rev() {
            heap.sift_down(index);
        }
        heap
    }

    /// Number of batches in the heap.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the heap is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current backing capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Capacity the heap returns to once drained.
    #[must_use]
    pub const fn floor(&self) -> usize {
        self.floor
    }

    /// Insert a batch, doubling capacity when full.
    pub fn push(&mut self, batch: B) {
        if self.entries.len() == self.capacity {
            self.capacity *= 2;
            let additional = self.capacity - self.entries.len();
            self.entries.reserve_exact(additional);
        }

        self.entries.push(batch);
        self.sift_up(self.entries.len() - 1);
    }

    /// The batch with the smallest representative id.
    #[must_use]
    pub fn peek(&self) -> Option<&B> {
        self.entries.first()
    }

    /// Remove and return the batch with the smallest representative id.
    ///
    /// # Panics
    ///
    /// Panics when the heap is empty. Check [`len`](Self::len) first or use
    /// [`pop`](Self::pop).
    pub fn extract_min(&mut self) -> B {
        assert!(
            !self.entries.is_empty(),
            "extract_min called on an empty heap"
        );

        let root = self.entries.swap_remove(0);

        if !self.entries.is_empty() {
            self.sift_down(0);
        } else if self.capacity > self.floor {
            self.entries = Vec::with_capacity(self.floor);
            self.capacity = self.floor;
        }

        root
    }

    /// Checked variant of [`extract_min`](Self::extract_min).
    pub fn pop(&mut self) -> Option<B> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.extract_min())
        }
    }

    fn less(&self, a: usize, b: usize) -> bool {
        self.entries[a].representative_id() < self.entries[b].representative_id()
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(index, parent) {
                break;
            }
            self.entries.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.entries.len();

        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;

            if left < len && self.less(left, smallest) {
                smallest = left;
            }
            if right < len && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == index {
                return;
            }

            self.entries.swap(index, smallest);
            index = smallest;
        }
    }
}
