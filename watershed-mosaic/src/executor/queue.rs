//! Priority queue for batch scheduling.
//!
//! Entries are ordered by priority (higher values first), then by enqueue
//! order (FIFO within the same priority level).
//!
//! # Example
//!
//! ```ignore
//! use watershed_mosaic::executor::{PriorityQueue, Priority};
//!
//! let mut queue = PriorityQueue::new();
//! queue.push("small", Priority::for_index(1));
//! queue.push("large", Priority::for_index(0));
//!
//! // the higher priority comes out first despite being pushed second
//! assert_eq!(queue.pop().unwrap().item, "large");
//! ```

use super::policy::Priority;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

// =============================================================================
// Queued Entry
// =============================================================================

/// An item waiting to be scheduled.
#[derive(Debug)]
pub struct Queued<T> {
    pub item: T,

    /// Higher = more important.
    pub priority: Priority,

    /// FIFO tiebreak within a priority level.
    sequence: u64,

    pub enqueued_at: Instant,
}

impl<T> Queued<T> {
    /// How long the entry has been waiting.
    pub fn wait_time(&self) -> std::time::Duration {
        self.enqueued_at.elapsed()
    }
}

// Ordering for BinaryHeap: higher priority first, then lower sequence (older) first
impl<T> PartialEq for Queued<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl<T> Eq for Queued<T> {}

impl<T> PartialOrd for Queued<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Queued<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: natural priority order, reversed sequence order
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

// =============================================================================
// Priority Queue
// =============================================================================

/// Max-priority queue with FIFO ordering inside a priority level.
///
/// Not thread-safe; the scheduler wraps it in a `parking_lot::Mutex`.
pub struct PriorityQueue<T> {
    heap: BinaryHeap<Queued<T>>,
    next_sequence: u64,
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            next_sequence: 0,
        }
    }

    pub fn push(&mut self, item: T, priority: Priority) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(Queued {
            item,
            priority,
            sequence,
            enqueued_at: Instant::now(),
        });
    }

    /// Removes and returns the highest-priority entry.
    pub fn pop(&mut self) -> Option<Queued<T>> {
        self.heap.pop()
    }

    pub fn peek(&self) -> Option<&Queued<T>> {
        self.heap.peek()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
