//! Fixed-capacity line history.
//!
//! Holds the most recent lines of one device so a newly attached viewer can be
//! caught up without the daemon keeping unbounded history.

use std::collections::VecDeque;

/// A fixed-capacity FIFO that overwrites its oldest element when full.
///
/// Capacity is fixed at construction. `push` is O(1) and never fails;
/// `snapshot` copies the contents out in chronological order, so callers never
/// observe the buffer while it is being mutated.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    total_pushed: u64,
}

impl<T: Clone> RingBuffer<T> {
    /// Creates an empty buffer holding at most `capacity` elements.
    ///
    /// A zero capacity is accepted; such a buffer stores nothing.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            total_pushed: 0,
        }
    }

    /// Appends an element, evicting the oldest one if the buffer is full.
    pub fn push(&mut self, item: T) {
        self.total_pushed = self.total_pushed.saturating_add(1);

        if self.capacity == 0 {
            return;
        }

        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// Returns every held element, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    /// Number of elements currently held.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the buffer holds nothing.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of elements the buffer holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of elements ever pushed, including evicted ones.
    pub fn total_pushed(&self) -> u64 {
        self.total_pushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_below_capacity() {
        let mut ring = RingBuffer::new(4);
        ring.push("a");
        ring.push("b");
        assert_eq!(ring.snapshot(), vec!["a", "b"]);
        assert_eq!(ring.len(), 2);
        assert!(!ring.is_empty());
    }

    #[test]
    fn test_overflow_keeps_last_capacity_items_in_order() {
        for capacity in 1..8usize {
            for pushes in (capacity + 1)..(capacity * 3) {
                let mut ring = RingBuffer::new(capacity);
                for i in 0..pushes {
                    ring.push(i);
                }
                let expected: Vec<usize> = (pushes - capacity..pushes).collect();
                assert_eq!(ring.snapshot(), expected, "capacity={capacity} pushes={pushes}");
                assert_eq!(ring.len(), capacity);
            }
        }
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut ring = RingBuffer::new(2);
        ring.push(String::from("first"));
        let snap = ring.snapshot();
        ring.push(String::from("second"));
        ring.push(String::from("third"));
        assert_eq!(snap, vec!["first".to_string()]);
        assert_eq!(ring.snapshot(), vec!["second".to_string(), "third".to_string()]);
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let mut ring = RingBuffer::new(0);
        ring.push(1);
        ring.push(2);
        assert!(ring.is_empty());
        assert!(ring.snapshot().is_empty());
        assert_eq!(ring.total_pushed(), 2);
    }

    #[test]
    fn test_total_pushed_counts_evicted() {
        let mut ring = RingBuffer::new(3);
        for i in 0..10 {
            ring.push(i);
        }
        assert_eq!(ring.total_pushed(), 10);
        assert_eq!(ring.capacity(), 3);
    }
}
