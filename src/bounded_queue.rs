//! A small thread-safe queue that never blocks its producer: when it is
//! full, the oldest entry is thrown away to make room.

use crate::lock;

use std::{collections::VecDeque, sync::Mutex};

#[derive(Debug)]
pub struct BoundedQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
}

impl<T> BoundedQueue<T> {
    /// A queue holding at most `capacity` items. A capacity of zero is
    /// bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `item`, returning whatever had to be evicted to fit it.
    pub fn push(&self, item: T) -> Option<T> {
        let mut items = lock(&self.items);
        let evicted = if items.len() >= self.capacity {
            items.pop_front()
        } else {
            None
        };
        items.push_back(item);
        evicted
    }

    /// Oldest item, if any.
    pub fn pop(&self) -> Option<T> {
        lock(&self.items).pop_front()
    }

    /// Newest item, discarding everything older.
    pub fn take_latest(&self) -> Option<T> {
        let mut items = lock(&self.items);
        let latest = items.pop_back();
        items.clear();
        latest
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.items).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_when_full() {
        let queue = BoundedQueue::new(3);
        for i in 0..3 {
            assert_eq!(queue.push(i), None);
        }
        assert_eq!(queue.push(3), Some(0));
        assert_eq!(queue.push(4), Some(1));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(4));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn take_latest_empties_the_queue() {
        let queue = BoundedQueue::new(5);
        queue.push('a');
        queue.push('b');
        assert_eq!(queue.take_latest(), Some('b'));
        assert!(queue.is_empty());
    }

    #[test]
    fn single_slot_keeps_only_the_newest() {
        let queue = BoundedQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.push(1);
        assert_eq!(queue.push(2), Some(1));
        assert_eq!(queue.pop(), Some(2));
    }
}
