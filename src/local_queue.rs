//! Fiber-local input queue: a bounded ring of buffer handles.

use crate::buffer::BufferHandle;
use std::collections::VecDeque;

pub(crate) struct LocalQueue {
    entries: VecDeque<BufferHandle>,
    capacity: usize,
}

impl LocalQueue {
    /// `capacity` is rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() == self.capacity
    }

    /// Appends a handle. When full, the oldest entry is released first.
    /// Returns true if an entry was evicted.
    pub fn push_evicting(&mut self, handle: BufferHandle) -> bool {
        let evicted = self.is_full();
        if evicted {
            self.entries.pop_front();
        }
        self.entries.push_back(handle);
        evicted
    }

    pub fn head(&self) -> Option<&BufferHandle> {
        self.entries.front()
    }

    /// Releases the head entry.
    pub fn drop_head(&mut self) -> bool {
        self.entries.pop_front().is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::WriteBuffer;

    fn handle(byte: u8) -> BufferHandle {
        WriteBuffer::from_slice(&[byte]).unwrap().publish(1, 0).unwrap()
    }

    #[test]
    fn test_capacity_rounds_up() {
        assert_eq!(LocalQueue::new(3).capacity(), 4);
        assert_eq!(LocalQueue::new(128).capacity(), 128);
        assert_eq!(LocalQueue::new(0).capacity(), 1);
    }

    #[test]
    fn test_fifo_and_eviction() {
        let mut q = LocalQueue::new(2);
        assert!(!q.push_evicting(handle(1)));
        assert!(!q.push_evicting(handle(2)));
        assert!(q.is_full());
        assert!(q.push_evicting(handle(3)));

        assert_eq!(q.head().unwrap().payload(), &[2]);
        assert!(q.drop_head());
        assert_eq!(q.head().unwrap().payload(), &[3]);
        q.clear();
        assert!(q.is_empty());
        assert!(!q.drop_head());
    }
}
