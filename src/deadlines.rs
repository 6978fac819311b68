//! Bounded, time-sorted flat deadline structure.
//!
//! Entries are kept in a ring sorted by time. Entries with equal time keep
//! insertion order, so the structure is a strict total order without having to
//! compare payloads.

use crate::time::Timepoint;
use std::collections::VecDeque;

pub(crate) struct Deadlines<T> {
    entries: VecDeque<(Timepoint, T)>,
    capacity: usize,
}

impl<T> Deadlines<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn can_insert(&self) -> bool {
        self.entries.len() < self.capacity
    }

    /// Inserts after every entry with the same or earlier time.
    /// Hands the value back when the structure is full.
    pub fn insert(&mut self, time: Timepoint, value: T) -> Result<(), T> {
        if !self.can_insert() {
            return Err(value);
        }
        let at = self.entries.partition_point(|(t, _)| *t <= time);
        self.entries.insert(at, (time, value));
        Ok(())
    }

    /// Earliest deadline, if any.
    pub fn head_time(&self) -> Option<Timepoint> {
        self.entries.front().map(|(t, _)| *t)
    }

    /// Pops the head if its deadline is at or before `now`.
    pub fn pop_expired(&mut self, now: Timepoint) -> Option<(Timepoint, T)> {
        match self.entries.front() {
            Some((t, _)) if *t <= now => self.entries.pop_front(),
            _ => None,
        }
    }

    pub fn pop_head(&mut self) -> Option<(Timepoint, T)> {
        self.entries.pop_front()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (Timepoint, T)> + '_ {
        self.entries.drain(..)
    }
}

impl<T: PartialEq> Deadlines<T> {
    /// Removes the entry `(time, value)`. Returns false if it is not present.
    pub fn remove(&mut self, time: Timepoint, value: &T) -> bool {
        let start = self.entries.partition_point(|(t, _)| *t < time);
        let found = self
            .entries
            .iter()
            .skip(start)
            .take_while(|(t, _)| *t == time)
            .position(|(_, v)| v == value);
        match found {
            Some(offset) => {
                self.entries.remove(start + offset);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sorted_and_stable() {
        let mut d = Deadlines::new(8);
        d.insert(30, 'a').unwrap();
        d.insert(10, 'b').unwrap();
        d.insert(30, 'c').unwrap();
        d.insert(20, 'd').unwrap();

        assert_eq!(d.head_time(), Some(10));
        let order: Vec<_> = d.drain().map(|(_, v)| v).collect();
        assert_eq!(order, vec!['b', 'd', 'a', 'c']);
    }

    #[test]
    fn test_capacity() {
        let mut d = Deadlines::new(1);
        assert!(d.insert(1, 1).is_ok());
        assert!(!d.can_insert());
        assert_eq!(d.insert(2, 2), Err(2));
    }

    #[test]
    fn test_pop_expired() {
        let mut d = Deadlines::new(4);
        d.insert(100, 1).unwrap();
        d.insert(200, 2).unwrap();
        assert_eq!(d.pop_expired(99), None);
        assert_eq!(d.pop_expired(100), Some((100, 1)));
        assert_eq!(d.pop_expired(150), None);
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_remove_specific_entry() {
        let mut d = Deadlines::new(4);
        d.insert(5, 1).unwrap();
        d.insert(5, 2).unwrap();
        d.insert(7, 2).unwrap();

        assert!(d.remove(5, &2));
        assert!(!d.remove(5, &2));
        assert!(!d.remove(6, &1));
        assert_eq!(d.pop_head(), Some((5, 1)));
        assert_eq!(d.pop_head(), Some((7, 2)));
        assert!(d.is_empty());
    }

    proptest! {
        #[test]
        fn prop_drain_is_non_decreasing(times in proptest::collection::vec(0u64..1000, 0..64)) {
            let mut d = Deadlines::new(64);
            for (i, t) in times.iter().enumerate() {
                d.insert(*t, i).unwrap();
            }
            let drained: Vec<_> = d.drain().collect();
            prop_assert_eq!(drained.len(), times.len());
            for pair in drained.windows(2) {
                prop_assert!(pair[0].0 <= pair[1].0);
                if pair[0].0 == pair[1].0 {
                    prop_assert!(pair[0].1 < pair[1].1);
                }
            }
        }
    }
}
