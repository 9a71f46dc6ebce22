//! A fixed-capacity ring buffer that drops oldest elements when full.

use std::collections::VecDeque;

/// A fixed-capacity ring buffer that automatically drops the oldest element
/// when pushing to a full buffer.
///
/// Used for the capture history, where only the most recent photos are kept
/// addressable.
#[derive(Debug, Clone, PartialEq)]
pub struct RingBuffer<T> {
    data: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create a new ring buffer with the specified capacity.
    ///
    /// # Panics
    /// Panics if capacity is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RingBuffer capacity must be > 0");
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a value, returning the evicted oldest element if the buffer was full.
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.data.len() >= self.capacity {
            self.data.pop_front()
        } else {
            None
        };
        self.data.push_back(value);
        evicted
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.data.iter()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Oldest element.
    pub fn front(&self) -> Option<&T> {
        self.data.front()
    }

    /// Newest element.
    pub fn back(&self) -> Option<&T> {
        self.data.back()
    }

    /// First element matching `pred`, searching newest first.
    pub fn find_newest<P>(&self, mut pred: P) -> Option<&T>
    where
        P: FnMut(&T) -> bool,
    {
        self.data.iter().rev().find(|item| pred(item))
    }
}

impl<T> IntoIterator for RingBuffer<T> {
    type Item = T;
    type IntoIter = std::collections::vec_deque::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.data.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a RingBuffer<T> {
    type Item = &'a T;
    type IntoIter = std::collections::vec_deque::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.data.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_within_capacity() {
        let mut buf = RingBuffer::new(3);
        assert_eq!(buf.push(1), None);
        assert_eq!(buf.push(2), None);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.front(), Some(&1));
        assert_eq!(buf.back(), Some(&2));
    }

    #[test]
    fn test_push_evicts_oldest() {
        let mut buf = RingBuffer::new(2);
        buf.push("a");
        buf.push("b");
        assert_eq!(buf.push("c"), Some("a"));
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(buf.len(), buf.capacity());
    }

    #[test]
    fn test_find_newest_prefers_latest() {
        let mut buf = RingBuffer::new(4);
        for (k, v) in [(1, 'x'), (2, 'y'), (1, 'z')] {
            buf.push((k, v));
        }
        assert_eq!(buf.find_newest(|(k, _)| *k == 1), Some(&(1, 'z')));
        assert_eq!(buf.find_newest(|(k, _)| *k == 9), None);
    }

    #[test]
    fn test_clear_and_iterators() {
        let mut buf = RingBuffer::new(3);
        buf.push(1);
        buf.push(2);
        let borrowed: Vec<_> = (&buf).into_iter().copied().collect();
        assert_eq!(borrowed, vec![1, 2]);

        let owned: Vec<_> = buf.clone().into_iter().collect();
        assert_eq!(owned, vec![1, 2]);

        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn test_zero_capacity_panics() {
        let _ = RingBuffer::<u8>::new(0);
    }
}
