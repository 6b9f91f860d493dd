use serde::Serialize;
use std::collections::VecDeque;

/// Default number of log lines kept for a job
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Fixed-capacity FIFO that evicts the oldest entry once full.
///
/// Insertion order is preserved; `iter` yields oldest first.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct BoundedBuffer<T> {
    #[serde(skip)]
    capacity: usize,
    items: VecDeque<T>,
}

/// Plain text lines captured from a running job
pub type LogBuffer = BoundedBuffer<String>;

impl<T> BoundedBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY)),
        }
    }

    /// Append an item, returning the evicted one if the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::collections::vec_deque::Iter<'_, T> {
        self.items.iter()
    }
}

impl<T: Clone> BoundedBuffer<T> {
    /// Copy of every retained item, oldest first
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    /// Copy of at most `n` of the most recent items, oldest first among them
    pub fn last_n(&self, n: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip).cloned().collect()
    }
}

impl<T> Default for BoundedBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_evicts_oldest_first() {
        let mut buf = BoundedBuffer::new(3);
        for i in 0..8 {
            buf.push(i);
        }
        assert_eq!(buf.to_vec(), vec![5, 6, 7]);
    }

    #[test]
    fn test_push_returns_evicted() {
        let mut buf = BoundedBuffer::new(2);
        assert_eq!(buf.push("a"), None);
        assert_eq!(buf.push("b"), None);
        assert_eq!(buf.push("c"), Some("a"));
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let mut buf = BoundedBuffer::new(0);
        assert_eq!(buf.push(1), Some(1));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_last_n() {
        let mut buf: LogBuffer = BoundedBuffer::new(10);
        for line in ["one", "two", "three", "four"] {
            buf.push(line.to_string());
        }
        assert_eq!(buf.last_n(2), vec!["three", "four"]);
        assert_eq!(buf.last_n(0), Vec::<String>::new());
        assert_eq!(buf.last_n(100).len(), 4);
    }

    #[test]
    fn test_serializes_as_sequence() {
        let mut buf = BoundedBuffer::new(2);
        buf.push(1);
        buf.push(2);
        buf.push(3);
        assert_eq!(serde_json::to_string(&buf).unwrap(), "[2,3]");
    }

    proptest! {
        #[test]
        fn prop_keeps_last_k_in_order(capacity in 1usize..64, extra in 0usize..64) {
            let mut buf = BoundedBuffer::new(capacity);
            let total = capacity + extra;
            for i in 0..total {
                buf.push(i);
                prop_assert!(buf.len() <= capacity);
            }
            let expected: Vec<usize> = (extra..total).collect();
            prop_assert_eq!(buf.to_vec(), expected);
        }
    }
}
