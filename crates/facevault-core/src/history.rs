//! Bounded verification history, most-recent-first.

use std::collections::VecDeque;

pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

/// Fixed-capacity FIFO; pushing onto a full history evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct History<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> History<T> {
    /// `capacity` is clamped to at least one entry.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: T) {
        if self.entries.len() == self.capacity {
            self.entries.pop_back();
        }
        self.entries.push_front(entry);
    }

    /// Entries ordered newest first.
    pub fn recent(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn latest(&self) -> Option<&T> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone> Default for History<T> {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eleventh_entry_evicts_first() {
        let mut history = History::default();
        for i in 0..11 {
            history.push(i);
        }
        assert_eq!(history.len(), 10);
        let recent = history.recent();
        assert_eq!(recent.first(), Some(&10));
        assert_eq!(recent.last(), Some(&1));
        assert!(!recent.contains(&0));
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut history = History::new(3);
        for i in 0..50 {
            history.push(i);
            assert!(history.len() <= 3);
        }
        assert_eq!(history.recent(), vec![49, 48, 47]);
        assert_eq!(history.latest(), Some(&49));
    }

    #[test]
    fn test_clear_then_refill() {
        let mut history = History::new(3);
        for i in 0..5 {
            history.push(i);
        }
        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.capacity(), 3);

        history.push(7);
        assert_eq!(history.recent(), vec![7]);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut history = History::new(0);
        history.push("a");
        history.push("b");
        assert_eq!(history.capacity(), 1);
        assert_eq!(history.recent(), vec!["b"]);
    }
}
