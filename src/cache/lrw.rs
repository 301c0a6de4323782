//! LRW Tracker Module
//!
//! Implements Least Recently Written tracking for capacity eviction.

use std::collections::VecDeque;

// == LRW Tracker ==
/// Tracks write order for the eviction strategy.
///
/// Keys are stored in a VecDeque where:
/// - Front = Most recently written
/// - Back = Least recently written
#[derive(Debug)]
pub struct LrwTracker<K> {
    /// Order of keys by write time
    order: VecDeque<K>,
}

impl<K: PartialEq + Clone> LrwTracker<K> {
    // == Constructor ==
    /// Creates a new empty tracker.
    pub fn new() -> Self {
        Self {
            order: VecDeque::new(),
        }
    }

    // == Touch ==
    /// Marks a key as just written (moves to front).
    pub fn touch(&mut self, key: &K) {
        self.remove(key);
        self.order.push_front(key.clone());
    }

    // == Remove ==
    /// Removes a key from the tracker.
    pub fn remove(&mut self, key: &K) {
        self.order.retain(|k| k != key);
    }

    // == Evict Oldest ==
    /// Returns and removes the least recently written key.
    ///
    /// Returns None if tracker is empty.
    pub fn evict_oldest(&mut self) -> Option<K> {
        self.order.pop_back()
    }

    /// Returns the least recently written key without removing it.
    #[cfg(test)]
    fn peek_oldest(&self) -> Option<&K> {
        self.order.back()
    }

    pub fn clear(&mut self) {
        self.order.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl<K: PartialEq + Clone> Default for LrwTracker<K> {
    fn default() -> Self {
        Self::new()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lrw_new() {
        let lrw: LrwTracker<&str> = LrwTracker::new();
        assert!(lrw.is_empty());
        assert_eq!(lrw.len(), 0);
    }

    #[test]
    fn test_lrw_touch_existing_key() {
        let mut lrw = LrwTracker::new();

        lrw.touch(&"key1");
        lrw.touch(&"key2");
        lrw.touch(&"key3");

        // Rewrite key1 - should move to front
        lrw.touch(&"key1");

        assert_eq!(lrw.len(), 3);
        assert_eq!(lrw.peek_oldest(), Some(&"key2"));
    }

    #[test]
    fn test_lrw_evict_order() {
        let mut lrw = LrwTracker::new();

        lrw.touch(&1);
        lrw.touch(&2);
        lrw.touch(&3);
        lrw.touch(&1);

        assert_eq!(lrw.evict_oldest(), Some(2));
        assert_eq!(lrw.evict_oldest(), Some(3));
        assert_eq!(lrw.evict_oldest(), Some(1));
        assert_eq!(lrw.evict_oldest(), None);
    }

    #[test]
    fn test_lrw_remove_and_clear() {
        let mut lrw = LrwTracker::new();

        lrw.touch(&"a");
        lrw.touch(&"b");
        lrw.remove(&"a");
        lrw.remove(&"nonexistent");
        assert_eq!(lrw.len(), 1);
        assert_eq!(lrw.peek_oldest(), Some(&"b"));

        lrw.clear();
        assert!(lrw.is_empty());
    }
}
