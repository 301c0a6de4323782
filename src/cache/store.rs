//! Cache Store Module
//!
//! The backing table: a HashMap from key to values, with an optional
//! capacity bound enforced by least-recently-written eviction. It knows
//! nothing about locks or expiry.

use std::collections::HashMap;
use std::hash::Hash;

use crate::cache::LrwTracker;
use crate::config::StorageMode;

// == Cache Store ==
/// Key/value table supporting single-value (`Set`) and multi-value (`Bag`) keys.
#[derive(Debug)]
pub struct CacheStore<K, V> {
    /// Key-value storage; a `Set` key always holds exactly one value
    entries: HashMap<K, Vec<V>>,
    /// Write order tracker, used only when bounded
    lrw: LrwTracker<K>,
    /// Expiry stamp of each key's latest write; unstamped keys count as 0
    generations: HashMap<K, u64>,
    /// Maximum number of keys allowed (0 = unbounded)
    max_entries: usize,
    mode: StorageMode,
}

impl<K, V> CacheStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    // == Constructor ==
    /// Creates a new CacheStore.
    ///
    /// # Arguments
    /// * `mode` - Single-value or multi-value keys
    /// * `max_entries` - Maximum number of keys (0 = unbounded)
    pub fn new(mode: StorageMode, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            lrw: LrwTracker::new(),
            generations: HashMap::new(),
            max_entries,
            mode,
        }
    }

    // == Insert ==
    /// Stores a value under `key`.
    ///
    /// In `Set` mode the value replaces any previous one; in `Bag` mode it is
    /// appended. If a new key would exceed the capacity, the least recently
    /// written key is evicted and returned.
    pub fn insert(&mut self, key: K, value: V) -> Option<K> {
        let is_new = !self.entries.contains_key(&key);

        let mut evicted = None;
        if is_new && self.max_entries > 0 && self.entries.len() >= self.max_entries {
            evicted = self.lrw.evict_oldest();
            if let Some(old) = &evicted {
                self.entries.remove(old);
                self.generations.remove(old);
            }
        }

        if self.max_entries > 0 {
            self.lrw.touch(&key);
        }

        match self.mode {
            StorageMode::Set => {
                self.entries.insert(key, vec![value]);
            }
            StorageMode::Bag => self.entries.entry(key).or_default().push(value),
        }

        evicted
    }

    // == Get ==
    /// Returns the first value stored under `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).and_then(|values| values.first())
    }

    /// Returns every value stored under `key`.
    pub fn get_all(&self, key: &K) -> Option<&[V]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    // == Generations ==
    /// Tags `key`'s current entry with the stamp of the TTL update that
    /// accompanied its latest write. Missing keys are ignored.
    pub fn stamp(&mut self, key: &K, generation: u64) {
        if self.entries.contains_key(key) {
            self.generations.insert(key.clone(), generation);
        }
    }

    /// Removes `key` on behalf of the expiry engine.
    ///
    /// `sealed` is the last stamp the engine had applied when it decided the
    /// key was due. An entry stamped later was rewritten after that decision
    /// and is kept.
    pub fn expire(&mut self, key: &K, sealed: u64) -> Option<Vec<V>> {
        let generation = self.generations.get(key).copied().unwrap_or(0);
        if generation > sealed {
            return None;
        }
        self.remove(key)
    }

    // == Remove ==
    /// Removes `key` and returns its values.
    pub fn remove(&mut self, key: &K) -> Option<Vec<V>> {
        let removed = self.entries.remove(key);
        self.generations.remove(key);
        if removed.is_some() && self.max_entries > 0 {
            self.lrw.remove(key);
        }
        removed
    }

    // == Clear ==
    /// Removes every entry and returns the removed keys.
    pub fn clear(&mut self) -> Vec<K> {
        self.lrw.clear();
        self.generations.clear();
        self.entries.drain().map(|(key, _)| key).collect()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.keys().cloned().collect()
    }

    /// Returns the current number of keys in the store.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
