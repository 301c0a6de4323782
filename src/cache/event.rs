//! Cache Event Module
//!
//! Notifications delivered to a cache's event listener.

// == Cache Event ==
/// A change to the cache's contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent<K, V> {
    /// A value was written under `key`
    Put { key: K, value: V },
    /// `key` was deleted by a caller
    Delete { key: K },
    /// `key` was purged by the expiry engine
    Expired { key: K },
    /// `key` was evicted to make room for a new key
    Evicted { key: K },
}

impl<K, V> CacheEvent<K, V> {
    /// The key the event is about.
    pub fn key(&self) -> &K {
        match self {
            CacheEvent::Put { key, .. }
            | CacheEvent::Delete { key }
            | CacheEvent::Expired { key }
            | CacheEvent::Evicted { key } => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_key() {
        let put: CacheEvent<&str, i32> = CacheEvent::Put { key: "a", value: 1 };
        let expired: CacheEvent<&str, i32> = CacheEvent::Expired { key: "b" };
        assert_eq!(put.key(), &"a");
        assert_eq!(expired.key(), &"b");
    }
}
