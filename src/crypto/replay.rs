//! Replay protection for session salts.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Bounded set of the most recently seen salts.
pub const REPLAY_CACHE_SIZE: usize = 1024;

/// LRU set of recently observed salts. Shared process-wide; a salt seen
/// twice within the window means a replayed stream.
#[derive(Debug)]
pub struct ReplayCache {
    cache: Mutex<LruCache<Box<[u8]>, ()>>,
}

impl ReplayCache {
    pub fn new(capacity: usize) -> Self {
        ReplayCache {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity)
                    .unwrap_or_else(|| NonZeroUsize::new(REPLAY_CACHE_SIZE).unwrap()),
            )),
        }
    }

    /// Record `salt`, reporting whether it was fresh. A hit refreshes the
    /// entry's recency; a miss at capacity evicts the least recent salt.
    pub fn insert_if_absent(&self, salt: &[u8]) -> bool {
        let mut cache = self.cache.lock();
        if cache.get(salt).is_some() {
            return false;
        }
        cache.put(salt.to_vec().into_boxed_slice(), ());
        true
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(REPLAY_CACHE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_then_replayed() {
        let cache = ReplayCache::default();
        assert!(cache.insert_if_absent(&[1u8; 32]));
        assert!(!cache.insert_if_absent(&[1u8; 32]));
        assert!(cache.insert_if_absent(&[2u8; 32]));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_eviction_at_capacity() {
        let cache = ReplayCache::new(4);
        for i in 0u8..4 {
            assert!(cache.insert_if_absent(&[i; 16]));
        }
        // Fifth insert evicts the oldest.
        assert!(cache.insert_if_absent(&[4u8; 16]));
        assert_eq!(cache.len(), 4);
        // The evicted salt reads as fresh again.
        assert!(cache.insert_if_absent(&[0u8; 16]));
    }

    #[test]
    fn test_hit_refreshes_recency() {
        let cache = ReplayCache::new(3);
        cache.insert_if_absent(b"a");
        cache.insert_if_absent(b"b");
        cache.insert_if_absent(b"c");

        // Touch "a" so "b" becomes the LRU entry.
        assert!(!cache.insert_if_absent(b"a"));
        cache.insert_if_absent(b"d");

        assert!(!cache.insert_if_absent(b"a"));
        assert!(cache.insert_if_absent(b"b"));
    }

    #[test]
    fn test_holds_full_window() {
        let cache = ReplayCache::default();
        for i in 0u16..REPLAY_CACHE_SIZE as u16 {
            assert!(cache.insert_if_absent(&i.to_be_bytes()));
        }
        assert_eq!(cache.len(), REPLAY_CACHE_SIZE);
        // All inserted salts are still present.
        for i in 0u16..REPLAY_CACHE_SIZE as u16 {
            assert!(!cache.insert_if_absent(&i.to_be_bytes()));
        }
    }
}
