//! Size-bounded in-memory object cache

use super::lru::LruCache;
use crate::model::{Blob, Hash, Tree};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Objects that know their approximate memory footprint
pub trait Weighted {
    fn weight(&self) -> usize;
}

impl Weighted for Arc<Tree> {
    fn weight(&self) -> usize {
        Tree::weight(self)
    }
}

impl Weighted for Blob {
    fn weight(&self) -> usize {
        self.len() + 64
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub current_size: u64,
    pub max_size: u64,
    pub entry_count: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Fill level as a percentage
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            (self.current_size as f64 / self.max_size as f64) * 100.0
        }
    }
}

struct CacheInner<V> {
    entries: HashMap<Hash, V>,
    lru: LruCache<Hash>,
    current_size: u64,
    hits: u64,
    misses: u64,
}

/// Byte-weighted LRU cache keyed by content hash.
///
/// Eviction never breaks an inode: inodes keep only hashes and fetch again
/// through the object store on a miss.
pub struct ObjectCache<V: Clone + Weighted> {
    inner: Mutex<CacheInner<V>>,
    max_size: u64,
}

impl<V: Clone + Weighted> ObjectCache<V> {
    pub fn new(max_size: u64) -> Self {
        ObjectCache {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                lru: LruCache::new(),
                current_size: 0,
                hits: 0,
                misses: 0,
            }),
            max_size,
        }
    }

    pub fn get(&self, hash: &Hash) -> Option<V> {
        let mut inner = self.inner.lock();
        match inner.entries.get(hash).cloned() {
            Some(value) => {
                inner.hits += 1;
                inner.lru.touch(hash);
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert an object, evicting least recently used ones to stay in budget.
    /// Objects larger than the whole budget are not cached.
    pub fn insert(&self, hash: Hash, value: V) {
        let weight = value.weight() as u64;
        if weight > self.max_size {
            return;
        }

        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.insert(hash, value) {
            inner.current_size -= old.weight() as u64;
        }
        inner.current_size += weight;
        inner.lru.insert(hash);

        while inner.current_size > self.max_size {
            let Some(victim) = inner.lru.pop_oldest() else {
                break;
            };
            if let Some(evicted) = inner.entries.remove(&victim) {
                inner.current_size -= evicted.weight() as u64;
            }
        }
    }

    pub fn remove(&self, hash: &Hash) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.remove(hash) {
            inner.current_size -= old.weight() as u64;
            inner.lru.remove(hash);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.lru.clear();
        inner.current_size = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            current_size: inner.current_size,
            max_size: self.max_size,
            entry_count: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(size: usize, fill: u8) -> Blob {
        Blob::new(vec![fill; size])
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = ObjectCache::new(10_000);
        let b = blob(10, 1);
        cache.insert(b.hash(), b.clone());

        assert_eq!(cache.get(&b.hash()), Some(b));
        assert!(cache.get(&Hash::ZERO).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        // Each blob weighs 100 + 64
        let cache = ObjectCache::new(400);
        let a = blob(100, 1);
        let b = blob(100, 2);
        let c = blob(100, 3);

        cache.insert(a.hash(), a.clone());
        cache.insert(b.hash(), b.clone());
        cache.get(&a.hash());
        cache.insert(c.hash(), c.clone());

        assert!(cache.get(&a.hash()).is_some());
        assert!(cache.get(&b.hash()).is_none());
        assert!(cache.get(&c.hash()).is_some());
        assert!(cache.stats().current_size <= 400);
    }

    #[test]
    fn test_oversized_not_cached() {
        let cache = ObjectCache::new(100);
        let big = blob(1000, 7);
        cache.insert(big.hash(), big.clone());
        assert!(cache.get(&big.hash()).is_none());
        assert_eq!(cache.stats().current_size, 0);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = ObjectCache::new(10_000);
        let a = blob(10, 1);
        cache.insert(a.hash(), a.clone());
        cache.remove(&a.hash());
        assert_eq!(cache.stats().current_size, 0);

        cache.insert(a.hash(), a);
        cache.clear();
        assert_eq!(cache.stats().entry_count, 0);
    }
}
