//! LRU cache of decoded objects.
//!
//! Objects are immutable and named by their content hash, so a cached entry
//! can never go stale; the cache only needs bounding, never invalidation.

use crate::{GitObject, ObjectId};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Configuration for the cache layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of objects to cache. Zero disables the cache.
    pub max_objects: usize,
    /// Maximum total payload size in bytes.
    pub max_size_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_objects: 10_000,
            max_size_bytes: 64 * 1024 * 1024, // 64 MB
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of evictions.
    pub evictions: u64,
    /// Current number of cached objects.
    pub size: usize,
    /// Current memory usage in bytes.
    pub memory_bytes: usize,
}

impl CacheStats {
    /// Returns the cache hit ratio.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheMetrics {
    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: 0,
            memory_bytes: 0,
        }
    }
}

#[derive(Debug)]
struct Entries {
    lru: LruCache<ObjectId, GitObject>,
    bytes: usize,
}

/// Bounded LRU cache keyed by [`ObjectId`].
#[derive(Debug)]
pub struct ObjectCache {
    entries: Option<Mutex<Entries>>,
    config: CacheConfig,
    metrics: CacheMetrics,
}

impl ObjectCache {
    /// Creates a cache with the given bounds.
    pub fn new(config: CacheConfig) -> Self {
        let entries = NonZeroUsize::new(config.max_objects)
            .filter(|_| config.max_size_bytes > 0)
            .map(|cap| {
                Mutex::new(Entries {
                    lru: LruCache::new(cap),
                    bytes: 0,
                })
            });
        Self {
            entries,
            config,
            metrics: CacheMetrics::default(),
        }
    }

    /// Returns the cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Looks up an object, updating recency and hit/miss counters.
    pub fn get(&self, id: &ObjectId) -> Option<GitObject> {
        let entries = self.entries.as_ref()?;
        let found = entries.lock().lru.get(id).cloned();
        if found.is_some() {
            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// True when `id` is cached. Does not touch recency or counters.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.entries
            .as_ref()
            .is_some_and(|entries| entries.lock().lru.contains(id))
    }

    /// Inserts an object, evicting least recently used entries as needed.
    ///
    /// Objects larger than the byte cap are not cached.
    pub fn insert(&self, object: &GitObject) {
        let Some(entries) = self.entries.as_ref() else {
            return;
        };
        let size = object.data.len();
        if size > self.config.max_size_bytes {
            return;
        }

        let mut entries = entries.lock();
        if entries.lru.contains(&object.id) {
            entries.lru.promote(&object.id);
            return;
        }
        while entries.bytes + size > self.config.max_size_bytes
            || entries.lru.len() >= self.config.max_objects
        {
            match entries.lru.pop_lru() {
                Some((_, evicted)) => {
                    entries.bytes -= evicted.data.len();
                    self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
        entries.lru.put(object.id, object.clone());
        entries.bytes += size;
    }

    /// Drops every cached object.
    pub fn clear(&self) {
        if let Some(entries) = self.entries.as_ref() {
            let mut entries = entries.lock();
            entries.lru.clear();
            entries.bytes = 0;
        }
    }

    /// Returns current cache statistics.
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.metrics.snapshot();
        if let Some(entries) = self.entries.as_ref() {
            let entries = entries.lock();
            stats.size = entries.lru.len();
            stats.memory_bytes = entries.bytes;
        }
        stats
    }
}
