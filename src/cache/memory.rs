//! Cost-bounded in-memory LRU tier.
//!
//! Entries carry a caller-defined cost (decoded bytes for bitmaps). When the
//! total cost exceeds capacity, least-recently-used entries are evicted inside
//! the same `insert` call until it fits again. Evicted values are dropped
//! after the lock is released, which is where their buffers are freed.

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

/// Something whose memory footprint the tier can account for.
pub trait Weighted {
    fn cost(&self) -> usize;
}

struct Inner<V> {
    entries: LruCache<String, V>,
    cost: usize,
    evictions: u64,
}

pub struct MemoryCache<V> {
    capacity: usize,
    inner: Mutex<Inner<V>>,
}

impl<V: Weighted + Clone> MemoryCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                cost: 0,
                evictions: 0,
            }),
        }
    }

    /// Look up and mark as most recently used.
    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Membership check; does not touch recency.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Insert or replace. The entry becomes most recently used.
    pub fn insert(&self, key: &str, value: V) {
        let evicted = {
            let mut inner = self.inner.lock();
            let cost = value.cost();
            if let Some(old) = inner.entries.put(key.to_string(), value) {
                inner.cost -= old.cost();
            }
            inner.cost += cost;
            self.trim(&mut inner)
        };
        drop(evicted);
    }

    /// Insert only if `key` is absent. An existing entry keeps its value and
    /// its recency. Returns whether the value was inserted.
    pub fn insert_if_absent(&self, key: &str, value: V) -> bool {
        let evicted = {
            let mut inner = self.inner.lock();
            if inner.entries.contains(key) {
                return false;
            }
            inner.cost += value.cost();
            inner.entries.put(key.to_string(), value);
            self.trim(&mut inner)
        };
        drop(evicted);
        true
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let removed = inner.entries.pop(key)?;
        inner.cost -= removed.cost();
        Some(removed)
    }

    /// Drop every entry.
    pub fn evict_all(&self) {
        let drained: Vec<(String, V)> = {
            let mut inner = self.inner.lock();
            inner.cost = 0;
            let mut drained = Vec::with_capacity(inner.entries.len());
            while let Some(entry) = inner.entries.pop_lru() {
                drained.push(entry);
            }
            drained
        };
        debug!(entries = drained.len(), "Evicted memory tier");
    }

    pub fn cost(&self) -> usize {
        self.inner.lock().cost
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evictions(&self) -> u64 {
        self.inner.lock().evictions
    }

    fn trim(&self, inner: &mut Inner<V>) -> Vec<(String, V)> {
        let mut evicted = Vec::new();
        while inner.cost > self.capacity {
            let Some((key, value)) = inner.entries.pop_lru() else {
                break;
            };
            inner.cost -= value.cost();
            inner.evictions += 1;
            debug!(key = %key, cost = value.cost(), "Evicted from memory tier");
            evicted.push((key, value));
        }
        evicted
    }
}
