//! LRU Block Cache
//!
//! Bounded cache of block payloads keyed by block name. Recency is tracked
//! with a counter that ticks on every access; when the cache grows past its
//! capacity the entry with the smallest access stamp is dropped.

use std::collections::HashMap;

struct CacheEntry {
    data: Vec<u8>,
    atime: u64,
}

/// Capacity-bounded `name -> bytes` cache with least-recently-accessed
/// eviction.
pub struct LruCache {
    capacity: usize,
    time_cnt: u64,
    entries: HashMap<String, CacheEntry>,
}

impl LruCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            time_cnt: 1,
            entries: HashMap::new(),
        }
    }

    fn tick(&mut self) -> u64 {
        let t = self.time_cnt;
        self.time_cnt += 1;
        t
    }

    /// Returns the cached payload and refreshes its recency.
    pub fn get(&mut self, key: &str) -> Option<&[u8]> {
        let t = self.tick();
        let entry = self.entries.get_mut(key)?;
        entry.atime = t;
        Some(&entry.data)
    }

    /// Inserts or replaces an entry, evicting the least-recently-accessed one
    /// when the cache overflows.
    pub fn put(&mut self, key: &str, data: Vec<u8>) {
        let t = self.tick();
        if let Some(entry) = self.entries.get_mut(key) {
            entry.data = data;
            entry.atime = t;
            return;
        }
        self.entries.insert(key.to_string(), CacheEntry { data, atime: t });
        if self.entries.len() > self.capacity {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.atime)
                .map(|(key, _)| key.clone())
            {
                self.entries.remove(&oldest);
            }
        }
    }

    /// Drops an entry if present.
    pub fn invalidate(&mut self, key: &str) {
        self.entries.remove(key);
    }

    /// Rebounds the cache, evicting the coldest entries if it shrank.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.entries.len() > self.capacity {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.atime)
                .map(|(key, _)| key.clone())
            {
                self.entries.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
