//! LRU (Least Recently Used) cache for table data blocks.
//!
//! The block cache is a process-wide resource shared by every reader.
//! Inserts are idempotent: concurrent loads of the same block settle on
//! one entry and the duplicate bytes are dropped.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// A unique identifier for a cached block: the owning file's cache id and
/// the block's offset within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// File identity (distinct for a table's main and sub files).
    pub file_id: u64,
    /// Block offset in the file.
    pub offset: u64,
}

impl CacheKey {
    /// Create a new cache key.
    pub fn new(file_id: u64, offset: u64) -> Self {
        Self { file_id, offset }
    }
}

/// Statistics for cache performance monitoring.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Total number of cache lookups.
    pub lookups: u64,
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of insertions.
    pub insertions: u64,
    /// Number of evictions.
    pub evictions: u64,
}

impl CacheStats {
    /// Cache hit rate in [0.0, 1.0].
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}

struct CacheShardState {
    entries: HashMap<CacheKey, Bytes>,
    lru_queue: VecDeque<CacheKey>,
    current_size: usize,
    stats: CacheStats,
}

/// Thread-safe, byte-bounded LRU cache for decompressed blocks.
pub struct BlockCache {
    capacity: usize,
    state: Mutex<CacheShardState>,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache").field("capacity", &self.capacity).finish()
    }
}

impl BlockCache {
    /// Create a cache with the given byte capacity. Capacity 0 disables
    /// caching entirely.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(CacheShardState {
                entries: HashMap::new(),
                lru_queue: VecDeque::new(),
                current_size: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Look up a block, refreshing its LRU position on a hit.
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        if self.capacity == 0 {
            return None;
        }
        let mut state = self.state.lock();
        state.stats.lookups += 1;
        if let Some(data) = state.entries.get(key).cloned() {
            state.stats.hits += 1;
            if let Some(pos) = state.lru_queue.iter().position(|k| k == key) {
                state.lru_queue.remove(pos);
            }
            state.lru_queue.push_back(key.clone());
            Some(data)
        } else {
            state.stats.misses += 1;
            None
        }
    }

    /// Insert a block, evicting least-recently-used entries to stay under
    /// capacity. Re-inserting an existing key is a no-op.
    pub fn insert(&self, key: CacheKey, data: Bytes) {
        if self.capacity == 0 || data.len() > self.capacity {
            return;
        }
        let mut state = self.state.lock();
        if state.entries.contains_key(&key) {
            return;
        }

        while state.current_size + data.len() > self.capacity {
            let victim = match state.lru_queue.pop_front() {
                Some(k) => k,
                None => break,
            };
            if let Some(evicted) = state.entries.remove(&victim) {
                state.current_size -= evicted.len();
                state.stats.evictions += 1;
            }
        }

        state.current_size += data.len();
        state.entries.insert(key.clone(), data);
        state.lru_queue.push_back(key);
        state.stats.insertions += 1;
    }

    /// Drop every cached block belonging to `file_id` (its main-file id
    /// plus sub-file ids). Called when a table file is deleted.
    pub fn evict_file(&self, file_id: u64) {
        let mut state = self.state.lock();
        let doomed: Vec<CacheKey> =
            state.entries.keys().filter(|k| k.file_id >> 8 == file_id >> 8).cloned().collect();
        for key in doomed {
            if let Some(evicted) = state.entries.remove(&key) {
                state.current_size -= evicted.len();
            }
            if let Some(pos) = state.lru_queue.iter().position(|k| *k == key) {
                state.lru_queue.remove(pos);
            }
        }
    }

    /// Current cached bytes.
    pub fn size(&self) -> usize {
        self.state.lock().current_size
    }

    /// A copy of the running statistics.
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_of(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[test]
    fn test_insert_and_get() {
        let cache = BlockCache::new(1024);
        let key = CacheKey::new(1, 0);
        cache.insert(key.clone(), bytes_of(100, b'x'));

        assert_eq!(cache.get(&key).unwrap().len(), 100);
        assert_eq!(cache.size(), 100);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.insertions, 1);
    }

    #[test]
    fn test_idempotent_insert() {
        let cache = BlockCache::new(1024);
        let key = CacheKey::new(1, 0);
        cache.insert(key.clone(), bytes_of(100, b'a'));
        cache.insert(key.clone(), bytes_of(100, b'b'));

        // First insert wins; size is not double-counted
        assert_eq!(cache.size(), 100);
        assert_eq!(cache.get(&key).unwrap()[0], b'a');
    }

    #[test]
    fn test_lru_eviction() {
        let cache = BlockCache::new(250);
        cache.insert(CacheKey::new(1, 0), bytes_of(100, b'a'));
        cache.insert(CacheKey::new(1, 100), bytes_of(100, b'b'));

        // Touch the first entry so the second becomes the LRU victim
        assert!(cache.get(&CacheKey::new(1, 0)).is_some());
        cache.insert(CacheKey::new(1, 200), bytes_of(100, b'c'));

        assert!(cache.get(&CacheKey::new(1, 0)).is_some());
        assert!(cache.get(&CacheKey::new(1, 100)).is_none());
        assert!(cache.get(&CacheKey::new(1, 200)).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let cache = BlockCache::new(0);
        let key = CacheKey::new(1, 0);
        cache.insert(key.clone(), bytes_of(10, b'x'));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_evict_file() {
        let cache = BlockCache::new(4096);
        // Cache ids: main file = number << 8, subs share the high bits
        cache.insert(CacheKey::new(7 << 8, 0), bytes_of(10, b'a'));
        cache.insert(CacheKey::new((7 << 8) | 1, 0), bytes_of(10, b'b'));
        cache.insert(CacheKey::new(8 << 8, 0), bytes_of(10, b'c'));

        cache.evict_file(7 << 8);
        assert!(cache.get(&CacheKey::new(7 << 8, 0)).is_none());
        assert!(cache.get(&CacheKey::new((7 << 8) | 1, 0)).is_none());
        assert!(cache.get(&CacheKey::new(8 << 8, 0)).is_some());
    }
}
