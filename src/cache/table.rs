//! Table cache: open table readers bounded by count.
//!
//! File descriptors are a bounded resource; readers are opened through
//! this cache and evicted least-recently-used once `max_open_files` is
//! reached. A reader handed out stays usable after eviction (the `Arc`
//! keeps it alive); eviction only drops the cache's own reference.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::BlockCache;
use crate::config::Options;
use crate::error::Result;
use crate::sstable::ColumnTableReader;

struct TableCacheState {
    readers: HashMap<u64, Arc<ColumnTableReader>>,
    lru_queue: VecDeque<u64>,
}

/// Shared cache of open [`ColumnTableReader`]s keyed by file number.
pub struct TableCache {
    db_path: PathBuf,
    options: Options,
    block_cache: Option<Arc<BlockCache>>,
    capacity: usize,
    state: Mutex<TableCacheState>,
}

impl TableCache {
    /// Creates a table cache rooted at the database directory.
    pub fn new(
        db_path: &Path,
        options: Options,
        block_cache: Option<Arc<BlockCache>>,
    ) -> Self {
        let capacity = options.max_open_files;
        Self {
            db_path: db_path.to_path_buf(),
            options,
            block_cache,
            capacity,
            state: Mutex::new(TableCacheState {
                readers: HashMap::new(),
                lru_queue: VecDeque::new(),
            }),
        }
    }

    /// Main-file path of a table number inside the database directory.
    pub fn table_path(&self, file_number: u64) -> PathBuf {
        self.db_path.join(format!("{:06}.sst", file_number))
    }

    /// Returns the reader for `file_number`, opening it on a miss.
    pub fn get(&self, file_number: u64) -> Result<Arc<ColumnTableReader>> {
        {
            let mut state = self.state.lock();
            if let Some(reader) = state.readers.get(&file_number).cloned() {
                if let Some(pos) = state.lru_queue.iter().position(|n| *n == file_number) {
                    state.lru_queue.remove(pos);
                }
                state.lru_queue.push_back(file_number);
                return Ok(reader);
            }
        }

        // Open outside the lock; a racing open of the same file settles on
        // whichever insert lands first.
        let reader = ColumnTableReader::open(
            self.table_path(file_number),
            &self.options,
            self.block_cache.clone(),
            file_number,
        )?;

        let mut state = self.state.lock();
        if let Some(existing) = state.readers.get(&file_number).cloned() {
            return Ok(existing);
        }
        while state.readers.len() >= self.capacity {
            match state.lru_queue.pop_front() {
                Some(victim) => {
                    state.readers.remove(&victim);
                }
                None => break,
            }
        }
        state.readers.insert(file_number, reader.clone());
        state.lru_queue.push_back(file_number);
        Ok(reader)
    }

    /// Drops the cached reader for a deleted file and purges its blocks
    /// from the block cache.
    pub fn evict(&self, file_number: u64) {
        let mut state = self.state.lock();
        state.readers.remove(&file_number);
        if let Some(pos) = state.lru_queue.iter().position(|n| *n == file_number) {
            state.lru_queue.remove(pos);
        }
        drop(state);
        if let Some(cache) = &self.block_cache {
            cache.evict_file(file_number << 8);
        }
    }

    /// Number of readers currently held open.
    pub fn len(&self) -> usize {
        self.state.lock().readers.len()
    }

    /// Whether the cache holds no readers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
