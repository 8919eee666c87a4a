//! Index block for table files.
//!
//! The index maps separator keys to data blocks. Separators are produced
//! by the comparator (`find_shortest_separator` between a block's last key
//! and the next block's first key), so index keys can be shorter than any
//! real key while still routing lookups to the right block. Index blocks
//! are written with restart interval 1 to enable pure binary search.

use bytes::Bytes;

use crate::comparator::Comparator;
use crate::error::{Error, Result};
use crate::sstable::block::{Block, BlockBuilder};
use crate::sstable::footer::BlockHandle;

/// A single index entry: a separator key >= every key in its data block
/// and < every key in subsequent blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// The separator key.
    pub key: Vec<u8>,
    /// Handle to the data block.
    pub handle: BlockHandle,
}

/// Builds the sparse index from data-block boundary keys.
pub struct IndexBlockBuilder {
    builder: BlockBuilder,
    num_entries: usize,
}

impl IndexBlockBuilder {
    /// Create a new IndexBlockBuilder.
    pub fn new(index_block_restart_interval: usize) -> Self {
        Self { builder: BlockBuilder::new(index_block_restart_interval), num_entries: 0 }
    }

    /// Add an index entry for a finished data block.
    ///
    /// `last_key_in_block` is the block's final key; `first_key_in_next` is
    /// the first key of the following block, or `None` for the table's last
    /// block. The stored separator is shortened through the comparator.
    pub fn add_entry(
        &mut self,
        last_key_in_block: &[u8],
        first_key_in_next: Option<&[u8]>,
        handle: BlockHandle,
        cmp: &dyn Comparator,
    ) {
        let separator = match first_key_in_next {
            Some(next) => cmp.find_shortest_separator(last_key_in_block, next),
            None => cmp.find_short_successor(last_key_in_block),
        };
        self.builder.add(&separator, &handle.encode());
        self.num_entries += 1;
    }

    /// Finish building and return the index payload.
    pub fn finish(self) -> Bytes {
        self.builder.finish()
    }

    /// Estimated size of the finished index block.
    pub fn estimated_size(&self) -> usize {
        self.builder.current_size()
    }

    /// Number of entries added.
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }
}

/// A decoded index block.
///
/// Entries are materialized at open; index blocks are a small fraction of
/// the table and every iterator needs ordered access to them.
#[derive(Debug)]
pub struct IndexBlock {
    entries: Vec<IndexEntry>,
}

impl IndexBlock {
    /// Decode an index block payload.
    pub fn new(data: Bytes) -> Result<Self> {
        let block = Block::new(data)?;
        let mut entries = Vec::new();
        let mut iter = block.iter();
        iter.seek_to_first();
        while iter.valid() {
            let (handle, _) = BlockHandle::decode(iter.value())
                .map_err(|_| Error::corruption("bad block handle in index"))?;
            entries.push(IndexEntry { key: iter.key().to_vec(), handle });
            iter.advance();
        }
        Ok(Self { entries })
    }

    /// Index of the first block whose separator is >= `key`, i.e. the only
    /// block that can contain `key`. `None` if `key` is past the last block.
    pub fn find_block_index(&self, key: &[u8], cmp: &dyn Comparator) -> Option<usize> {
        let idx = self
            .entries
            .partition_point(|e| cmp.compare(&e.key, key) == std::cmp::Ordering::Less);
        (idx < self.entries.len()).then_some(idx)
    }

    /// Handle of the block that may contain `key`.
    pub fn find_block(&self, key: &[u8], cmp: &dyn Comparator) -> Option<BlockHandle> {
        self.find_block_index(key, cmp).map(|i| self.entries[i].handle)
    }

    /// All index entries in order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Number of data blocks indexed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
