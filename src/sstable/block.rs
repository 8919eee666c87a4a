//! Block format for table files.
//!
//! A block contains sorted key-value entries with restart points for
//! prefix compression and binary search.
//!
//! Format:
//! ```text
//! [Entry 1]
//! ...
//! [Entry N]
//! [Restart Point 1: u32]
//! ...
//! [Restart Point M: u32]
//! [Num Restarts: u32]
//! ```
//!
//! Each entry:
//! ```text
//! [shared_key_len: u32]     // Length of shared prefix with previous key
//! [unshared_key_len: u32]   // Length of unshared key suffix
//! [value_len: u32]          // Length of value
//! [unshared_key: bytes]
//! [value: bytes]
//! ```

use std::cmp::Ordering;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::comparator::Comparator;
use crate::error::{Error, Result};

const ENTRY_HEADER_SIZE: usize = 12;

/// Builds a block with prefix compression.
///
/// The caller is responsible for feeding keys in increasing order of the
/// comparator that will later be used to search the block.
pub struct BlockBuilder {
    buffer: BytesMut,
    restarts: Vec<u32>,
    counter: usize,
    last_key: Vec<u8>,
    block_restart_interval: usize,
}

impl BlockBuilder {
    /// Create a new BlockBuilder with the given restart interval.
    pub fn new(block_restart_interval: usize) -> Self {
        assert!(block_restart_interval >= 1);
        Self {
            buffer: BytesMut::new(),
            restarts: vec![0],
            counter: 0,
            last_key: Vec::new(),
            block_restart_interval,
        }
    }

    /// Add a key-value pair to the block.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        assert!(!key.is_empty(), "Key cannot be empty");

        let mut shared = 0;

        if self.counter >= self.block_restart_interval {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
        } else if !self.last_key.is_empty() {
            shared = shared_prefix_len(&self.last_key, key);
        }

        let unshared = key.len() - shared;

        self.buffer.put_u32_le(shared as u32);
        self.buffer.put_u32_le(unshared as u32);
        self.buffer.put_u32_le(value.len() as u32);
        self.buffer.put_slice(&key[shared..]);
        self.buffer.put_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Finish building and return the block payload.
    pub fn finish(mut self) -> Bytes {
        for restart in &self.restarts {
            self.buffer.put_u32_le(*restart);
        }
        self.buffer.put_u32_le(self.restarts.len() as u32);
        self.buffer.freeze()
    }

    /// The last key added so far.
    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// Estimated size of the finished block.
    pub fn current_size(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    /// Estimated size after adding one more entry (used by the flush policy).
    pub fn size_after(&self, key: &[u8], value: &[u8]) -> usize {
        self.current_size() + ENTRY_HEADER_SIZE + key.len() + value.len()
    }

    /// Check if the block is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    let min_len = a.len().min(b.len());
    for i in 0..min_len {
        if a[i] != b[i] {
            return i;
        }
    }
    min_len
}

/// A decoded, immutable block.
#[derive(Debug, Clone)]
pub struct Block {
    data: Bytes,
    restart_offset: usize,
    num_restarts: u32,
}

impl Block {
    /// Create a Block from a raw (decompressed) payload.
    pub fn new(data: Bytes) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::corruption("block too small"));
        }

        let num_restarts = u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap());
        let restart_array_size = num_restarts as usize * 4 + 4;
        if restart_array_size > data.len() {
            return Err(Error::corruption("block restart array overflows payload"));
        }
        let restart_offset = data.len() - restart_array_size;

        Ok(Self { data, restart_offset, num_restarts })
    }

    /// Number of restart points.
    pub fn num_restarts(&self) -> u32 {
        self.num_restarts
    }

    fn restart_point(&self, index: u32) -> usize {
        let offset = self.restart_offset + (index as usize * 4);
        u32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap()) as usize
    }

    /// Create an iterator over the block.
    pub fn iter(&self) -> BlockIterator {
        BlockIterator::new(self.clone())
    }

    /// Raw payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Iterator over entries in a block.
pub struct BlockIterator {
    block: Block,
    current: usize,
    key: Vec<u8>,
    value: Vec<u8>,
    valid: bool,
}

impl BlockIterator {
    fn new(block: Block) -> Self {
        Self { block, current: 0, key: Vec::new(), value: Vec::new(), valid: false }
    }

    /// Position at the first entry; the iterator is valid afterwards unless
    /// the block is empty.
    pub fn seek_to_first(&mut self) {
        if self.block.num_restarts == 0 {
            self.valid = false;
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_entry();
    }

    fn seek_to_restart_point(&mut self, index: u32) {
        self.key.clear();
        self.current = self.block.restart_point(index);
        self.valid = false;
    }

    /// Position at the first entry with key >= `target` under `cmp`.
    /// The iterator is invalid if every entry is smaller.
    pub fn seek(&mut self, target: &[u8], cmp: &dyn Comparator) {
        if self.block.num_restarts == 0 {
            self.valid = false;
            return;
        }

        // Binary search over restart points: find the last restart whose
        // first key is < target. Restart entries store the full key.
        let mut left = 0u32;
        let mut right = self.block.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let offset = self.block.restart_point(mid);
            match self.full_key_at(offset) {
                Some(key) if cmp.compare(&key, target) == Ordering::Less => left = mid,
                Some(_) => right = mid - 1,
                None => {
                    self.valid = false;
                    return;
                }
            }
        }

        // Linear scan within the restart segment
        self.seek_to_restart_point(left);
        loop {
            self.parse_next_entry();
            if !self.valid {
                return;
            }
            if cmp.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    /// Decode the full key of the entry starting at `offset` (restart
    /// entries only: shared length must be zero).
    fn full_key_at(&self, offset: usize) -> Option<Vec<u8>> {
        let data = &self.block.data[..self.block.restart_offset];
        if offset + ENTRY_HEADER_SIZE > data.len() {
            return None;
        }
        let mut cursor = &data[offset..];
        let shared = cursor.get_u32_le() as usize;
        let unshared = cursor.get_u32_le() as usize;
        let _value_len = cursor.get_u32_le() as usize;
        if shared != 0 || cursor.len() < unshared {
            return None;
        }
        Some(cursor[..unshared].to_vec())
    }

    /// Move to the next entry. Returns whether the iterator is still valid.
    pub fn advance(&mut self) -> bool {
        if self.current >= self.block.restart_offset && !self.valid {
            return false;
        }
        self.parse_next_entry();
        self.valid
    }

    fn parse_next_entry(&mut self) {
        if self.current >= self.block.restart_offset {
            self.valid = false;
            return;
        }

        let data = &self.block.data[self.current..self.block.restart_offset];
        if data.len() < ENTRY_HEADER_SIZE {
            self.valid = false;
            return;
        }

        let mut cursor = data;
        let shared = cursor.get_u32_le() as usize;
        let unshared = cursor.get_u32_le() as usize;
        let value_len = cursor.get_u32_le() as usize;

        if shared > self.key.len() || cursor.len() < unshared + value_len {
            self.valid = false;
            return;
        }

        self.key.truncate(shared);
        self.key.extend_from_slice(&cursor[..unshared]);
        self.value.clear();
        self.value.extend_from_slice(&cursor[unshared..unshared + value_len]);

        self.current += ENTRY_HEADER_SIZE + unshared + value_len;
        self.valid = true;
    }

    /// Check if the iterator is positioned at an entry.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// The current key.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid, "iterator not valid");
        &self.key
    }

    /// The current value.
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid, "iterator not valid");
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;

    fn build(entries: &[(&[u8], &[u8])], restart_interval: usize) -> Block {
        let mut builder = BlockBuilder::new(restart_interval);
        for (k, v) in entries {
            builder.add(k, v);
        }
        Block::new(builder.finish()).unwrap()
    }

    #[test]
    fn test_block_builder_empty() {
        let builder = BlockBuilder::new(16);
        assert!(builder.is_empty());
    }

    #[test]
    fn test_block_iteration() {
        let block = build(
            &[(b"apple", b"red"), (b"banana", b"yellow"), (b"cherry", b"red")],
            16,
        );

        let mut iter = block.iter();
        iter.seek_to_first();

        assert!(iter.valid());
        assert_eq!(iter.key(), b"apple");
        assert_eq!(iter.value(), b"red");

        assert!(iter.advance());
        assert_eq!(iter.key(), b"banana");

        assert!(iter.advance());
        assert_eq!(iter.key(), b"cherry");

        assert!(!iter.advance());
        assert!(!iter.valid());
    }

    #[test]
    fn test_block_seek() {
        let cmp = BytewiseComparator;
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..100)
            .map(|i| (format!("key{:04}", i * 2).into_bytes(), format!("v{}", i).into_bytes()))
            .collect();
        let refs: Vec<(&[u8], &[u8])> =
            entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice())).collect();
        let block = build(&refs, 4);

        let mut iter = block.iter();

        // Exact hit
        iter.seek(b"key0010", &cmp);
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key0010");

        // Between entries: lands on the next larger key
        iter.seek(b"key0011", &cmp);
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key0012");

        // Before the first entry
        iter.seek(b"aaa", &cmp);
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key0000");

        // Past the last entry
        iter.seek(b"zzz", &cmp);
        assert!(!iter.valid());
    }

    #[test]
    fn test_seek_then_advance() {
        let cmp = BytewiseComparator;
        let block = build(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")], 2);

        let mut iter = block.iter();
        iter.seek(b"b", &cmp);
        assert_eq!(iter.key(), b"b");
        assert!(iter.advance());
        assert_eq!(iter.key(), b"c");
        assert!(!iter.advance());
    }

    #[test]
    fn test_prefix_compression_restores_keys() {
        let block = build(
            &[
                (b"prefix_aaaa", b"1"),
                (b"prefix_aabb", b"2"),
                (b"prefix_abcd", b"3"),
                (b"prefix_b", b"4"),
            ],
            16,
        );

        let mut iter = block.iter();
        iter.seek_to_first();
        let mut keys = Vec::new();
        while iter.valid() {
            keys.push(iter.key().to_vec());
            iter.advance();
        }
        assert_eq!(
            keys,
            vec![
                b"prefix_aaaa".to_vec(),
                b"prefix_aabb".to_vec(),
                b"prefix_abcd".to_vec(),
                b"prefix_b".to_vec()
            ]
        );
    }

    #[test]
    fn test_restart_interval_one() {
        // Index blocks use interval 1: every entry is a restart point
        let block = build(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")], 1);
        assert_eq!(block.num_restarts(), 3);

        let cmp = BytewiseComparator;
        let mut iter = block.iter();
        iter.seek(b"b", &cmp);
        assert_eq!(iter.key(), b"b");
        assert_eq!(iter.value(), b"2");
    }

    #[test]
    fn test_corrupt_block_rejected() {
        assert!(Block::new(Bytes::from_static(&[1, 2])).is_err());

        // num_restarts larger than the payload can hold
        let bogus = 1000u32.to_le_bytes().to_vec();
        assert!(Block::new(Bytes::from(bogus)).is_err());
    }
}
