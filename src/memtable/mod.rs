//! # MemTable - In-Memory Sorted Table
//!
//! The memtable absorbs recent writes before they are flushed into a
//! column-striped table. It is a concurrent skiplist keyed by internal
//! keys, so multiple versions of a user key coexist and MVCC reads pick
//! the newest version at or below their snapshot sequence.
//!
//! ## Thread Safety
//!
//! Multiple concurrent readers and writers are supported
//! (crossbeam-skiplist provides this guarantee); size accounting is a
//! relaxed atomic.

mod internal_key;

pub use internal_key::{
    append_internal_key, extract_user_key, lookup_key, pack_sequence_and_type, InternalKey,
    InternalKeyComparator, ParsedInternalKey, ValueType, INTERNAL_KEY_TRAILER_SIZE, MAX_SEQUENCE,
    VALUE_TYPE_FOR_SEEK,
};

use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Outcome of a memtable (or table) point lookup.
///
/// `Deleted` is distinct from `NotFound`: a tombstone in a newer layer masks
/// any older value, so the search must stop rather than fall through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// The key exists with this value.
    Found(Vec<u8>),
    /// The key is masked by a tombstone.
    Deleted,
    /// This layer knows nothing about the key.
    NotFound,
}

/// In-memory sorted table over internal keys.
///
/// Keys are ordered by the default bytewise user comparator; see DESIGN.md
/// for the custom-comparator boundary.
pub struct MemTable {
    data: SkipMap<InternalKey, Vec<u8>>,
    size: AtomicUsize,
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTable {
    /// Creates a new empty MemTable.
    pub fn new() -> Self {
        Self { data: SkipMap::new(), size: AtomicUsize::new(0) }
    }

    /// Inserts a key-value pair with the given sequence number.
    pub fn put(&self, key: &[u8], value: &[u8], sequence: u64) {
        self.insert(key, value, sequence, ValueType::Value);
    }

    /// Inserts a deletion tombstone.
    pub fn delete(&self, key: &[u8], sequence: u64) {
        self.insert(key, &[], sequence, ValueType::Deletion);
    }

    /// Inserts a single-deletion tombstone.
    pub fn single_delete(&self, key: &[u8], sequence: u64) {
        self.insert(key, &[], sequence, ValueType::SingleDeletion);
    }

    fn insert(&self, key: &[u8], value: &[u8], sequence: u64, value_type: ValueType) {
        let internal_key = InternalKey::new(key.to_vec(), sequence, value_type);
        let entry_size = internal_key.encoded_size() + value.len() + 16;
        self.data.insert(internal_key, value.to_vec());
        self.size.fetch_add(entry_size, Ordering::Relaxed);
    }

    /// Looks up the newest version of `key` with sequence <= `max_sequence`.
    pub fn get(&self, key: &[u8], max_sequence: u64) -> LookupResult {
        // Everything for this user key sorts at or after (key, MAX, seek-type)
        let lower = InternalKey::new(key.to_vec(), MAX_SEQUENCE, VALUE_TYPE_FOR_SEEK);

        for entry in self.data.range(lower..) {
            let internal_key = entry.key();
            if internal_key.user_key() != key {
                break;
            }
            if internal_key.sequence() > max_sequence {
                continue;
            }
            return match internal_key.value_type() {
                ValueType::Value => LookupResult::Found(entry.value().clone()),
                ValueType::Deletion | ValueType::SingleDeletion => LookupResult::Deleted,
            };
        }

        LookupResult::NotFound
    }

    /// Approximate memory footprint in bytes.
    pub fn approximate_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Number of entries (all versions).
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Materializes the contents in internal-key order as encoded pairs.
    ///
    /// Used by flush and by merged iteration; the memtable is bounded by the
    /// flush threshold so the copy stays small.
    pub fn snapshot_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.data
            .iter()
            .map(|entry| (entry.key().encode(), entry.value().clone()))
            .collect()
    }
}
