//! Iteration over internal keys and the user-facing database iterator.
//!
//! [`InternalIterator`] is the seam between table readers, memtable
//! snapshots, and the k-way merger: a positional cursor over encoded
//! internal keys. [`DBIterator`] sits on top of the merger and turns the
//! versioned internal-key stream into a snapshot-consistent user view,
//! hiding shadowed versions and tombstoned keys.

use std::sync::Arc;

use crate::comparator::Comparator;
use crate::compaction::merge::MergingIterator;
use crate::compaction::version::Version;
use crate::error::{Error, Result};
use crate::memtable::{lookup_key, InternalKeyComparator, ParsedInternalKey, ValueType};

/// A positional cursor over encoded internal keys.
///
/// `!valid()` may mean exhaustion or an error; callers must check
/// `status()` to tell the two apart.
pub trait InternalIterator {
    /// Position at the first entry.
    fn seek_to_first(&mut self);
    /// Position at the first entry with key >= `target`.
    fn seek(&mut self, target: &[u8]);
    /// Advance to the next entry.
    fn next(&mut self);
    /// Whether the cursor is positioned at an entry.
    fn valid(&self) -> bool;
    /// The current encoded internal key. Requires `valid()`.
    fn key(&self) -> &[u8];
    /// The current value. Requires `valid()`.
    fn value(&self) -> &[u8];
    /// Terminal status, `Ok` unless an error stopped iteration.
    fn status(&self) -> Result<()>;
}

/// An [`InternalIterator`] over an owned, sorted list of entries.
///
/// Memtable snapshots iterate through this; compaction tests also feed
/// hand-built entry lists through it.
pub struct VecIterator {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    comparator: InternalKeyComparator,
    position: usize,
}

impl VecIterator {
    /// Wraps entries that are already sorted by `comparator`.
    pub fn new(entries: Vec<(Vec<u8>, Vec<u8>)>, comparator: InternalKeyComparator) -> Self {
        let position = entries.len();
        Self { entries, comparator, position }
    }
}

impl InternalIterator for VecIterator {
    fn seek_to_first(&mut self) {
        self.position = 0;
    }

    fn seek(&mut self, target: &[u8]) {
        self.position = self.entries.partition_point(|(key, _)| {
            self.comparator.compare(key, target) == std::cmp::Ordering::Less
        });
    }

    fn next(&mut self) {
        if self.position < self.entries.len() {
            self.position += 1;
        }
    }

    fn valid(&self) -> bool {
        self.position < self.entries.len()
    }

    fn key(&self) -> &[u8] {
        &self.entries[self.position].0
    }

    fn value(&self) -> &[u8] {
        &self.entries[self.position].1
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}

/// Snapshot-consistent iterator over user keys.
///
/// Wraps a merged internal-key stream and surfaces at most one version per
/// user key: the newest with sequence at or below the iterator's snapshot.
/// Deletion and single-deletion tombstones hide their key entirely.
pub struct DBIterator {
    inner: MergingIterator,
    user_comparator: Arc<dyn Comparator>,
    sequence: u64,
    key: Vec<u8>,
    value: Vec<u8>,
    current_sequence: u64,
    valid: bool,
    status: Option<Error>,
    /// Keeps the version (and thus its files) alive while iterating.
    _pinned_version: Option<Arc<Version>>,
}

impl DBIterator {
    /// Builds an iterator reading at `sequence` from a merged stream.
    pub fn new(
        inner: MergingIterator,
        user_comparator: Arc<dyn Comparator>,
        sequence: u64,
    ) -> Self {
        Self {
            inner,
            user_comparator,
            sequence,
            key: Vec::new(),
            value: Vec::new(),
            current_sequence: 0,
            valid: false,
            status: None,
            _pinned_version: None,
        }
    }

    /// Pins a version for the iterator's lifetime so lazily opened files
    /// cannot be reclaimed underneath it.
    pub(crate) fn pin_version(&mut self, version: Arc<Version>) {
        self._pinned_version = Some(version);
    }

    /// Positions at the first visible user key.
    pub fn seek_to_first(&mut self) {
        self.status = None;
        self.inner.seek_to_first();
        self.find_next_user_entry(None);
    }

    /// Positions at the first visible user key >= `user_key`.
    pub fn seek(&mut self, user_key: &[u8]) {
        self.status = None;
        self.inner.seek(&lookup_key(user_key, self.sequence));
        self.find_next_user_entry(None);
    }

    /// Advances to the next visible user key.
    pub fn next(&mut self) {
        if !self.valid {
            return;
        }
        let skip = std::mem::take(&mut self.key);
        self.inner.next();
        self.find_next_user_entry(Some(skip));
    }

    /// Skips to the newest visible version of the next unskipped user key.
    fn find_next_user_entry(&mut self, mut skip: Option<Vec<u8>>) {
        self.valid = false;
        while self.inner.valid() {
            let parsed = match ParsedInternalKey::parse(self.inner.key()) {
                Some(p) => p,
                None => {
                    self.status = Some(Error::corruption("malformed internal key in iterator"));
                    return;
                }
            };

            if parsed.sequence > self.sequence {
                self.inner.next();
                continue;
            }
            if let Some(skip_key) = &skip {
                if self.user_comparator.equal(parsed.user_key, skip_key) {
                    self.inner.next();
                    continue;
                }
            }

            match parsed.value_type() {
                Some(ValueType::Value) => {
                    self.key = parsed.user_key.to_vec();
                    self.value = self.inner.value().to_vec();
                    self.current_sequence = parsed.sequence;
                    self.valid = true;
                    return;
                }
                Some(ValueType::Deletion) | Some(ValueType::SingleDeletion) => {
                    // Everything older for this user key is hidden
                    skip = Some(parsed.user_key.to_vec());
                    self.inner.next();
                }
                None => {
                    self.status = Some(Error::corruption("corrupt value type in iterator"));
                    return;
                }
            }
        }
        if self.status.is_none() {
            if let Err(e) = self.inner.status() {
                self.status = Some(e);
            }
        }
    }

    /// Whether the iterator is positioned at an entry. `false` may mean
    /// end-of-range or an error; check [`status`](Self::status).
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// The current user key. Requires `valid()`.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key
    }

    /// The current value. Requires `valid()`.
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.value
    }

    /// The sequence number of the current version. Requires `valid()`.
    pub fn sequence(&self) -> u64 {
        debug_assert!(self.valid);
        self.current_sequence
    }

    /// Terminal status, distinct from `valid()`.
    pub fn status(&self) -> Result<()> {
        self.status.as_ref().map_or(Ok(()), |e| Err(e.duplicate()))
    }
}
