//! Snapshots: pinned-sequence, point-in-time consistent reads.
//!
//! A snapshot pins a sequence number. Reads through it see every write at
//! or below that sequence and nothing newer; compaction consults the
//! active snapshot list so pinned versions survive until released. The
//! handle unregisters itself on `Drop`.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{DbInner, Result};

/// Registry of active snapshot sequences with reference counts.
#[derive(Debug, Default)]
pub(crate) struct SnapshotList {
    inner: Mutex<BTreeMap<u64, usize>>,
}

impl SnapshotList {
    /// Registers a snapshot at `sequence`.
    pub fn acquire(&self, sequence: u64) {
        *self.inner.lock().entry(sequence).or_insert(0) += 1;
    }

    /// Releases one reference to `sequence`.
    pub fn release(&self, sequence: u64) {
        let mut inner = self.inner.lock();
        if let Some(count) = inner.get_mut(&sequence) {
            *count -= 1;
            if *count == 0 {
                inner.remove(&sequence);
            }
        }
    }

    /// Every active snapshot sequence, ascending.
    pub fn all(&self) -> Vec<u64> {
        self.inner.lock().keys().copied().collect()
    }

    /// Whether no snapshots are active.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// A point-in-time view of the database.
///
/// All reads through a snapshot observe the data exactly as it was when
/// the snapshot was taken, regardless of later writes or deletes.
///
/// # Example
///
/// ```rust,no_run
/// use stripekv::{DB, Options};
///
/// # fn main() -> Result<(), stripekv::Error> {
/// let db = DB::open("./data", Options::default())?;
///
/// db.put(b"key1", b"a|b|c")?;
/// let snapshot = db.snapshot();
/// db.put(b"key1", b"x|y|z")?;
///
/// // The snapshot still sees the old value
/// assert_eq!(snapshot.get(b"key1")?, Some(b"a|b|c".to_vec()));
/// assert_eq!(db.get(b"key1")?, Some(b"x|y|z".to_vec()));
/// # Ok(())
/// # }
/// ```
pub struct Snapshot {
    db: Arc<DbInner>,
    sequence: u64,
}

impl Snapshot {
    pub(crate) fn new(db: Arc<DbInner>, sequence: u64) -> Self {
        db.snapshots.acquire(sequence);
        Self { db, sequence }
    }

    /// Reads a key as of this snapshot.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db.get_at(key, self.sequence, None)
    }

    /// The pinned sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.db.snapshots.release(self.sequence);
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot").field("sequence", &self.sequence).finish()
    }
}
