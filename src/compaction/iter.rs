//! Compaction iterator: visibility bucketing and tombstone resolution.
//!
//! Consumes a merged internal-key stream (user keys ascending, versions
//! newest first) and decides, version by version, what survives into the
//! compaction output:
//!
//! - Two adjacent sequence numbers belong to the same *snapshot bucket*
//!   iff no live snapshot lies strictly between them. At most one version
//!   per user key survives per bucket; versions hidden by a newer one in
//!   the same bucket are dropped.
//! - A `Deletion` hides older versions bucket by bucket, and is itself
//!   dropped at the bottommost level once no snapshot can still see
//!   anything older.
//! - A `SingleDeletion` cancels exactly one `Value` with smaller sequence
//!   in the same bucket, but only when the pair is not needed for
//!   write-conflict checking (`sequence < earliest_write_conflict_snapshot`
//!   or another version of the key was already emitted). When an earlier
//!   write-conflict snapshot forces the pair to survive, the tombstone is
//!   emitted and the paired value follows with its payload cleared.
//! - Keys whose trailer fails to parse are counted and written through
//!   unchanged (unless `paranoid` is set), resetting per-key state.
//! - On the bottommost level, surviving keys older than every snapshot are
//!   rewritten with sequence zero, except the compaction's largest user
//!   key.

use std::sync::Arc;

use crate::comparator::Comparator;
use crate::error::{Error, Result};
use crate::iterator::InternalIterator;
use crate::memtable::{ParsedInternalKey, ValueType, MAX_SEQUENCE};

/// Counters accumulated while the iterator runs.
#[derive(Debug, Default, Clone)]
pub struct CompactionIterStats {
    /// Records read from the merged input.
    pub num_input_records: u64,
    /// Input records that were tombstones (either kind).
    pub num_input_deletion_records: u64,
    /// Records with an unparseable trailer, written through.
    pub num_corrupt_keys: u64,
    /// Records dropped because a newer version in the same bucket hides them.
    pub num_record_drop_hidden: u64,
    /// Records dropped as obsolete (cancelled pairs, expired tombstones).
    pub num_record_drop_obsolete: u64,
    /// Tombstones dropped because no snapshot could still observe them.
    pub num_expired_deletion_records: u64,
}

/// Streaming filter between the merging iterator and the table writer.
pub struct CompactionIter {
    input: Box<dyn InternalIterator>,
    user_comparator: Arc<dyn Comparator>,
    snapshots: Vec<u64>,
    earliest_write_conflict_snapshot: u64,
    earliest_snapshot: u64,
    /// Nonzero when no snapshots exist: every version is visible at the tip.
    visible_at_tip: u64,
    bottommost_level: bool,
    largest_user_key: Option<Vec<u8>>,
    paranoid: bool,

    valid: bool,
    key: Vec<u8>,
    value: Vec<u8>,
    /// Input already advanced past the entry being surfaced.
    at_next: bool,
    has_current_user_key: bool,
    current_user_key: Vec<u8>,
    current_user_key_snapshot: u64,
    has_outputted_key: bool,
    clear_and_output_next_key: bool,
    status: Option<Error>,
    stats: CompactionIterStats,
}

impl CompactionIter {
    /// Creates the iterator.
    ///
    /// `snapshots` must be ascending. `last_sequence` is the version
    /// manager's counter at job start; it stands in for the missing
    /// snapshot when `snapshots` is empty. `largest_user_key` is the
    /// compaction's upper key boundary, exempted from sequence zeroing.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input: Box<dyn InternalIterator>,
        user_comparator: Arc<dyn Comparator>,
        snapshots: Vec<u64>,
        earliest_write_conflict_snapshot: u64,
        last_sequence: u64,
        bottommost_level: bool,
        largest_user_key: Option<Vec<u8>>,
        paranoid: bool,
    ) -> Self {
        debug_assert!(snapshots.windows(2).all(|w| w[0] <= w[1]));
        let (visible_at_tip, earliest_snapshot) = if snapshots.is_empty() {
            let tip = last_sequence.max(1);
            (tip, tip)
        } else {
            (0, snapshots[0])
        };
        Self {
            input,
            user_comparator,
            snapshots,
            earliest_write_conflict_snapshot,
            earliest_snapshot,
            visible_at_tip,
            bottommost_level,
            largest_user_key,
            paranoid,
            valid: false,
            key: Vec::new(),
            value: Vec::new(),
            at_next: false,
            has_current_user_key: false,
            current_user_key: Vec::new(),
            current_user_key_snapshot: 0,
            has_outputted_key: false,
            clear_and_output_next_key: false,
            status: None,
            stats: CompactionIterStats::default(),
        }
    }

    /// Positions at the first surviving record.
    pub fn seek_to_first(&mut self) {
        self.input.seek_to_first();
        self.next_from_input();
    }

    /// Advances to the next surviving record.
    pub fn next(&mut self) {
        if self.at_next {
            self.at_next = false;
        } else {
            self.input.next();
        }
        self.next_from_input();
    }

    /// Whether a record is available.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// The surviving encoded internal key (possibly sequence-rewritten).
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The surviving value (possibly cleared).
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Terminal status.
    pub fn status(&self) -> Result<()> {
        if let Some(e) = &self.status {
            return Err(e.duplicate());
        }
        self.input.status()
    }

    /// The counters accumulated so far.
    pub fn stats(&self) -> &CompactionIterStats {
        &self.stats
    }

    /// The earliest visible snapshot for `sequence` (the supremum of its
    /// bucket) and, through `prev`, the greatest snapshot strictly below.
    fn find_earliest_visible_snapshot(&self, sequence: u64, prev: &mut u64) -> u64 {
        *prev = 0;
        for &snapshot in &self.snapshots {
            if snapshot >= sequence {
                return snapshot;
            }
            *prev = snapshot;
        }
        MAX_SEQUENCE
    }

    fn next_from_input(&mut self) {
        self.valid = false;

        while !self.valid && self.input.valid() {
            self.key.clear();
            self.key.extend_from_slice(self.input.key());
            self.value.clear();
            self.value.extend_from_slice(self.input.value());
            self.stats.num_input_records += 1;

            let parsed = ParsedInternalKey::parse(&self.key);
            let well_formed = parsed.map_or(false, |p| p.value_type().is_some());
            if !well_formed {
                if self.paranoid {
                    self.status = Some(Error::corruption("corrupt internal key in compaction"));
                    return;
                }
                // Write the corrupt key through and forget the current user
                // key so it cannot hide anything.
                self.stats.num_corrupt_keys += 1;
                self.has_current_user_key = false;
                self.current_user_key_snapshot = 0;
                self.valid = true;
                break;
            }
            let parsed = parsed.expect("well-formed key parses");
            let ikey_user = parsed.user_key.to_vec();
            let ikey_sequence = parsed.sequence;
            let ikey_type = parsed.value_type().expect("well-formed key has a type");

            if ikey_type != ValueType::Value {
                self.stats.num_input_deletion_records += 1;
            }

            if !self.has_current_user_key
                || !self.user_comparator.equal(&ikey_user, &self.current_user_key)
            {
                self.has_current_user_key = true;
                self.current_user_key = ikey_user.clone();
                self.current_user_key_snapshot = 0;
                self.has_outputted_key = false;
            }

            let last_snapshot = self.current_user_key_snapshot;
            let mut prev_snapshot = 0;
            self.current_user_key_snapshot = if self.visible_at_tip != 0 {
                self.visible_at_tip
            } else {
                self.find_earliest_visible_snapshot(ikey_sequence, &mut prev_snapshot)
            };

            if self.clear_and_output_next_key {
                // The single deletion above this value had to be kept for
                // write-conflict checking; the value survives as a marker
                // with its payload dropped.
                self.value.clear();
                self.valid = true;
                self.clear_and_output_next_key = false;
            } else if ikey_type == ValueType::SingleDeletion {
                self.single_delete_from_input(&ikey_user, ikey_sequence, prev_snapshot);
            } else if last_snapshot != 0 && last_snapshot == self.current_user_key_snapshot {
                // Hidden by a newer entry in the same snapshot bucket
                self.stats.num_record_drop_hidden += 1;
                self.input.next();
            } else if ikey_type == ValueType::Deletion
                && ikey_sequence <= self.earliest_snapshot
                && self.bottommost_level
            {
                // No snapshot references anything older and nothing can
                // exist below the output level: drop the tombstone itself
                self.stats.num_record_drop_obsolete += 1;
                self.stats.num_expired_deletion_records += 1;
                self.input.next();
            } else {
                self.valid = true;
            }
        }

        if self.valid {
            self.has_outputted_key = true;
            self.prepare_output();
        }
    }

    /// Resolves a single deletion against the next input entry.
    fn single_delete_from_input(&mut self, user_key: &[u8], sequence: u64, prev_snapshot: u64) {
        self.input.next();

        let next_same_key = self.input.valid().then(|| {
            ParsedInternalKey::parse(self.input.key()).and_then(|p| {
                let ty = p.value_type()?;
                self.user_comparator
                    .equal(p.user_key, user_key)
                    .then_some((p.sequence, ty))
            })
        });

        match next_same_key.flatten() {
            Some((next_sequence, next_type)) if next_sequence > prev_snapshot => {
                // The next version lives in the same snapshot bucket
                if next_type == ValueType::SingleDeletion {
                    // Two single deletes in a row: drop the first and let the
                    // next iteration deal with the second
                    self.stats.num_record_drop_obsolete += 1;
                } else if self.has_outputted_key
                    || sequence < self.earliest_write_conflict_snapshot
                {
                    // The pair cancels: drop both records
                    self.stats.num_record_drop_hidden += 1;
                    self.stats.num_record_drop_obsolete += 1;
                    self.input.next();
                } else {
                    // An earlier write-conflict snapshot still needs evidence
                    // of this write: keep the tombstone, clear the value on
                    // the next iteration
                    self.valid = true;
                    self.clear_and_output_next_key = true;
                    self.at_next = true;
                }
            }
            Some(_) => {
                // Next version is in an older bucket: the tombstone survives
                self.valid = true;
                self.at_next = true;
            }
            None => {
                // End of input, a different user key, or a corrupt follower.
                // The paired value may live in a file outside this
                // compaction, so the tombstone only expires at the
                // bottommost level with no snapshot watching.
                if sequence <= self.earliest_snapshot && self.bottommost_level {
                    self.stats.num_record_drop_obsolete += 1;
                    self.stats.num_expired_deletion_records += 1;
                } else {
                    self.valid = true;
                    self.at_next = true;
                }
            }
        }
    }

    /// Bottommost sequence zeroing for tighter encoding.
    fn prepare_output(&mut self) {
        if !self.bottommost_level {
            return;
        }
        let parsed = match ParsedInternalKey::parse(&self.key) {
            Some(p) => p,
            None => return,
        };
        if parsed.sequence >= self.earliest_snapshot {
            return;
        }
        // Deletions never zero (they are dropped instead once expired), and
        // the compaction's largest user key keeps its sequence so a later
        // compaction ending at the same boundary stays idempotent.
        if parsed.value_type() == Some(ValueType::Deletion) {
            return;
        }
        if let Some(largest) = &self.largest_user_key {
            if self.user_comparator.equal(parsed.user_key, largest) {
                return;
            }
        }
        self.key = parsed.rewrite_sequence(0);
    }
}
