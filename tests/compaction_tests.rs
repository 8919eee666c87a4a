//! Compaction job tests over real column-striped table files.
//!
//! The scenarios drive the full path: input tables are written through the
//! column table builder, opened through the table cache, merged by the
//! compaction job, and the outputs are read back and compared entry by
//! entry.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use stripekv::cache::TableCache;
use stripekv::compaction::{
    Compaction, CompactionInputLevel, CompactionJob, FileMetaData, Version, VersionEdit,
};
use stripekv::memtable::{
    InternalKey, InternalKeyComparator, ParsedInternalKey, ValueType, INTERNAL_KEY_TRAILER_SIZE,
    MAX_SEQUENCE,
};
use stripekv::sstable::ColumnTableBuilder;
use stripekv::{BytewiseComparator, Comparator, Options};
use tempfile::TempDir;

fn icmp() -> InternalKeyComparator {
    InternalKeyComparator::new(Arc::new(BytewiseComparator))
}

fn entry(user: &str, seq: u64, ty: ValueType, value: &str) -> (Vec<u8>, Vec<u8>) {
    (InternalKey::new(user.as_bytes().to_vec(), seq, ty).encode(), value.as_bytes().to_vec())
}

fn corrupt_entry(user: &str, seq: u64, value: &str) -> (Vec<u8>, Vec<u8>) {
    let mut key = InternalKey::new(user.as_bytes().to_vec(), seq, ValueType::Value).encode();
    let pos = key.len() - INTERNAL_KEY_TRAILER_SIZE;
    key[pos] = 0x7f;
    (key, value.as_bytes().to_vec())
}

struct JobHarness {
    _dir: TempDir,
    options: Options,
    table_cache: TableCache,
    version: Version,
    inputs: Vec<CompactionInputLevel>,
    next_file_number: u64,
}

impl JobHarness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let options = Options::default();
        let table_cache = TableCache::new(dir.path(), options.clone(), None);
        Self {
            _dir: dir,
            options,
            table_cache,
            version: Version::new(7),
            inputs: Vec::new(),
            next_file_number: 1,
        }
    }

    /// Writes a table from unsorted entries and registers it at `level`.
    fn add_file(&mut self, level: usize, mut entries: Vec<(Vec<u8>, Vec<u8>)>) {
        let cmp = icmp();
        entries.sort_by(|a, b| cmp.compare(&a.0, &b.0));

        let number = self.next_file_number;
        self.next_file_number += 1;

        let path = self.table_cache.table_path(number);
        let mut builder = ColumnTableBuilder::new(&path, &self.options).unwrap();
        let mut smallest_seqno = u64::MAX;
        let mut largest_seqno = 0;
        for (key, value) in &entries {
            builder.add(key, value).unwrap();
            let parsed = ParsedInternalKey::parse(key).unwrap();
            smallest_seqno = smallest_seqno.min(parsed.sequence);
            largest_seqno = largest_seqno.max(parsed.sequence);
        }
        let file_size = builder.finish().unwrap();

        let meta = FileMetaData {
            number,
            file_size,
            smallest_key: entries.first().unwrap().0.clone(),
            largest_key: entries.last().unwrap().0.clone(),
            smallest_seqno,
            largest_seqno,
            marked_for_compaction: false,
        };

        let mut edit = VersionEdit::new();
        edit.add_file(level, meta.clone());
        self.version = self.version.apply(&edit, &cmp);

        match self.inputs.iter_mut().find(|i| i.level == level) {
            Some(input) => input.files.push(meta),
            None => self.inputs.push(CompactionInputLevel { level, files: vec![meta] }),
        }
    }

    /// Registers a file in the version only (context for bottommost-ness),
    /// without making it a compaction input.
    fn add_context_file(&mut self, level: usize, entries: Vec<(Vec<u8>, Vec<u8>)>) {
        let inputs_before = self.inputs.clone();
        self.add_file(level, entries);
        self.inputs = inputs_before;
    }

    fn run(
        &mut self,
        output_level: usize,
        snapshots: Vec<u64>,
        earliest_write_conflict_snapshot: u64,
        last_sequence: u64,
    ) -> (Vec<FileMetaData>, stripekv::compaction::CompactionStats) {
        let mut inputs = std::mem::take(&mut self.inputs);
        inputs.sort_by_key(|i| i.level);
        let compaction = Compaction::new(inputs, output_level, &self.version, &icmp());

        let shutting_down = AtomicBool::new(false);
        let mut job = CompactionJob::new(
            compaction,
            &self.options,
            &self.table_cache,
            snapshots,
            earliest_write_conflict_snapshot,
            last_sequence,
            &shutting_down,
            true,
        );

        let mut next = self.next_file_number;
        let outputs = job
            .run(&mut || {
                let n = next;
                next += 1;
                n
            })
            .unwrap();
        let stats = job.stats().clone();
        self.next_file_number = next;
        (outputs, stats)
    }

    /// Reads every entry of the given outputs, in order.
    fn read_outputs(&self, outputs: &[FileMetaData]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut result = Vec::new();
        for meta in outputs {
            let reader = self.table_cache.get(meta.number).unwrap();
            let mut iter = reader.iter(None);
            iter.seek_to_first().unwrap();
            while iter.is_valid() {
                result.push((iter.current_key().to_vec(), iter.current_value().to_vec()));
                iter.advance();
            }
            iter.current_status().unwrap();
        }
        result
    }
}

#[test]
fn test_simple_deletion_to_bottommost() {
    let mut h = JobHarness::new();
    h.add_file(
        0,
        vec![
            entry("c", 4, ValueType::Deletion, ""),
            entry("c", 3, ValueType::Value, "v|a|l"),
        ],
    );
    h.add_file(
        0,
        vec![
            entry("b", 2, ValueType::Value, "v|a|l"),
            entry("b", 1, ValueType::Value, "v|a|l"),
        ],
    );

    let (outputs, stats) = h.run(1, vec![], MAX_SEQUENCE, 4);
    assert_eq!(stats.num_input_files, 2);
    assert_eq!(outputs.len(), 1);

    let result = h.read_outputs(&outputs);
    assert_eq!(result, vec![entry("b", 0, ValueType::Value, "v|a|l")]);

    // The expired deletion is accounted for
    assert_eq!(stats.num_input_deletion_records, 1);
    assert_eq!(stats.num_expired_deletion_records, 1);
    assert_eq!(stats.num_records_replaced, 2);
    assert_eq!(stats.num_input_records, 4);
    assert_eq!(stats.num_output_records, 1);
}

#[test]
fn test_simple_overwrite_to_bottommost() {
    let mut h = JobHarness::new();
    h.add_file(
        0,
        vec![
            entry("a", 3, ValueType::Value, "val2|x|y"),
            entry("b", 4, ValueType::Value, "val3|x|y"),
        ],
    );
    h.add_file(
        0,
        vec![
            entry("a", 1, ValueType::Value, "val|x|y"),
            entry("b", 2, ValueType::Value, "val|x|y"),
        ],
    );

    let (outputs, _stats) = h.run(1, vec![], MAX_SEQUENCE, 4);
    let result = h.read_outputs(&outputs);

    // "b" is the compaction's largest user key and keeps its sequence
    assert_eq!(
        result,
        vec![
            entry("a", 0, ValueType::Value, "val2|x|y"),
            entry("b", 4, ValueType::Value, "val3|x|y"),
        ]
    );
}

#[test]
fn test_non_last_level_keeps_sequences() {
    let mut h = JobHarness::new();
    h.add_file(
        0,
        vec![
            entry("a", 5, ValueType::Value, "val2|x|y"),
            entry("b", 6, ValueType::Value, "val3|x|y"),
        ],
    );
    h.add_file(
        1,
        vec![
            entry("a", 3, ValueType::Value, "val|x|y"),
            entry("b", 4, ValueType::Value, "val|x|y"),
        ],
    );
    // A deeper overlapping file makes the output level non-bottommost
    h.add_context_file(
        2,
        vec![
            entry("a", 1, ValueType::Value, "val|x|y"),
            entry("b", 2, ValueType::Value, "val|x|y"),
        ],
    );

    let (outputs, stats) = h.run(1, vec![], MAX_SEQUENCE, 6);
    assert_eq!(stats.num_input_files, 3);
    assert_eq!(stats.num_input_files_at_output_level, 1);

    let result = h.read_outputs(&outputs);
    assert_eq!(
        result,
        vec![
            entry("a", 5, ValueType::Value, "val2|x|y"),
            entry("b", 6, ValueType::Value, "val3|x|y"),
        ]
    );
}

#[test]
fn test_single_deletion_with_write_conflict_snapshots() {
    let mut h = JobHarness::new();
    h.add_file(
        0,
        vec![
            entry("A", 24, ValueType::SingleDeletion, ""),
            entry("A", 23, ValueType::Value, "v|a|l"),
            entry("D", 24, ValueType::SingleDeletion, ""),
            entry("H", 31, ValueType::Value, "v|a|l"),
            entry("H", 24, ValueType::SingleDeletion, ""),
            entry("H", 23, ValueType::Value, "v|a|l"),
        ],
    );
    h.add_file(
        0,
        vec![
            entry("A", 14, ValueType::SingleDeletion, ""),
            entry("A", 13, ValueType::Value, "val2|x|y"),
            entry("C", 14, ValueType::SingleDeletion, ""),
            entry("C", 13, ValueType::Value, "v|a|l"),
        ],
    );

    let (outputs, _stats) = h.run(1, vec![10, 20, 30], 20, 24);
    let result = h.read_outputs(&outputs);

    assert_eq!(
        result,
        vec![
            // A@24/A@23 straddle no snapshot but sit above the conflict
            // watermark with nothing emitted yet: tombstone kept, value
            // cleared. A@14/A@13 collapse (a key was already emitted).
            entry("A", 24, ValueType::SingleDeletion, ""),
            entry("A", 23, ValueType::Value, ""),
            // C@14/C@13 are below the watermark: both collapse
            // D@24 has no paired value in these inputs: kept
            entry("D", 24, ValueType::SingleDeletion, ""),
            // H@31 survives; H@24/H@23 collapse under it
            entry("H", 31, ValueType::Value, "v|a|l"),
        ]
    );
}

#[test]
fn test_corrupt_keys_survive_compaction() {
    let mut h = JobHarness::new();

    for file in 0..2u64 {
        let mut entries = Vec::new();
        for k in 0..1000u64 {
            let key = format!("key{:05}", file * 500 + k);
            let seq = file * 1000 + k + 1;
            if k < 200 {
                entries.push(corrupt_entry(&key, seq, "c|o|r"));
            } else {
                entries.push(entry(&key, seq, ValueType::Value, "v|a|l"));
            }
        }
        h.add_file(0, entries);
    }

    let (outputs, stats) = h.run(1, vec![], MAX_SEQUENCE, 2000);
    assert_eq!(stats.num_corrupt_keys, 400);

    let result = h.read_outputs(&outputs);
    let corrupt_in_output = result
        .iter()
        .filter(|(key, _)| ParsedInternalKey::parse(key).unwrap().value_type().is_none())
        .count();
    assert_eq!(corrupt_in_output, 400);
}

#[test]
fn test_compaction_is_idempotent() {
    let mut h = JobHarness::new();
    h.add_file(
        0,
        vec![
            entry("a", 7, ValueType::Value, "new|x|y"),
            entry("c", 8, ValueType::Deletion, ""),
            entry("e", 9, ValueType::Value, "e|x|y"),
        ],
    );
    h.add_file(
        0,
        vec![
            entry("a", 2, ValueType::Value, "old|x|y"),
            entry("c", 3, ValueType::Value, "c|x|y"),
            entry("d", 4, ValueType::Value, "d|x|y"),
        ],
    );

    let (first_outputs, _) = h.run(1, vec![], MAX_SEQUENCE, 9);
    let first_result = h.read_outputs(&first_outputs);

    // Re-compact the outputs with no new writes
    h.inputs = vec![CompactionInputLevel { level: 1, files: first_outputs.clone() }];
    let (second_outputs, _) = h.run(2, vec![], MAX_SEQUENCE, 9);
    let second_result = h.read_outputs(&second_outputs);

    assert_eq!(first_result, second_result);
}

#[test]
fn test_snapshot_pins_versions_through_compaction() {
    let mut h = JobHarness::new();
    h.add_file(
        0,
        vec![
            entry("k", 9, ValueType::Value, "new|x|y"),
            entry("k", 2, ValueType::Value, "old|x|y"),
        ],
    );

    // A snapshot at 5 sees k@2; both versions must survive
    let (outputs, _) = h.run(1, vec![5], MAX_SEQUENCE, 9);
    let result = h.read_outputs(&outputs);
    assert_eq!(
        result,
        vec![
            entry("k", 9, ValueType::Value, "new|x|y"),
            entry("k", 2, ValueType::Value, "old|x|y"),
        ]
    );
}

#[test]
fn test_shutdown_aborts_and_cleans_up() {
    let mut h = JobHarness::new();
    h.add_file(
        0,
        vec![
            entry("a", 1, ValueType::Value, "a|b|c"),
            entry("b", 2, ValueType::Value, "a|b|c"),
        ],
    );

    let inputs = std::mem::take(&mut h.inputs);
    let compaction = Compaction::new(inputs, 1, &h.version, &icmp());

    let shutting_down = AtomicBool::new(true);
    let mut job = CompactionJob::new(
        compaction,
        &h.options,
        &h.table_cache,
        vec![],
        MAX_SEQUENCE,
        2,
        &shutting_down,
        false,
    );

    let mut next = h.next_file_number;
    let err = job
        .run(&mut || {
            let n = next;
            next += 1;
            n
        })
        .unwrap_err();
    assert!(matches!(err, stripekv::Error::ShutdownInProgress));

    // No partial output remains
    for n in h.next_file_number..next + 1 {
        assert!(!h.table_cache.table_path(n).exists(), "partial output {} left behind", n);
    }
}

#[test]
fn test_install_edit_swaps_inputs_for_outputs() {
    let mut h = JobHarness::new();
    h.add_file(0, vec![entry("a", 1, ValueType::Value, "a|b|c")]);
    h.add_file(0, vec![entry("b", 2, ValueType::Value, "a|b|c")]);

    let input_numbers: Vec<u64> =
        h.inputs.iter().flat_map(|i| i.files.iter().map(|f| f.number)).collect();
    let inputs = std::mem::take(&mut h.inputs);
    let compaction = Compaction::new(inputs, 1, &h.version, &icmp());

    let shutting_down = AtomicBool::new(false);
    let mut job = CompactionJob::new(
        compaction,
        &h.options,
        &h.table_cache,
        vec![],
        MAX_SEQUENCE,
        2,
        &shutting_down,
        false,
    );
    let mut next = h.next_file_number;
    let outputs = job
        .run(&mut || {
            let n = next;
            next += 1;
            n
        })
        .unwrap();

    let edit = job.make_edit(&outputs);
    assert_eq!(edit.deleted_files.len(), input_numbers.len());
    for number in &input_numbers {
        assert!(edit.deleted_files.iter().any(|(level, n)| *level == 0 && n == number));
    }
    assert_eq!(edit.added_files.len(), outputs.len());
    assert!(edit.added_files.iter().all(|(level, _)| *level == 1));

    // Applying the edit yields a version containing only the outputs
    let version = h.version.apply(&edit, &icmp());
    assert!(version.levels[0].is_empty());
    assert_eq!(version.levels[1].len(), outputs.len());
}

#[test]
fn test_output_rolls_at_size_boundary() {
    let mut h = JobHarness::new();
    h.options.max_output_file_size = 4 * 1024;
    h.options.block_size = 512;

    let mut entries = Vec::new();
    for i in 0..2000u64 {
        entries.push(entry(
            &format!("key{:06}", i),
            i + 1,
            ValueType::Value,
            &format!("{:032}|{:032}|{:032}", i, i, i),
        ));
    }
    h.add_file(0, entries);

    let (outputs, stats) = h.run(1, vec![], MAX_SEQUENCE, 2000);
    assert!(outputs.len() > 1, "expected multiple outputs, got {}", outputs.len());
    assert_eq!(stats.num_output_files, outputs.len() as u64);
    assert_eq!(stats.num_output_records, 2000);

    // Outputs are disjoint and ordered
    let cmp = icmp();
    for pair in outputs.windows(2) {
        assert_eq!(
            cmp.compare(&pair[0].largest_key, &pair[1].smallest_key),
            std::cmp::Ordering::Less
        );
    }

    let result = h.read_outputs(&outputs);
    assert_eq!(result.len(), 2000);
}
