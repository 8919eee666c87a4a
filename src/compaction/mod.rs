//! Compaction: merging overlapping table files down the level hierarchy.
//!
//! A [`CompactionJob`] drives a k-way merge over the selected input files,
//! filters the stream through the visibility and tombstone rules of
//! [`CompactionIter`], and emits new column-striped tables at the output
//! level, rolling to a fresh output file at key boundaries once the size
//! target is exceeded. On success it produces a [`VersionEdit`] removing
//! the inputs and adding the outputs; on any failure the partial outputs
//! are deleted and the version is left untouched.

pub mod iter;
pub mod merge;
pub mod picker;
pub mod version;

pub use iter::{CompactionIter, CompactionIterStats};
pub use merge::MergingIterator;
pub use picker::CompactionPicker;
pub use version::{FileMetaData, Version, VersionEdit, VersionSet};

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Instant;

use crate::cache::TableCache;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::iterator::InternalIterator;
use crate::memtable::{InternalKeyComparator, ParsedInternalKey};
use crate::sstable::{sub_file_path, ColumnTableBuilder};

/// Input files from one level.
#[derive(Debug, Clone)]
pub struct CompactionInputLevel {
    /// The level these files live on.
    pub level: usize,
    /// The files, in the version's level order.
    pub files: Vec<FileMetaData>,
}

/// A selected compaction: input levels, output level, and derived bounds.
#[derive(Debug, Clone)]
pub struct Compaction {
    /// Input levels, upper level first.
    pub inputs: Vec<CompactionInputLevel>,
    /// The level receiving the outputs.
    pub output_level: usize,
    /// True when no live file below the output level overlaps the key
    /// range; enables tombstone dropping and sequence zeroing.
    pub bottommost: bool,
    smallest_user_key: Vec<u8>,
    largest_user_key: Vec<u8>,
}

impl Compaction {
    /// Derives key bounds and bottommost-ness from the inputs and the
    /// version they were picked from.
    pub fn new(
        inputs: Vec<CompactionInputLevel>,
        output_level: usize,
        current: &Version,
        icmp: &InternalKeyComparator,
    ) -> Self {
        let ucmp = icmp.user_comparator().clone();
        let mut smallest: Option<Vec<u8>> = None;
        let mut largest: Option<Vec<u8>> = None;
        for input in &inputs {
            for file in &input.files {
                let file_smallest = file.smallest_user_key();
                let file_largest = file.largest_user_key();
                if smallest
                    .as_deref()
                    .map_or(true, |s| ucmp.compare(file_smallest, s) == std::cmp::Ordering::Less)
                {
                    smallest = Some(file_smallest.to_vec());
                }
                if largest
                    .as_deref()
                    .map_or(true, |l| ucmp.compare(file_largest, l) == std::cmp::Ordering::Greater)
                {
                    largest = Some(file_largest.to_vec());
                }
            }
        }
        let smallest_user_key = smallest.unwrap_or_default();
        let largest_user_key = largest.unwrap_or_default();

        let mut bottommost = true;
        for level in (output_level + 1)..current.levels.len() {
            if !current
                .overlapping_files(level, &smallest_user_key, &largest_user_key, icmp)
                .is_empty()
            {
                bottommost = false;
                break;
            }
        }

        Self { inputs, output_level, bottommost, smallest_user_key, largest_user_key }
    }

    /// Total number of input files.
    pub fn num_input_files(&self) -> usize {
        self.inputs.iter().map(|i| i.files.len()).sum()
    }

    /// Number of input files already at the output level.
    pub fn num_input_files_at_output_level(&self) -> usize {
        self.inputs
            .iter()
            .filter(|i| i.level == self.output_level)
            .map(|i| i.files.len())
            .sum()
    }

    /// Total input bytes.
    pub fn total_input_bytes(&self) -> u64 {
        self.inputs.iter().flat_map(|i| i.files.iter()).map(|f| f.file_size).sum()
    }

    /// The largest user key across all inputs.
    pub fn largest_user_key(&self) -> &[u8] {
        &self.largest_user_key
    }

    /// The smallest user key across all inputs.
    pub fn smallest_user_key(&self) -> &[u8] {
        &self.smallest_user_key
    }
}

/// Counters reported by a finished compaction.
#[derive(Debug, Clone, Default)]
pub struct CompactionStats {
    /// Wall-clock duration of the job in microseconds.
    pub elapsed_micros: u64,
    /// Input file count.
    pub num_input_files: u64,
    /// Input files already at the output level.
    pub num_input_files_at_output_level: u64,
    /// Records read from the inputs.
    pub num_input_records: u64,
    /// Records written to the outputs.
    pub num_output_records: u64,
    /// Output files produced.
    pub num_output_files: u64,
    /// Input bytes (file sizes).
    pub total_input_bytes: u64,
    /// Output bytes (file sizes).
    pub total_output_bytes: u64,
    /// Uncompressed input key bytes.
    pub total_input_raw_key_bytes: u64,
    /// Uncompressed input value bytes.
    pub total_input_raw_value_bytes: u64,
    /// Records dropped because a newer version replaced them.
    pub num_records_replaced: u64,
    /// Tombstone records consumed.
    pub num_input_deletion_records: u64,
    /// Tombstones dropped as expired.
    pub num_expired_deletion_records: u64,
    /// Corrupt keys encountered (written through).
    pub num_corrupt_keys: u64,
    /// First bytes of the smallest output key, for debugging.
    pub smallest_output_key_prefix: Vec<u8>,
    /// First bytes of the largest output key, for debugging.
    pub largest_output_key_prefix: Vec<u8>,
    /// Whether the job was requested manually.
    pub is_manual_compaction: bool,
}

const OUTPUT_KEY_PREFIX_LEN: usize = 8;

struct OutputState {
    builder: ColumnTableBuilder,
    number: u64,
    smallest_key: Vec<u8>,
    largest_key: Vec<u8>,
    smallest_seqno: u64,
    largest_seqno: u64,
}

/// Executes one compaction.
pub struct CompactionJob<'a> {
    compaction: Compaction,
    options: &'a Options,
    table_cache: &'a TableCache,
    snapshots: Vec<u64>,
    earliest_write_conflict_snapshot: u64,
    last_sequence: u64,
    shutting_down: &'a AtomicBool,
    stats: CompactionStats,
}

impl<'a> CompactionJob<'a> {
    /// Creates a job over a picked compaction.
    ///
    /// `snapshots` is the active snapshot list (ascending);
    /// `earliest_write_conflict_snapshot` is the watermark below which
    /// single-deletion pairs must be preserved for conflict checking.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        compaction: Compaction,
        options: &'a Options,
        table_cache: &'a TableCache,
        snapshots: Vec<u64>,
        earliest_write_conflict_snapshot: u64,
        last_sequence: u64,
        shutting_down: &'a AtomicBool,
        is_manual: bool,
    ) -> Self {
        let stats = CompactionStats { is_manual_compaction: is_manual, ..Default::default() };
        Self {
            compaction,
            options,
            table_cache,
            snapshots,
            earliest_write_conflict_snapshot,
            last_sequence,
            shutting_down,
            stats,
        }
    }

    /// Runs the merge and writes the output tables.
    ///
    /// `alloc_file_number` hands out output file numbers (reserved by the
    /// version manager). Returns the produced file metadata; on error all
    /// partial outputs are removed from disk.
    pub fn run(
        &mut self,
        alloc_file_number: &mut dyn FnMut() -> u64,
    ) -> Result<Vec<FileMetaData>> {
        let start = Instant::now();
        log::info!(
            "compaction started: {} input files -> level {}{}",
            self.compaction.num_input_files(),
            self.compaction.output_level,
            if self.compaction.bottommost { " (bottommost)" } else { "" }
        );

        self.stats.num_input_files = self.compaction.num_input_files() as u64;
        self.stats.num_input_files_at_output_level =
            self.compaction.num_input_files_at_output_level() as u64;
        self.stats.total_input_bytes = self.compaction.total_input_bytes();

        let result = self.run_merge(alloc_file_number, start);
        match &result {
            Ok(outputs) => {
                self.stats.elapsed_micros = start.elapsed().as_micros() as u64;
                log::info!(
                    "compaction finished: {} records in, {} records out, {} output files, {} bytes",
                    self.stats.num_input_records,
                    self.stats.num_output_records,
                    outputs.len(),
                    self.stats.total_output_bytes
                );
            }
            Err(e) => {
                log::warn!("compaction aborted: {}", e);
            }
        }
        result
    }

    fn run_merge(
        &mut self,
        alloc_file_number: &mut dyn FnMut() -> u64,
        _start: Instant,
    ) -> Result<Vec<FileMetaData>> {
        let icmp = InternalKeyComparator::new(self.options.comparator.clone());

        // Open every input file; order children newest-level first so exact
        // internal-key ties resolve to the freshest source
        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        for input in &self.compaction.inputs {
            for file in &input.files {
                let reader = self.table_cache.get(file.number)?;
                let props = reader.properties();
                self.stats.total_input_raw_key_bytes += props.raw_key_size;
                self.stats.total_input_raw_value_bytes += props.raw_value_size;
                children.push(Box::new(reader.iter(None)));
            }
        }

        let merger = MergingIterator::new(children, icmp);
        let mut iter = CompactionIter::new(
            Box::new(merger),
            self.options.comparator.clone(),
            self.snapshots.clone(),
            self.earliest_write_conflict_snapshot,
            self.last_sequence,
            self.compaction.bottommost,
            Some(self.compaction.largest_user_key().to_vec()),
            self.options.paranoid_corrupt_keys,
        );

        let mut outputs: Vec<FileMetaData> = Vec::new();
        let mut current: Option<OutputState> = None;

        let run = (|| -> Result<()> {
            iter.seek_to_first();
            while iter.valid() {
                if self.shutting_down.load(AtomicOrdering::Acquire) {
                    return Err(Error::ShutdownInProgress);
                }

                if current.is_none() {
                    let number = alloc_file_number();
                    let builder = ColumnTableBuilder::new(
                        self.table_cache.table_path(number),
                        self.options,
                    )?;
                    current = Some(OutputState {
                        builder,
                        number,
                        smallest_key: Vec::new(),
                        largest_key: Vec::new(),
                        smallest_seqno: u64::MAX,
                        largest_seqno: 0,
                    });
                }
                let output = current.as_mut().expect("output exists");

                let key = iter.key();
                output.builder.add(key, iter.value())?;
                if output.smallest_key.is_empty() {
                    output.smallest_key = key.to_vec();
                }
                output.largest_key.clear();
                output.largest_key.extend_from_slice(key);
                if let Some(parsed) = ParsedInternalKey::parse(key) {
                    output.smallest_seqno = output.smallest_seqno.min(parsed.sequence);
                    output.largest_seqno = output.largest_seqno.max(parsed.sequence);
                }
                self.stats.num_output_records += 1;

                // Roll to a new output at a key boundary once the target
                // size is exceeded
                if output.builder.file_size_total() >= self.options.max_output_file_size {
                    let finished = current.take().expect("output exists");
                    outputs.push(self.finish_output(finished)?);
                }

                iter.next();
            }
            iter.status()?;

            if let Some(finished) = current.take() {
                outputs.push(self.finish_output(finished)?);
            }
            Ok(())
        })();

        let iter_stats = iter.stats().clone();
        self.stats.num_input_records = iter_stats.num_input_records;
        self.stats.num_input_deletion_records = iter_stats.num_input_deletion_records;
        self.stats.num_expired_deletion_records = iter_stats.num_expired_deletion_records;
        self.stats.num_corrupt_keys = iter_stats.num_corrupt_keys;
        self.stats.num_records_replaced = iter_stats.num_record_drop_hidden;

        if let Err(e) = run {
            if let Some(unfinished) = current.take() {
                remove_output_files(self.table_cache, unfinished.builder.abandon(), unfinished.number);
            }
            for output in &outputs {
                let main = self.table_cache.table_path(output.number);
                let mut paths = vec![main.clone()];
                for c in 1..=self.options.column_count {
                    paths.push(sub_file_path(&main, c));
                }
                remove_output_files(self.table_cache, paths, output.number);
            }
            return Err(e);
        }

        self.stats.num_output_files = outputs.len() as u64;
        if let Some(first) = outputs.first() {
            let user = FileMetaData::smallest_user_key(first);
            self.stats.smallest_output_key_prefix =
                user[..user.len().min(OUTPUT_KEY_PREFIX_LEN)].to_vec();
        }
        if let Some(last) = outputs.last() {
            let user = FileMetaData::largest_user_key(last);
            self.stats.largest_output_key_prefix =
                user[..user.len().min(OUTPUT_KEY_PREFIX_LEN)].to_vec();
        }
        Ok(outputs)
    }

    fn finish_output(&mut self, output: OutputState) -> Result<FileMetaData> {
        let OutputState { builder, number, smallest_key, largest_key, smallest_seqno, largest_seqno } =
            output;
        let num_entries = builder.num_entries();
        let file_size = builder.finish()?;
        self.stats.total_output_bytes += file_size;
        log::debug!("compaction output {:06}.sst: {} entries, {} bytes", number, num_entries, file_size);
        Ok(FileMetaData {
            number,
            file_size,
            smallest_key,
            largest_key,
            smallest_seqno: if smallest_seqno == u64::MAX { 0 } else { smallest_seqno },
            largest_seqno,
            marked_for_compaction: false,
        })
    }

    /// The version edit installing this compaction: all inputs removed, all
    /// outputs added at the output level. Apply under the write mutex.
    pub fn make_edit(&self, outputs: &[FileMetaData]) -> VersionEdit {
        let mut edit = VersionEdit::new();
        for input in &self.compaction.inputs {
            for file in &input.files {
                edit.delete_file(input.level, file.number);
            }
        }
        for output in outputs {
            edit.add_file(self.compaction.output_level, output.clone());
        }
        edit
    }

    /// The statistics accumulated by this job.
    pub fn stats(&self) -> &CompactionStats {
        &self.stats
    }
}

fn remove_output_files(table_cache: &TableCache, paths: Vec<std::path::PathBuf>, number: u64) {
    table_cache.evict(number);
    for path in paths {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("failed to remove partial output {}: {}", path.display(), e);
            }
        }
    }
}
