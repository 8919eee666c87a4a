//! # stripekv - A Column-Striped LSM Storage Engine
//!
//! stripekv is a persistent, ordered key-value storage engine built on the
//! Log-Structured Merge-Tree architecture with a column-oriented on-disk
//! table layout: every logical table is one *main* file holding the sorted
//! key stream plus N parallel *sub-column* files each holding one projected
//! value column. Readers skip entire files and blocks when only a subset
//! of columns is needed.
//!
//! ## Architecture
//!
//! - **MemTable**: concurrent in-memory sorted table for recent writes
//! - **Column-striped tables**: immutable sorted files, one main + N subs
//! - **Compaction**: background merging with snapshot-aware tombstone
//!   resolution
//! - **Versions**: manifest-logged file sets, recovered on open
//! - **Block / table caches**: shared LRU resources across all readers
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use stripekv::{DB, Options, ReadOptions};
//!
//! # fn main() -> Result<(), stripekv::Error> {
//! let db = DB::open("./data", Options::default())?;
//!
//! // Values decompose into columns through the configured splitter
//! db.put(b"user:1", b"alice|admin|2024")?;
//! db.put(b"user:2", b"bob|guest|2025")?;
//!
//! // Full read
//! assert_eq!(db.get(b"user:1")?, Some(b"alice|admin|2024".to_vec()));
//!
//! // Projected read: only column 0 is fetched from disk
//! let opts = ReadOptions::new().projection(vec![0]);
//! assert_eq!(db.get_with(b"user:1", &opts)?, Some(b"alice||".to_vec()));
//!
//! db.delete(b"user:2")?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cache;
pub mod comparator;
pub mod compaction;
pub mod config;
pub mod error;
pub mod iterator;
pub mod memtable;
pub mod snapshot;
pub mod splitter;
pub mod sstable;

pub use comparator::{BytewiseComparator, Comparator};
pub use config::{CompressionType, Options, ReadOptions};
pub use error::{Error, Result};
pub use iterator::DBIterator;
pub use snapshot::Snapshot;
pub use splitter::{LengthSplitter, PipeSplitter, Splitter};
pub use sstable::reader::{ColumnPredicate, RangeEntry};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use cache::{BlockCache, TableCache};
use compaction::{
    Compaction, CompactionInputLevel, CompactionJob, CompactionPicker, FileMetaData, VersionEdit,
    VersionSet,
};
use iterator::InternalIterator;
use memtable::{
    lookup_key, InternalKeyComparator, LookupResult, MemTable, ParsedInternalKey, MAX_SEQUENCE,
};
use snapshot::SnapshotList;
use sstable::{sub_file_path, ColumnTableBuilder, GetState};

struct BackgroundState {
    scheduled: bool,
    error: Option<Error>,
}

/// Files no longer referenced by the current version, waiting for every
/// version that might still read them to be released.
struct PendingCleanup {
    files: Vec<u64>,
    versions: Vec<Weak<compaction::Version>>,
}

pub(crate) struct DbInner {
    path: PathBuf,
    options: Options,
    icmp: InternalKeyComparator,
    mem: RwLock<Arc<MemTable>>,
    /// The global write mutex: sequence assignment and memtable swaps.
    write_mutex: Mutex<()>,
    versions: Mutex<VersionSet>,
    last_sequence: AtomicU64,
    table_cache: Arc<TableCache>,
    pub(crate) snapshots: SnapshotList,
    shutting_down: Arc<AtomicBool>,
    background: Mutex<BackgroundState>,
    background_cv: Condvar,
    /// Serializes compaction selection and installation so concurrent
    /// manual and background compactions never pick overlapping inputs.
    compaction_mutex: Mutex<()>,
    /// Superseded versions that may still be held by in-flight readers.
    live_versions: Mutex<Vec<Weak<compaction::Version>>>,
    pending_cleanup: Mutex<Vec<PendingCleanup>>,
}

/// The main database handle.
///
/// Thread-safe: share it behind an `Arc` or hand out [`Snapshot`]s and
/// iterators, which keep the engine alive independently.
pub struct DB {
    inner: Arc<DbInner>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for DB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DB").finish_non_exhaustive()
    }
}

impl DB {
    /// Opens a database at `path`, creating it when permitted by the
    /// options, recovering the file set from the manifest, and removing
    /// orphaned table files left by a crash.
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<DB> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        // The bundled memtable orders keys bytewise; a custom comparator
        // needs a matching memtable implementation.
        if options.comparator.name() != BytewiseComparator.name() {
            return Err(Error::invalid_argument(
                "the bundled memtable supports only the bytewise comparator",
            ));
        }

        let icmp = InternalKeyComparator::new(options.comparator.clone());
        let versions = VersionSet::open(
            &path,
            icmp.clone(),
            options.max_levels,
            options.create_if_missing,
            options.error_if_exists,
        )?;
        let last_sequence = versions.last_sequence();

        Self::remove_orphaned_files(&path, &versions)?;

        let block_cache = (options.block_cache_size > 0)
            .then(|| Arc::new(BlockCache::new(options.block_cache_size)));
        let table_cache = Arc::new(TableCache::new(&path, options.clone(), block_cache));

        let inner = Arc::new(DbInner {
            path,
            options,
            icmp,
            mem: RwLock::new(Arc::new(MemTable::new())),
            write_mutex: Mutex::new(()),
            versions: Mutex::new(versions),
            last_sequence: AtomicU64::new(last_sequence),
            table_cache,
            snapshots: SnapshotList::default(),
            shutting_down: Arc::new(AtomicBool::new(false)),
            background: Mutex::new(BackgroundState { scheduled: false, error: None }),
            background_cv: Condvar::new(),
            compaction_mutex: Mutex::new(()),
            live_versions: Mutex::new(Vec::new()),
            pending_cleanup: Mutex::new(Vec::new()),
        });

        let worker = {
            let weak = Arc::downgrade(&inner);
            std::thread::Builder::new()
                .name("stripekv-compaction".to_string())
                .spawn(move || background_worker(weak))?
        };

        Ok(DB { inner, worker: Mutex::new(Some(worker)) })
    }

    /// Deletes table and manifest files not referenced by the recovered
    /// version.
    fn remove_orphaned_files(path: &Path, versions: &VersionSet) -> Result<()> {
        let live = versions.current().live_files();
        let manifest_name = format!("MANIFEST-{:06}", versions.manifest_number());

        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };

            let doomed = if let Some(rest) = name.strip_prefix("MANIFEST-") {
                name != manifest_name && rest.chars().all(|c| c.is_ascii_digit())
            } else if let Some(number) = parse_table_file_name(name) {
                !live.contains(&number)
            } else {
                false
            };

            if doomed {
                log::info!("removing orphaned file {}", name);
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Inserts a key-value pair. The value is decomposed into columns by
    /// the configured splitter when the table is written.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.write(key, Some(value), WriteKind::Put)
    }

    /// Deletes a key (hides every older version).
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.write(key, None, WriteKind::Delete)
    }

    /// Single-deletes a key: cancels exactly one prior `put`. Only valid
    /// when the key was written once since the last (single-)deletion;
    /// mixing with overwrites yields undefined visibility, as documented
    /// for the write-conflict protocol.
    pub fn single_delete(&self, key: &[u8]) -> Result<()> {
        self.inner.write(key, None, WriteKind::SingleDelete)
    }

    /// Reads the newest visible value of a key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_with(key, &ReadOptions::default())
    }

    /// Reads with snapshot and projection control.
    pub fn get_with(&self, key: &[u8], read_options: &ReadOptions) -> Result<Option<Vec<u8>>> {
        let sequence = read_options
            .snapshot
            .unwrap_or_else(|| self.inner.last_sequence.load(AtomicOrdering::Acquire));
        self.inner.get_at(key, sequence, read_options.projection.as_deref())
    }

    /// Takes a snapshot pinned at the current sequence.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(
            self.inner.clone(),
            self.inner.last_sequence.load(AtomicOrdering::Acquire),
        )
    }

    /// An ordered iterator over user keys.
    pub fn iter(&self, read_options: &ReadOptions) -> Result<DBIterator> {
        self.inner.new_iterator(read_options)
    }

    /// Projected range scan over `[lo, hi]` (inclusive), merged across the
    /// memtable and every level with snapshot visibility applied.
    pub fn range_query(
        &self,
        lo: &[u8],
        hi: &[u8],
        read_options: &ReadOptions,
    ) -> Result<Vec<RangeEntry>> {
        let mut iter = self.inner.new_iterator(read_options)?;
        let ucmp = self.inner.options.comparator.clone();
        let mut results = Vec::new();
        iter.seek(lo);
        while iter.valid() {
            if ucmp.compare(iter.key(), hi) == std::cmp::Ordering::Greater {
                break;
            }
            results.push(RangeEntry {
                user_key: iter.key().to_vec(),
                sequence: iter.sequence(),
                value: iter.value().to_vec(),
            });
            iter.next();
        }
        iter.status()?;
        Ok(results)
    }

    /// Synchronously flushes the memtable into a level-0 table.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    /// Compacts every level range overlapping `[lo, hi]` (whole keyspace
    /// when `None`), waiting for completion.
    pub fn compact_range(&self, lo: Option<&[u8]>, hi: Option<&[u8]>) -> Result<()> {
        self.inner.flush()?;
        self.inner.compact_range_manual(lo, hi)
    }

    /// The engine's current sequence number.
    pub fn last_sequence(&self) -> u64 {
        self.inner.last_sequence.load(AtomicOrdering::Acquire)
    }

    /// Takes the first error recorded by the background worker, if any.
    pub fn take_background_error(&self) -> Option<Error> {
        self.inner.background.lock().error.take()
    }

    /// The database directory.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Signals shutdown, aborts background work at the next boundary, and
    /// joins the worker. Further writes fail with `ShutdownInProgress`.
    pub fn close(&self) -> Result<()> {
        self.inner.shutting_down.store(true, AtomicOrdering::Release);
        self.inner.background_cv.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.inner.purge_obsolete_files();
        Ok(())
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[derive(Clone, Copy)]
enum WriteKind {
    Put,
    Delete,
    SingleDelete,
}

impl DbInner {
    fn write(&self, key: &[u8], value: Option<&[u8]>, kind: WriteKind) -> Result<()> {
        if self.shutting_down.load(AtomicOrdering::Acquire) {
            return Err(Error::ShutdownInProgress);
        }
        if key.is_empty() {
            return Err(Error::invalid_argument("key cannot be empty"));
        }

        {
            let _guard = self.write_mutex.lock();
            let sequence = self.last_sequence.load(AtomicOrdering::Relaxed) + 1;
            let mem = self.mem.read().clone();
            match kind {
                WriteKind::Put => mem.put(key, value.unwrap_or_default(), sequence),
                WriteKind::Delete => mem.delete(key, sequence),
                WriteKind::SingleDelete => mem.single_delete(key, sequence),
            }
            self.last_sequence.store(sequence, AtomicOrdering::Release);
        }

        if self.mem.read().approximate_size() > self.options.memtable_size {
            self.flush()?;
        }
        Ok(())
    }

    pub(crate) fn get_at(
        &self,
        key: &[u8],
        sequence: u64,
        projection: Option<&[usize]>,
    ) -> Result<Option<Vec<u8>>> {
        // Memtable first: it holds the newest data
        match self.mem.read().get(key, sequence) {
            LookupResult::Found(value) => {
                return Ok(Some(self.apply_projection(value, projection)))
            }
            LookupResult::Deleted => return Ok(None),
            LookupResult::NotFound => {}
        }

        let current = self.versions.lock().current();
        let lookup = lookup_key(key, sequence);
        let ucmp = self.options.comparator.as_ref();

        // Level 0 files may overlap; they are ordered newest first
        for file in &current.levels[0] {
            if ucmp.compare(key, file.smallest_user_key()) == std::cmp::Ordering::Less
                || ucmp.compare(key, file.largest_user_key()) == std::cmp::Ordering::Greater
            {
                continue;
            }
            match self.table_cache.get(file.number)?.get(&lookup, projection)? {
                GetState::Found(value) => return Ok(Some(value)),
                GetState::Deleted => return Ok(None),
                GetState::NotFound => {}
            }
        }

        // Deeper levels are disjoint: at most one candidate file per level
        for level in current.levels.iter().skip(1) {
            let idx = level.partition_point(|f| {
                ucmp.compare(f.largest_user_key(), key) == std::cmp::Ordering::Less
            });
            if idx >= level.len() {
                continue;
            }
            let file = &level[idx];
            if ucmp.compare(key, file.smallest_user_key()) == std::cmp::Ordering::Less {
                continue;
            }
            match self.table_cache.get(file.number)?.get(&lookup, projection)? {
                GetState::Found(value) => return Ok(Some(value)),
                GetState::Deleted => return Ok(None),
                GetState::NotFound => {}
            }
        }

        Ok(None)
    }

    /// Restricts a whole value to the projected columns, matching what the
    /// table readers return for the same projection.
    fn apply_projection(&self, value: Vec<u8>, projection: Option<&[usize]>) -> Vec<u8> {
        let cols = match projection {
            Some(cols) => cols,
            None => return value,
        };
        let splitter = self.options.splitter.as_ref();
        let pieces = splitter.split(&value);
        let mut projected = vec![Vec::new(); self.options.column_count];
        if !pieces.is_empty() {
            for &c in cols {
                if let Some(piece) = pieces.get(c) {
                    projected[c] = piece.clone();
                }
            }
        }
        splitter.stitch(&projected)
    }

    fn new_iterator(&self, read_options: &ReadOptions) -> Result<DBIterator> {
        let sequence = read_options
            .snapshot
            .unwrap_or_else(|| self.last_sequence.load(AtomicOrdering::Acquire));
        let projection = read_options.projection.clone();

        // Memtable values are stored whole; apply the projection here so
        // merged values look the same no matter which layer served them
        let mut mem_entries = self.mem.read().snapshot_entries();
        if projection.is_some() {
            for (_, value) in &mut mem_entries {
                if value.is_empty() {
                    continue;
                }
                *value = self.apply_projection(std::mem::take(value), projection.as_deref());
            }
        }

        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        children.push(Box::new(iterator::VecIterator::new(mem_entries, self.icmp.clone())));

        let current = self.versions.lock().current();
        for level in &current.levels {
            for file in level {
                let reader = self.table_cache.get(file.number)?;
                children.push(Box::new(reader.iter(projection.clone())));
            }
        }

        let merger = compaction::MergingIterator::new(children, self.icmp.clone());
        let mut iter = DBIterator::new(merger, self.options.comparator.clone(), sequence);
        iter.pin_version(current);
        Ok(iter)
    }

    /// Swaps in a fresh memtable and writes the old one as a level-0
    /// table, logging the version edit.
    fn flush(&self) -> Result<()> {
        let (old_mem, flushed_sequence) = {
            let _guard = self.write_mutex.lock();
            let mem = self.mem.read().clone();
            if mem.is_empty() {
                return Ok(());
            }
            *self.mem.write() = Arc::new(MemTable::new());
            (mem, self.last_sequence.load(AtomicOrdering::Acquire))
        };

        let entries = old_mem.snapshot_entries();
        log::info!("flushing memtable: {} entries", entries.len());

        let number = self.versions.lock().new_file_number();
        let path = self.table_cache.table_path(number);

        let meta = match self.build_table(&path, number, &entries) {
            Ok(meta) => meta,
            Err(e) => {
                // Without a WAL a failed flush must not silently drop the
                // memtable contents; put them back for a later retry.
                let _guard = self.write_mutex.lock();
                let current = self.mem.read().clone();
                for (key, value) in old_mem.snapshot_entries() {
                    if let Some(parsed) = ParsedInternalKey::parse(&key) {
                        match parsed.value_type() {
                            Some(memtable::ValueType::Value) => {
                                current.put(parsed.user_key, &value, parsed.sequence)
                            }
                            Some(memtable::ValueType::Deletion) => {
                                current.delete(parsed.user_key, parsed.sequence)
                            }
                            Some(memtable::ValueType::SingleDeletion) => {
                                current.single_delete(parsed.user_key, parsed.sequence)
                            }
                            None => {}
                        }
                    }
                }
                return Err(e);
            }
        };

        let mut edit = VersionEdit::new();
        edit.add_file(0, meta).set_last_sequence(flushed_sequence);
        self.install_edit(&edit)?;

        self.purge_obsolete_files();
        self.maybe_schedule_compaction();
        Ok(())
    }

    /// Durably applies an edit under the write-side version lock and tracks
    /// the superseded version for deferred file reclamation.
    fn install_edit(&self, edit: &VersionEdit) -> Result<()> {
        let mut versions = self.versions.lock();
        let superseded = versions.current();
        versions.log_and_apply(edit)?;
        self.live_versions.lock().push(Arc::downgrade(&superseded));
        Ok(())
    }

    /// Records files referenced only by already-superseded versions; they
    /// are removed from disk once every such version is released.
    fn schedule_file_cleanup(&self, files: Vec<u64>) {
        let mut live = self.live_versions.lock();
        live.retain(|w| w.strong_count() > 0);
        let versions = live.clone();
        drop(live);
        self.pending_cleanup.lock().push(PendingCleanup { files, versions });
    }

    /// Deletes scheduled files whose guarding versions have all been
    /// released. A version is destroyed when the last reader drops it and
    /// it has been superseded, so files unreachable from the current
    /// version and unguarded by any live version are safe to remove.
    fn purge_obsolete_files(&self) {
        let mut doomed = Vec::new();
        {
            let mut pending = self.pending_cleanup.lock();
            pending.retain(|entry| {
                if entry.versions.iter().any(|w| w.strong_count() > 0) {
                    true
                } else {
                    doomed.extend(entry.files.iter().copied());
                    false
                }
            });
        }
        for number in doomed {
            self.table_cache.evict(number);
            let main = self.table_cache.table_path(number);
            for c in (1..=self.options.column_count).rev() {
                let _ = std::fs::remove_file(sub_file_path(&main, c));
            }
            log::debug!("removing obsolete table {:06}.sst", number);
            let _ = std::fs::remove_file(main);
        }
    }

    fn build_table(
        &self,
        path: &Path,
        number: u64,
        entries: &[(Vec<u8>, Vec<u8>)],
    ) -> Result<FileMetaData> {
        let mut builder = ColumnTableBuilder::new(path, &self.options)?;
        let mut smallest_seqno = u64::MAX;
        let mut largest_seqno = 0;
        for (key, value) in entries {
            builder.add(key, value)?;
            if let Some(parsed) = ParsedInternalKey::parse(key) {
                smallest_seqno = smallest_seqno.min(parsed.sequence);
                largest_seqno = largest_seqno.max(parsed.sequence);
            }
        }
        let file_size = builder.finish()?;

        Ok(FileMetaData {
            number,
            file_size,
            smallest_key: entries.first().expect("flush of empty memtable").0.clone(),
            largest_key: entries.last().expect("flush of empty memtable").0.clone(),
            smallest_seqno: if smallest_seqno == u64::MAX { 0 } else { smallest_seqno },
            largest_seqno,
            marked_for_compaction: false,
        })
    }

    fn maybe_schedule_compaction(&self) {
        let mut state = self.background.lock();
        if !state.scheduled {
            state.scheduled = true;
            self.background_cv.notify_one();
        }
    }

    /// Runs picker-selected compactions until the version is quiet.
    fn run_background_compactions(&self) {
        let picker = CompactionPicker::new(&self.options);
        loop {
            if self.shutting_down.load(AtomicOrdering::Acquire) {
                return;
            }
            let _pick_guard = self.compaction_mutex.lock();
            let current = self.versions.lock().current();
            let compaction = match picker.pick(&current, &self.icmp) {
                Some(c) => c,
                None => return,
            };
            if let Err(e) = self.run_compaction(compaction, false) {
                if !matches!(e, Error::ShutdownInProgress) {
                    log::error!("background compaction failed: {}", e);
                    self.background.lock().error = Some(e);
                }
                return;
            }
        }
    }

    fn run_compaction(&self, compaction: Compaction, is_manual: bool) -> Result<()> {
        let input_numbers: Vec<u64> = compaction
            .inputs
            .iter()
            .flat_map(|i| i.files.iter().map(|f| f.number))
            .collect();

        let snapshots = self.snapshots.all();
        let last_sequence = self.last_sequence.load(AtomicOrdering::Acquire);
        let mut job = CompactionJob::new(
            compaction,
            &self.options,
            &self.table_cache,
            snapshots,
            MAX_SEQUENCE,
            last_sequence,
            &self.shutting_down,
            is_manual,
        );

        let outputs = job.run(&mut || self.versions.lock().new_file_number())?;
        let edit = job.make_edit(&outputs);
        self.install_edit(&edit)?;

        // Inputs are unreachable from the current version; reclaim them
        // once every older version is released
        self.schedule_file_cleanup(input_numbers);
        self.purge_obsolete_files();
        Ok(())
    }

    fn compact_range_manual(&self, lo: Option<&[u8]>, hi: Option<&[u8]>) -> Result<()> {
        let _guard = self.compaction_mutex.lock();
        for level in 0..self.options.max_levels - 1 {
            if self.shutting_down.load(AtomicOrdering::Acquire) {
                return Err(Error::ShutdownInProgress);
            }
            let current = self.versions.lock().current();
            if current.levels[level].is_empty() {
                continue;
            }

            let smallest = lo
                .map(|k| k.to_vec())
                .unwrap_or_else(|| {
                    current.levels[level]
                        .iter()
                        .map(|f| f.smallest_user_key().to_vec())
                        .min()
                        .unwrap_or_default()
                });
            let largest = hi
                .map(|k| k.to_vec())
                .unwrap_or_else(|| {
                    current.levels[level]
                        .iter()
                        .map(|f| f.largest_user_key().to_vec())
                        .max()
                        .unwrap_or_default()
                });

            let upper = current.overlapping_files(level, &smallest, &largest, &self.icmp);
            if upper.is_empty() {
                continue;
            }
            let lower =
                current.overlapping_files(level + 1, &smallest, &largest, &self.icmp);

            let mut inputs = vec![CompactionInputLevel { level, files: upper }];
            if !lower.is_empty() {
                inputs.push(CompactionInputLevel { level: level + 1, files: lower });
            }
            let compaction = Compaction::new(inputs, level + 1, &current, &self.icmp);
            self.run_compaction(compaction, true)?;
        }
        Ok(())
    }
}

fn parse_table_file_name(name: &str) -> Option<u64> {
    let stem = name.split(".sst").next()?;
    if !name[stem.len()..].starts_with(".sst") {
        return None;
    }
    let suffix = &name[stem.len() + 4..];
    // Either the main file (empty suffix) or ".N" for a sub file
    if !suffix.is_empty() {
        let column = suffix.strip_prefix('.')?;
        if column.is_empty() || !column.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
    }
    if stem.is_empty() || !stem.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

fn background_worker(weak: Weak<DbInner>) {
    loop {
        let db = match weak.upgrade() {
            Some(db) => db,
            None => return,
        };
        if db.shutting_down.load(AtomicOrdering::Acquire) {
            return;
        }

        let should_work = {
            let mut state = db.background.lock();
            if !state.scheduled {
                // Bounded wait so a dropped engine is noticed promptly
                db.background_cv.wait_for(&mut state, Duration::from_millis(200));
            }
            std::mem::replace(&mut state.scheduled, false)
        };

        if should_work && !db.shutting_down.load(AtomicOrdering::Acquire) {
            db.run_background_compactions();
        }
    }
}
