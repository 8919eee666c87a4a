//! Versions and the manifest.
//!
//! A *version* is an immutable snapshot of `level -> ordered file list`.
//! Mutations are expressed as [`VersionEdit`]s, appended to the manifest
//! (`MANIFEST-<n>`, named by the `CURRENT` file) as length-delimited,
//! CRC-protected bincode records and replayed sequentially on open. Each
//! edit applies atomically: readers hold an `Arc` to the version they
//! started with and never observe a half-applied change.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::comparator::Comparator;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memtable::{extract_user_key, InternalKeyComparator};

/// Metadata for one table file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetaData {
    /// File number (`<number>.sst` plus its sub files).
    pub number: u64,
    /// Byte size across the main and sub files.
    pub file_size: u64,
    /// Smallest internal key in the file.
    pub smallest_key: Vec<u8>,
    /// Largest internal key in the file.
    pub largest_key: Vec<u8>,
    /// Smallest sequence number in the file.
    pub smallest_seqno: u64,
    /// Largest sequence number in the file.
    pub largest_seqno: u64,
    /// Flagged by readers/pickers for priority compaction.
    pub marked_for_compaction: bool,
}

impl FileMetaData {
    /// The file's smallest user key.
    pub fn smallest_user_key(&self) -> &[u8] {
        extract_user_key(&self.smallest_key)
    }

    /// The file's largest user key.
    pub fn largest_user_key(&self) -> &[u8] {
        extract_user_key(&self.largest_key)
    }
}

/// A recorded change to the version: file additions/removals plus counter
/// updates. One edit may carry any combination; replay is idempotent
/// (deletions apply before additions).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionEdit {
    /// New write-ahead log number, if changed.
    pub log_number: Option<u64>,
    /// New next-file counter, if changed.
    pub next_file_number: Option<u64>,
    /// New last-sequence counter, if changed.
    pub last_sequence: Option<u64>,
    /// Files added, with their levels.
    pub added_files: Vec<(usize, FileMetaData)>,
    /// Files removed, as `(level, file_number)`.
    pub deleted_files: Vec<(usize, u64)>,
}

impl VersionEdit {
    /// Creates an empty edit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a file addition.
    pub fn add_file(&mut self, level: usize, meta: FileMetaData) -> &mut Self {
        self.added_files.push((level, meta));
        self
    }

    /// Records a file deletion.
    pub fn delete_file(&mut self, level: usize, number: u64) -> &mut Self {
        self.deleted_files.push((level, number));
        self
    }

    /// Records a log-number update.
    pub fn set_log_number(&mut self, number: u64) -> &mut Self {
        self.log_number = Some(number);
        self
    }

    /// Records a next-file-counter update.
    pub fn set_next_file(&mut self, number: u64) -> &mut Self {
        self.next_file_number = Some(number);
        self
    }

    /// Records a last-sequence update.
    pub fn set_last_sequence(&mut self, sequence: u64) -> &mut Self {
        self.last_sequence = Some(sequence);
        self
    }
}

/// An immutable `level -> ordered file list` snapshot.
#[derive(Debug, Clone)]
pub struct Version {
    /// Files per level. Level 0 is ordered newest first; deeper levels are
    /// disjoint and ordered by smallest key.
    pub levels: Vec<Vec<FileMetaData>>,
}

impl Version {
    /// An empty version with `max_levels` levels.
    pub fn new(max_levels: usize) -> Self {
        Self { levels: vec![Vec::new(); max_levels] }
    }

    /// Applies an edit, producing the successor version.
    pub fn apply(&self, edit: &VersionEdit, icmp: &InternalKeyComparator) -> Self {
        let mut next = self.clone();
        for (level, number) in &edit.deleted_files {
            next.levels[*level].retain(|f| f.number != *number);
        }
        for (level, meta) in &edit.added_files {
            next.levels[*level].push(meta.clone());
        }
        // Level 0 files may overlap; order them newest first. Deeper levels
        // are disjoint and ordered by smallest key.
        if !next.levels.is_empty() {
            next.levels[0].sort_by(|a, b| {
                b.largest_seqno.cmp(&a.largest_seqno).then(b.number.cmp(&a.number))
            });
        }
        for level in next.levels.iter_mut().skip(1) {
            level.sort_by(|a, b| icmp.compare(&a.smallest_key, &b.smallest_key));
        }
        next
    }

    /// Total number of files.
    pub fn num_files(&self) -> usize {
        self.levels.iter().map(|level| level.len()).sum()
    }

    /// Total bytes across all files.
    pub fn total_size(&self) -> u64 {
        self.levels.iter().flatten().map(|f| f.file_size).sum()
    }

    /// Bytes held by one level.
    pub fn level_size(&self, level: usize) -> u64 {
        self.levels[level].iter().map(|f| f.file_size).sum()
    }

    /// Files in `level` whose user-key range intersects
    /// `[smallest, largest]`.
    pub fn overlapping_files(
        &self,
        level: usize,
        smallest: &[u8],
        largest: &[u8],
        icmp: &InternalKeyComparator,
    ) -> Vec<FileMetaData> {
        let ucmp = icmp.user_comparator();
        self.levels[level]
            .iter()
            .filter(|f| {
                ucmp.compare(f.largest_user_key(), smallest) != std::cmp::Ordering::Less
                    && ucmp.compare(f.smallest_user_key(), largest) != std::cmp::Ordering::Greater
            })
            .cloned()
            .collect()
    }

    /// File numbers of every live file.
    pub fn live_files(&self) -> HashSet<u64> {
        self.levels.iter().flatten().map(|f| f.number).collect()
    }
}

const CURRENT_FILE: &str = "CURRENT";

fn manifest_path(db_path: &Path, number: u64) -> PathBuf {
    db_path.join(format!("MANIFEST-{:06}", number))
}

/// Owns the current version, the counters, and the manifest writer.
///
/// All mutation happens under the engine's write mutex.
pub struct VersionSet {
    db_path: PathBuf,
    icmp: InternalKeyComparator,
    current: Arc<Version>,
    manifest: Option<BufWriter<File>>,
    manifest_number: u64,
    next_file_number: u64,
    last_sequence: u64,
    log_number: u64,
    max_levels: usize,
}

impl std::fmt::Debug for VersionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionSet").finish_non_exhaustive()
    }
}

impl VersionSet {
    /// Opens (or creates) the version set for a database directory.
    pub fn open(
        db_path: &Path,
        icmp: InternalKeyComparator,
        max_levels: usize,
        create_if_missing: bool,
        error_if_exists: bool,
    ) -> Result<Self> {
        let current_path = db_path.join(CURRENT_FILE);
        let exists = current_path.exists();
        if exists && error_if_exists {
            return Err(Error::invalid_argument(format!(
                "database already exists at {}",
                db_path.display()
            )));
        }
        if !exists && !create_if_missing {
            return Err(Error::invalid_argument(format!(
                "database missing at {} and create_if_missing is off",
                db_path.display()
            )));
        }

        let mut set = Self {
            db_path: db_path.to_path_buf(),
            icmp,
            current: Arc::new(Version::new(max_levels)),
            manifest: None,
            manifest_number: 1,
            next_file_number: 2,
            last_sequence: 0,
            log_number: 0,
            max_levels,
        };

        if exists {
            set.recover()?;
        } else {
            set.create_new()?;
        }
        Ok(set)
    }

    fn create_new(&mut self) -> Result<()> {
        log::info!("creating new database at {}", self.db_path.display());
        let path = manifest_path(&self.db_path, self.manifest_number);
        let file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        self.manifest = Some(BufWriter::new(file));

        let mut edit = VersionEdit::new();
        edit.set_log_number(0).set_next_file(self.next_file_number).set_last_sequence(0);
        self.write_record(&edit)?;
        self.sync_manifest()?;
        self.set_current_file()?;
        Ok(())
    }

    fn set_current_file(&self) -> Result<()> {
        // Write CURRENT through a temp file so a crash never leaves a
        // half-written pointer
        let tmp = self.db_path.join("CURRENT.dbtmp");
        {
            let mut file = File::create(&tmp)?;
            writeln!(file, "MANIFEST-{:06}", self.manifest_number)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, self.db_path.join(CURRENT_FILE))?;
        Ok(())
    }

    fn recover(&mut self) -> Result<()> {
        let current = std::fs::read_to_string(self.db_path.join(CURRENT_FILE))?;
        let manifest_name = current.trim();
        let number: u64 = manifest_name
            .strip_prefix("MANIFEST-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| Error::corruption(format!("bad CURRENT contents: {:?}", current)))?;
        self.manifest_number = number;

        log::info!("recovering from {}", manifest_name);
        let mut data = Vec::new();
        File::open(self.db_path.join(manifest_name))?.read_to_end(&mut data)?;

        let mut version = Version::new(self.max_levels);
        let mut pos = 0;
        let mut edits = 0u64;
        while pos < data.len() {
            if data.len() - pos < 8 {
                return Err(Error::corruption("truncated manifest record header"));
            }
            let len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            let crc = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap());
            pos += 8;
            if data.len() - pos < len {
                return Err(Error::corruption("truncated manifest record payload"));
            }
            let payload = &data[pos..pos + len];
            if crc32fast::hash(payload) != crc {
                return Err(Error::corruption("manifest record checksum mismatch"));
            }
            let edit: VersionEdit = bincode::deserialize(payload)?;
            self.apply_counters(&edit);
            version = version.apply(&edit, &self.icmp);
            pos += len;
            edits += 1;
        }
        self.current = Arc::new(version);
        log::info!(
            "recovered {} edits, {} live files, last sequence {}",
            edits,
            self.current.num_files(),
            self.last_sequence
        );

        // Reopen the manifest for appending
        let path = manifest_path(&self.db_path, self.manifest_number);
        let file = OpenOptions::new().append(true).open(&path)?;
        self.manifest = Some(BufWriter::new(file));
        Ok(())
    }

    fn apply_counters(&mut self, edit: &VersionEdit) {
        if let Some(n) = edit.log_number {
            self.log_number = n;
        }
        if let Some(n) = edit.next_file_number {
            self.next_file_number = n;
        }
        if let Some(n) = edit.last_sequence {
            self.last_sequence = n;
        }
        for (_, meta) in &edit.added_files {
            if meta.number >= self.next_file_number {
                self.next_file_number = meta.number + 1;
            }
        }
    }

    fn write_record(&mut self, edit: &VersionEdit) -> Result<()> {
        let payload = bincode::serialize(edit)?;
        let manifest = self
            .manifest
            .as_mut()
            .ok_or_else(|| Error::aborted("manifest writer not open"))?;
        manifest.write_all(&(payload.len() as u32).to_le_bytes())?;
        manifest.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
        manifest.write_all(&payload)?;
        Ok(())
    }

    fn sync_manifest(&mut self) -> Result<()> {
        if let Some(manifest) = self.manifest.as_mut() {
            manifest.flush()?;
            manifest.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Durably appends `edit` and installs the successor version.
    ///
    /// Must be called under the engine write mutex; the application order
    /// of edits is the commit order.
    pub fn log_and_apply(&mut self, edit: &VersionEdit) -> Result<()> {
        self.write_record(edit)?;
        self.sync_manifest()?;
        self.apply_counters(edit);
        self.current = Arc::new(self.current.apply(edit, &self.icmp));
        Ok(())
    }

    /// A reference-counted handle to the current version.
    pub fn current(&self) -> Arc<Version> {
        self.current.clone()
    }

    /// Allocates a fresh file number.
    pub fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// The last sequence number recorded.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Updates the last sequence number (monotonic).
    pub fn set_last_sequence(&mut self, sequence: u64) {
        debug_assert!(sequence >= self.last_sequence);
        self.last_sequence = sequence;
    }

    /// The manifest file's own number (never a table number).
    pub fn manifest_number(&self) -> u64 {
        self.manifest_number
    }

    /// The internal-key comparator shared by every level.
    pub fn internal_comparator(&self) -> &InternalKeyComparator {
        &self.icmp
    }
}
