//! Column-striped table reader.
//!
//! Opens a main file and lazily attaches its sub-column files. Supports
//! point gets, ordered iteration through a two-level (index -> data block)
//! iterator, and projected range queries that skip whole data blocks via
//! the per-block min/max summaries.
//!
//! Any CRC mismatch, short read, or footer-validation failure poisons the
//! reader: every subsequent operation fails with `Corruption`.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::cache::{BlockCache, CacheKey};
use crate::comparator::{Comparator, OrdinalComparator};
use crate::config::{CompressionType, Options};
use crate::error::{Error, Result};
use crate::iterator::InternalIterator;
use crate::memtable::{extract_user_key, InternalKeyComparator, ParsedInternalKey, ValueType};
use crate::splitter::Splitter;
use crate::sstable::block::{Block, BlockIterator};
use crate::sstable::footer::{BlockHandle, Footer};
use crate::sstable::index::IndexBlock;
use crate::sstable::meta::{
    decode_meta_index, decode_minmax_block, BlockSummary, MetaColumnBlock, TableProperties,
};
use crate::sstable::{
    block_crc, decompress_block, sub_file_path, unmask_crc, BLOCK_TRAILER_SIZE, FOOTER_SIZE,
    META_COLUMN_BLOCK_NAME, META_MINMAX_BLOCK_NAME, META_PROPERTIES_BLOCK_NAME,
};

/// Outcome of a point lookup against one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetState {
    /// The key was found with this (stitched, projected) value.
    Found(Vec<u8>),
    /// The key is masked by a tombstone in this table.
    Deleted,
    /// The table holds no entry for the key at or below the snapshot.
    NotFound,
}

/// A bound on one column's values, used for block-level skipping in range
/// queries. Bounds are inclusive and compared bytewise.
#[derive(Debug, Clone, Default)]
pub struct ColumnPredicate {
    /// The column this predicate constrains.
    pub column: usize,
    /// Inclusive lower bound, if any.
    pub min: Option<Vec<u8>>,
    /// Inclusive upper bound, if any.
    pub max: Option<Vec<u8>>,
}

/// One row produced by a projected range query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeEntry {
    /// The row's user key.
    pub user_key: Vec<u8>,
    /// The row's sequence number.
    pub sequence: u64,
    /// The stitched value, restricted to the projected columns.
    pub value: Vec<u8>,
}

/// Read access to a main file and its sub-column files.
pub struct ColumnTableReader {
    path: PathBuf,
    file: std::fs::File,
    cache_id: u64,
    index: IndexBlock,
    props: TableProperties,
    column_meta: MetaColumnBlock,
    summaries: Vec<BlockSummary>,
    /// Internal-key comparator for the main file, ordinal comparator for subs.
    comparator: Arc<dyn Comparator>,
    user_comparator: Arc<dyn Comparator>,
    splitter: Arc<dyn Splitter>,
    block_cache: Option<Arc<BlockCache>>,
    subs: RwLock<Vec<Option<Arc<ColumnTableReader>>>>,
    corrupted: AtomicBool,
}

impl std::fmt::Debug for ColumnTableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnTableReader")
            .field("path", &self.path)
            .field("num_entries", &self.props.num_entries)
            .field("column_count", &self.column_meta.column_count)
            .finish()
    }
}

impl ColumnTableReader {
    /// Opens the main file of a table. Sub-column readers are attached
    /// lazily on first columnar access.
    pub fn open<P: AsRef<Path>>(
        path: P,
        options: &Options,
        block_cache: Option<Arc<BlockCache>>,
        file_number: u64,
    ) -> Result<Arc<Self>> {
        let reader = Self::open_file(
            path.as_ref(),
            Arc::new(InternalKeyComparator::new(options.comparator.clone())),
            options,
            block_cache,
            file_number << 8,
            true,
        )?;

        if reader.props.comparator_name != options.comparator.name() {
            return Err(Error::invalid_argument(format!(
                "comparator mismatch: table built with {:?}, options carry {:?}",
                reader.props.comparator_name,
                options.comparator.name()
            )));
        }
        if reader.props.splitter_name != options.splitter.name() {
            return Err(Error::invalid_argument(format!(
                "splitter mismatch: table built with {:?}, options carry {:?}",
                reader.props.splitter_name,
                options.splitter.name()
            )));
        }
        Ok(reader)
    }

    fn open_file(
        path: &Path,
        comparator: Arc<dyn Comparator>,
        options: &Options,
        block_cache: Option<Arc<BlockCache>>,
        cache_id: u64,
        expect_main: bool,
    ) -> Result<Arc<Self>> {
        let mut file = std::fs::File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < FOOTER_SIZE as u64 {
            return Err(Error::corruption("file too small to hold a table footer"));
        }

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer_buf = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer_buf)?;
        let footer = Footer::decode(&footer_buf)?;

        let meta_index = read_block_raw(&file, &footer.meta_index_handle)?;
        let meta_map = decode_meta_index(meta_index)?;

        let props_handle = *meta_map
            .get(META_PROPERTIES_BLOCK_NAME)
            .ok_or_else(|| Error::corruption("missing properties block"))?;
        let props = TableProperties::decode(read_block_raw(&file, &props_handle)?)?;

        let column_handle = *meta_map
            .get(META_COLUMN_BLOCK_NAME)
            .ok_or_else(|| Error::corruption("missing meta-column block"))?;
        let column_meta = MetaColumnBlock::decode(&read_block_raw(&file, &column_handle)?)?;
        if column_meta.main != expect_main {
            return Err(Error::corruption("main/sub flag mismatch in meta-column block"));
        }

        let minmax_handle = *meta_map
            .get(META_MINMAX_BLOCK_NAME)
            .ok_or_else(|| Error::corruption("missing min/max summary block"))?;
        let summaries = decode_minmax_block(&read_block_raw(&file, &minmax_handle)?)?;

        let index = IndexBlock::new(read_block_raw(&file, &footer.index_handle)?)?;
        if index.len() != summaries.len() {
            return Err(Error::corruption("index and min/max summary disagree on block count"));
        }

        let sub_slots = if expect_main { column_meta.column_count as usize } else { 0 };

        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            file,
            cache_id,
            index,
            props,
            column_meta,
            summaries,
            comparator,
            user_comparator: options.comparator.clone(),
            splitter: options.splitter.clone(),
            block_cache,
            subs: RwLock::new(vec![None; sub_slots]),
            corrupted: AtomicBool::new(false),
        }))
    }

    /// Table properties recorded at build time.
    pub fn properties(&self) -> &TableProperties {
        &self.props
    }

    /// Number of entries in the table.
    pub fn num_entries(&self) -> u64 {
        self.props.num_entries
    }

    /// Number of sub-column files.
    pub fn column_count(&self) -> usize {
        self.column_meta.column_count as usize
    }

    /// Path of the main file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Smallest internal key in the table, if any.
    pub fn smallest_key(&self) -> Result<Option<Vec<u8>>> {
        let entries = self.index.entries();
        if entries.is_empty() {
            return Ok(None);
        }
        let block = Block::new(self.read_block(&entries[0].handle)?)
            .map_err(|e| self.note_error(e))?;
        let mut iter = block.iter();
        iter.seek_to_first();
        Ok(iter.valid().then(|| iter.key().to_vec()))
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.corrupted.load(AtomicOrdering::Acquire) {
            return Err(Error::corruption(format!(
                "table {} refused: earlier corruption detected",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn note_error(&self, err: Error) -> Error {
        if err.is_corruption() {
            self.corrupted.store(true, AtomicOrdering::Release);
        }
        err
    }

    /// Reads, verifies, and decompresses a block, consulting the block
    /// cache. Concurrent loads of the same block are idempotent.
    fn read_block(&self, handle: &BlockHandle) -> Result<Bytes> {
        self.check_poisoned()?;

        let key = CacheKey::new(self.cache_id, handle.offset);
        if let Some(cache) = &self.block_cache {
            if let Some(data) = cache.get(&key) {
                return Ok(data);
            }
        }

        let data = read_block_raw(&self.file, handle).map_err(|e| self.note_error(e))?;

        if let Some(cache) = &self.block_cache {
            cache.insert(key, data.clone());
        }
        Ok(data)
    }

    /// The sub-column reader for column `index` (0-based), opened on first
    /// use. Verifies entry-count alignment with the main file.
    pub fn sub_reader(&self, index: usize) -> Result<Arc<ColumnTableReader>> {
        self.check_poisoned()?;
        if index >= self.column_count() {
            return Err(Error::invalid_argument(format!(
                "column {} out of range (table has {})",
                index,
                self.column_count()
            )));
        }

        if let Some(sub) = &self.subs.read()[index] {
            return Ok(sub.clone());
        }

        let mut slot = self.subs.write();
        if let Some(sub) = &slot[index] {
            return Ok(sub.clone());
        }

        let sub_path = sub_file_path(&self.path, index + 1);
        if !sub_path.exists() {
            return Err(self.note_error(Error::corruption(format!(
                "missing sub-column file {}",
                sub_path.display()
            ))));
        }

        // Options only feeds comparator/splitter names downward; the sub
        // file itself is ordinal-keyed.
        let options = Options {
            comparator: self.user_comparator.clone(),
            splitter: self.splitter.clone(),
            ..Default::default()
        };
        let sub = Self::open_file(
            &sub_path,
            Arc::new(OrdinalComparator),
            &options,
            self.block_cache.clone(),
            self.cache_id | (index as u64 + 1),
            false,
        )
        .map_err(|e| self.note_error(e))?;

        if sub.props.num_entries != self.props.num_entries {
            return Err(self.note_error(Error::corruption(format!(
                "sub-column file {} has {} entries, main has {}",
                sub_path.display(),
                sub.props.num_entries,
                self.props.num_entries
            ))));
        }

        slot[index] = Some(sub.clone());
        Ok(sub)
    }

    /// Point lookup. `lookup` is the encoded seek key for
    /// `(user_key, snapshot)`; `projection` restricts which columns are
    /// materialized (`None` = all).
    pub fn get(&self, lookup: &[u8], projection: Option<&[usize]>) -> Result<GetState> {
        self.check_poisoned()?;

        let handle = match self.index.find_block(lookup, self.comparator.as_ref()) {
            Some(h) => h,
            None => return Ok(GetState::NotFound),
        };

        let block = Block::new(self.read_block(&handle)?).map_err(|e| self.note_error(e))?;
        let mut iter = block.iter();
        iter.seek(lookup, self.comparator.as_ref());
        if !iter.valid() {
            return Ok(GetState::NotFound);
        }

        let parsed = ParsedInternalKey::parse(iter.key())
            .ok_or_else(|| self.note_error(Error::corruption("truncated internal key")))?;
        let target_user = extract_user_key(lookup);
        if !self.user_comparator.equal(parsed.user_key, target_user) {
            return Ok(GetState::NotFound);
        }

        match parsed.value_type() {
            Some(ValueType::Value) => {
                let ordinal = decode_ordinal(iter.value()).map_err(|e| self.note_error(e))?;
                let value = self.stitch_row(ordinal, projection)?;
                Ok(GetState::Found(value))
            }
            Some(ValueType::Deletion) | Some(ValueType::SingleDeletion) => Ok(GetState::Deleted),
            None => Err(self.note_error(Error::corruption("corrupt value type in table entry"))),
        }
    }

    /// Fetches the projected columns of row `ordinal` and stitches them.
    fn stitch_row(&self, ordinal: u64, projection: Option<&[usize]>) -> Result<Vec<u8>> {
        let mut columns = vec![Vec::new(); self.column_count()];
        match projection {
            None => {
                for (c, slot) in columns.iter_mut().enumerate() {
                    *slot = self.column_value(c, ordinal)?;
                }
            }
            Some(cols) => {
                for &c in cols {
                    columns[c] = self.column_value(c, ordinal)?;
                }
            }
        }
        Ok(self.splitter.stitch(&columns))
    }

    /// Reads one column value by row ordinal from sub file `column`.
    fn column_value(&self, column: usize, ordinal: u64) -> Result<Vec<u8>> {
        let sub = self.sub_reader(column)?;
        let pos = ordinal.to_be_bytes();

        let handle = sub
            .index
            .find_block(&pos, sub.comparator.as_ref())
            .ok_or_else(|| sub.note_error(Error::corruption("row ordinal past sub-column index")))?;
        let block = Block::new(sub.read_block(&handle)?).map_err(|e| sub.note_error(e))?;
        let mut iter = block.iter();
        iter.seek(&pos, sub.comparator.as_ref());
        if !iter.valid() || iter.key() != pos.as_slice() {
            return Err(sub.note_error(Error::corruption(format!(
                "row {} missing from sub-column file {}",
                ordinal,
                sub.path.display()
            ))));
        }
        Ok(iter.value().to_vec())
    }

    /// Ordered iteration over internal keys with stitched projected values.
    pub fn iter(self: Arc<Self>, projection: Option<Vec<usize>>) -> TableIterator {
        TableIterator::new(self, projection, true)
    }

    /// Iteration over the main file only (keys and row ordinals; values are
    /// never materialized). Used where only key information matters.
    pub fn raw_iter(self: Arc<Self>) -> TableIterator {
        TableIterator::new(self, Some(Vec::new()), false)
    }

    /// Projected range query over the inclusive user-key interval
    /// `[lo, hi]`.
    ///
    /// Candidate data blocks are pruned with the per-block min/max
    /// summaries: first against the key interval, then against the supplied
    /// column predicates. Predicates prune whole blocks; surviving blocks
    /// are emitted in full, so callers needing exact filtering re-check
    /// rows. Only `Value` entries are returned.
    pub fn range_query(
        &self,
        lo: &[u8],
        hi: &[u8],
        projection: Option<&[usize]>,
        predicates: &[ColumnPredicate],
    ) -> Result<Vec<RangeEntry>> {
        self.check_poisoned()?;

        let mut results = Vec::new();
        for block_index in 0..self.summaries.len() {
            if !self.block_intersects_keys(block_index, lo, hi) {
                continue;
            }
            if !self.block_passes_predicates(block_index, predicates)? {
                continue;
            }
            self.scan_block(block_index, lo, hi, projection, &mut results)?;
        }
        Ok(results)
    }

    fn block_intersects_keys(&self, block_index: usize, lo: &[u8], hi: &[u8]) -> bool {
        let summary = &self.summaries[block_index];
        let cmp = self.user_comparator.as_ref();
        cmp.compare(&summary.max, lo) != std::cmp::Ordering::Less
            && cmp.compare(&summary.min, hi) != std::cmp::Ordering::Greater
    }

    /// Ordinal span `[first, next)` covered by a main data block.
    fn block_ordinal_span(&self, block_index: usize) -> (u64, u64) {
        let first = self.summaries[block_index].first_ordinal;
        let next = self
            .summaries
            .get(block_index + 1)
            .map(|s| s.first_ordinal)
            .unwrap_or(self.props.num_entries);
        (first, next)
    }

    fn block_passes_predicates(
        &self,
        block_index: usize,
        predicates: &[ColumnPredicate],
    ) -> Result<bool> {
        if predicates.is_empty() {
            return Ok(true);
        }
        let (first, next) = self.block_ordinal_span(block_index);

        for pred in predicates {
            let sub = self.sub_reader(pred.column)?;
            // A block survives a predicate if any overlapping sub block's
            // value extrema intersect the predicate interval.
            let mut overlaps = false;
            for (j, summary) in sub.summaries.iter().enumerate() {
                let sub_first = summary.first_ordinal;
                let sub_next = sub
                    .summaries
                    .get(j + 1)
                    .map(|s| s.first_ordinal)
                    .unwrap_or(sub.props.num_entries);
                if sub_next <= first || sub_first >= next {
                    continue;
                }
                let below =
                    pred.max.as_ref().map_or(false, |max| summary.min.as_slice() > max.as_slice());
                let above =
                    pred.min.as_ref().map_or(false, |min| summary.max.as_slice() < min.as_slice());
                if !below && !above {
                    overlaps = true;
                    break;
                }
            }
            if !overlaps {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn scan_block(
        &self,
        block_index: usize,
        lo: &[u8],
        hi: &[u8],
        projection: Option<&[usize]>,
        results: &mut Vec<RangeEntry>,
    ) -> Result<()> {
        let handle = self.index.entries()[block_index].handle;
        let block = Block::new(self.read_block(&handle)?).map_err(|e| self.note_error(e))?;
        let cmp = self.user_comparator.as_ref();

        let mut iter = block.iter();
        iter.seek_to_first();
        while iter.valid() {
            let parsed = ParsedInternalKey::parse(iter.key())
                .ok_or_else(|| self.note_error(Error::corruption("truncated internal key")))?;
            if cmp.compare(parsed.user_key, hi) == std::cmp::Ordering::Greater {
                break;
            }
            if cmp.compare(parsed.user_key, lo) != std::cmp::Ordering::Less
                && parsed.value_type() == Some(ValueType::Value)
            {
                let ordinal = decode_ordinal(iter.value()).map_err(|e| self.note_error(e))?;
                results.push(RangeEntry {
                    user_key: parsed.user_key.to_vec(),
                    sequence: parsed.sequence,
                    value: self.stitch_row(ordinal, projection)?,
                });
            }
            iter.advance();
        }
        Ok(())
    }
}

fn decode_ordinal(value: &[u8]) -> Result<u64> {
    if value.len() != 8 {
        return Err(Error::corruption("row ordinal is not 8 bytes"));
    }
    Ok(u64::from_be_bytes(value.try_into().unwrap()))
}

/// Reads `handle`'s payload plus trailer, verifies the masked CRC, and
/// decompresses.
fn read_block_raw(file: &std::fs::File, handle: &BlockHandle) -> Result<Bytes> {
    let total = handle.size as usize + BLOCK_TRAILER_SIZE;
    let mut buf = vec![0u8; total];

    let mut reader = file.try_clone()?;
    reader.seek(SeekFrom::Start(handle.offset))?;
    reader.read_exact(&mut buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::corruption("short read inside table file")
        } else {
            Error::Io(e)
        }
    })?;

    let payload = &buf[..handle.size as usize];
    let type_byte = buf[handle.size as usize];
    let stored = u32::from_le_bytes(buf[handle.size as usize + 1..].try_into().unwrap());

    let actual = block_crc(payload, type_byte);
    let expected = unmask_crc(stored);
    if actual != expected {
        return Err(Error::ChecksumMismatch { expected, actual });
    }

    let compression = CompressionType::from_u8(type_byte)
        .ok_or_else(|| Error::corruption("unknown compression type byte"))?;
    Ok(Bytes::from(decompress_block(payload, compression)?))
}

/// Two-level iterator: the index block routes to data blocks; each data
/// block is iterated in order. Values are stitched from the projected
/// sub-columns as the iterator moves.
pub struct TableIterator {
    reader: Arc<ColumnTableReader>,
    block_index: usize,
    block_iter: Option<BlockIterator>,
    projection: Option<Vec<usize>>,
    materialize: bool,
    value: Vec<u8>,
    status: Option<Error>,
}

impl TableIterator {
    fn new(reader: Arc<ColumnTableReader>, projection: Option<Vec<usize>>, materialize: bool) -> Self {
        Self {
            reader,
            block_index: 0,
            block_iter: None,
            projection,
            materialize,
            value: Vec::new(),
            status: None,
        }
    }

    fn load_block(&mut self, block_index: usize) -> Result<Option<BlockIterator>> {
        if block_index >= self.reader.index.len() {
            return Ok(None);
        }
        let handle = self.reader.index.entries()[block_index].handle;
        let data = self.reader.read_block(&handle)?;
        let block = Block::new(data).map_err(|e| self.reader.note_error(e))?;
        Ok(Some(block.iter()))
    }

    fn set_error(&mut self, err: Error) {
        self.block_iter = None;
        self.status = Some(err);
    }

    /// After the block cursor moved, skip exhausted blocks and materialize
    /// the current value.
    fn settle(&mut self) {
        loop {
            match &self.block_iter {
                None => return,
                Some(iter) if iter.valid() => break,
                Some(_) => {
                    self.block_index += 1;
                    match self.load_block(self.block_index) {
                        Ok(Some(mut next)) => {
                            next.seek_to_first();
                            self.block_iter = Some(next);
                        }
                        Ok(None) => {
                            self.block_iter = None;
                            return;
                        }
                        Err(e) => {
                            self.set_error(e);
                            return;
                        }
                    }
                }
            }
        }
        if let Err(e) = self.materialize_value() {
            self.set_error(e);
        }
    }

    fn materialize_value(&mut self) -> Result<()> {
        if !self.materialize {
            self.value.clear();
            return Ok(());
        }
        let iter = self.block_iter.as_ref().expect("settled iterator");
        let ordinal = decode_ordinal(iter.value())?;
        let projection = self.projection.as_deref();
        self.value = self.reader.stitch_row(ordinal, projection)?;
        Ok(())
    }

    /// The row ordinal of the current entry.
    pub fn ordinal(&self) -> Result<u64> {
        let iter = self.block_iter.as_ref().ok_or_else(|| Error::aborted("iterator not valid"))?;
        decode_ordinal(iter.value())
    }

    /// Positions at the table's first entry.
    pub fn seek_to_first(&mut self) -> Result<()> {
        self.status = None;
        self.block_index = 0;
        match self.load_block(0) {
            Ok(Some(mut iter)) => {
                iter.seek_to_first();
                self.block_iter = Some(iter);
                self.settle();
            }
            Ok(None) => self.block_iter = None,
            Err(e) => self.set_error(e),
        }
        self.status.as_ref().map_or(Ok(()), |e| Err(e.duplicate()))
    }

    /// Positions at the first entry with internal key >= `target`.
    pub fn seek_internal(&mut self, target: &[u8]) -> Result<()> {
        self.status = None;
        match self.reader.index.find_block_index(target, self.reader.comparator.as_ref()) {
            None => self.block_iter = None,
            Some(block_index) => {
                self.block_index = block_index;
                match self.load_block(block_index) {
                    Ok(Some(mut iter)) => {
                        iter.seek(target, self.reader.comparator.as_ref());
                        self.block_iter = Some(iter);
                        self.settle();
                    }
                    Ok(None) => self.block_iter = None,
                    Err(e) => self.set_error(e),
                }
            }
        }
        self.status.as_ref().map_or(Ok(()), |e| Err(e.duplicate()))
    }

    /// Advances to the next entry.
    pub fn advance(&mut self) {
        if let Some(iter) = &mut self.block_iter {
            iter.advance();
            self.settle();
        }
    }

    /// Whether the iterator is positioned at an entry. `false` may mean
    /// end-of-table or an error; check [`status`](Self::status).
    pub fn is_valid(&self) -> bool {
        self.status.is_none() && self.block_iter.as_ref().map_or(false, |i| i.valid())
    }

    /// The current encoded internal key.
    pub fn current_key(&self) -> &[u8] {
        self.block_iter.as_ref().expect("iterator not valid").key()
    }

    /// The current stitched value.
    pub fn current_value(&self) -> &[u8] {
        &self.value
    }

    /// Terminal status: `Ok` unless an error stopped iteration.
    pub fn current_status(&self) -> Result<()> {
        self.status.as_ref().map_or(Ok(()), |e| Err(e.duplicate()))
    }
}

impl InternalIterator for TableIterator {
    fn seek_to_first(&mut self) {
        let _ = TableIterator::seek_to_first(self);
    }

    fn seek(&mut self, target: &[u8]) {
        let _ = self.seek_internal(target);
    }

    fn next(&mut self) {
        self.advance();
    }

    fn valid(&self) -> bool {
        self.is_valid()
    }

    fn key(&self) -> &[u8] {
        self.current_key()
    }

    fn value(&self) -> &[u8] {
        self.current_value()
    }

    fn status(&self) -> Result<()> {
        self.current_status()
    }
}
