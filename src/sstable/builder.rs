//! Column-striped table builder.
//!
//! Writes one main file (sorted internal keys -> row ordinals) and N
//! sub-column files (row ordinal -> column value) in lockstep. Row
//! ordinals are encoded big-endian so bytewise comparison matches numeric
//! order, letting the sub files reuse the same block and index machinery
//! as the main file.
//!
//! All streams are append-only; `finish` fsyncs and closes every file.
//! The first error latches: subsequent operations are no-ops returning the
//! original error.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::comparator::{Comparator, OrdinalComparator};
use crate::config::{CompressionType, Options};
use crate::error::{Error, Result};
use crate::memtable::{extract_user_key, InternalKeyComparator};
use crate::splitter::{check_column_count, Splitter};
use crate::sstable::block::BlockBuilder;
use crate::sstable::footer::{BlockHandle, Footer};
use crate::sstable::index::IndexBlockBuilder;
use crate::sstable::meta::{
    MetaColumnBlock, MetaIndexBuilder, MinMaxBlockBuilder, TableProperties,
    TablePropertiesCollector,
};
use crate::sstable::{
    block_crc, compress_block, mask_crc, sub_file_path, BLOCK_TRAILER_SIZE,
    META_COLUMN_BLOCK_NAME, META_MINMAX_BLOCK_NAME, META_PROPERTIES_BLOCK_NAME,
};

/// One output stream: the main file or a single sub-column file.
struct Stream {
    path: PathBuf,
    writer: BufWriter<File>,
    offset: u64,
    data_block: BlockBuilder,
    index_builder: IndexBlockBuilder,
    minmax: MinMaxBlockBuilder,
    comparator: Arc<dyn Comparator>,
    last_key: Vec<u8>,
    props: TableProperties,
    block_restart_interval: usize,
    // Summary accumulation for the block currently being built
    block_first_ordinal: u64,
    block_min: Vec<u8>,
    block_max: Vec<u8>,
}

impl Stream {
    fn create(
        path: PathBuf,
        main: bool,
        comparator: Arc<dyn Comparator>,
        options: &Options,
    ) -> Result<Self> {
        let file = File::create(&path)?;
        // The main file records the user comparator; sub files are ordered
        // by the ordinal comparator and record that instead.
        let mut props = TableProperties {
            comparator_name: if main {
                options.comparator.name().to_string()
            } else {
                comparator.name().to_string()
            },
            compression_name: options.compression.as_str().to_string(),
            column_family_name: "default".to_string(),
            ..Default::default()
        };
        if main {
            props.splitter_name = options.splitter.name().to_string();
        }
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            offset: 0,
            data_block: BlockBuilder::new(options.block_restart_interval),
            index_builder: IndexBlockBuilder::new(options.index_block_restart_interval),
            minmax: MinMaxBlockBuilder::new(),
            comparator,
            last_key: Vec::new(),
            props,
            block_restart_interval: options.block_restart_interval,
            block_first_ordinal: 0,
            block_min: Vec::new(),
            block_max: Vec::new(),
        })
    }

    /// Adds an entry, flushing the current block first if it is full.
    /// `summary_key` feeds the min/max summary (user key for the main file,
    /// column value for subs); `ordinal` is the entry's row number.
    fn add(
        &mut self,
        key: &[u8],
        value: &[u8],
        summary_key: &[u8],
        ordinal: u64,
        block_size: usize,
        compression: CompressionType,
    ) -> Result<()> {
        if !self.data_block.is_empty() && self.data_block.size_after(key, value) > block_size {
            let handle = self.flush_data_block(compression)?;
            self.index_builder.add_entry(
                &self.last_key,
                Some(key),
                handle,
                self.comparator.as_ref(),
            );
        }

        if self.data_block.is_empty() {
            self.block_first_ordinal = ordinal;
            self.block_min = summary_key.to_vec();
            self.block_max = summary_key.to_vec();
        } else {
            // Main-file summary keys arrive sorted; sub-column values do not
            if summary_key < self.block_min.as_slice() {
                self.block_min = summary_key.to_vec();
            }
            if summary_key > self.block_max.as_slice() {
                self.block_max = summary_key.to_vec();
            }
        }

        self.data_block.add(key, value);
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.props.num_entries += 1;
        self.props.raw_key_size += key.len() as u64;
        self.props.raw_value_size += value.len() as u64;
        Ok(())
    }

    /// Writes out the current data block and returns its handle.
    fn flush_data_block(&mut self, compression: CompressionType) -> Result<BlockHandle> {
        debug_assert!(!self.data_block.is_empty());
        let old =
            std::mem::replace(&mut self.data_block, BlockBuilder::new(self.block_restart_interval));
        let payload = old.finish();
        let handle = self.write_block(&payload, compression)?;

        self.minmax.add(
            self.block_first_ordinal,
            std::mem::take(&mut self.block_min),
            std::mem::take(&mut self.block_max),
        );
        self.props.num_data_blocks += 1;
        self.props.data_size = self.offset;
        Ok(handle)
    }

    /// Compresses and writes a block with its trailer.
    fn write_block(&mut self, payload: &[u8], compression: CompressionType) -> Result<BlockHandle> {
        let (contents, actual) = compress_block(payload, compression);
        self.write_raw_block(&contents, actual)
    }

    /// Writes already-encoded block contents with `type | masked crc`.
    fn write_raw_block(
        &mut self,
        contents: &[u8],
        compression: CompressionType,
    ) -> Result<BlockHandle> {
        let handle = BlockHandle::new(self.offset, contents.len() as u64);
        self.writer.write_all(contents)?;

        let type_byte = compression as u8;
        let crc = mask_crc(block_crc(contents, type_byte));
        self.writer.write_all(&[type_byte])?;
        self.writer.write_all(&crc.to_le_bytes())?;

        self.offset += contents.len() as u64 + BLOCK_TRAILER_SIZE as u64;
        Ok(handle)
    }

    /// Flushes the final data block, writes meta blocks, index, and footer,
    /// then syncs and closes the file. Returns the final file size.
    fn finish(
        &mut self,
        compression: CompressionType,
        column_block: MetaColumnBlock,
        use_fsync: bool,
        user_collected: Vec<(String, String)>,
        collectors_names: String,
    ) -> Result<u64> {
        if !self.data_block.is_empty() {
            let handle = self.flush_data_block(compression)?;
            self.index_builder.add_entry(&self.last_key, None, handle, self.comparator.as_ref());
        }

        let mut meta_index = MetaIndexBuilder::new();

        let column_handle = self.write_raw_block(&column_block.encode(), CompressionType::None)?;
        meta_index.add(META_COLUMN_BLOCK_NAME, column_handle);

        self.props.index_size =
            self.index_builder.estimated_size() as u64 + BLOCK_TRAILER_SIZE as u64;
        self.props.property_collectors_names = collectors_names;
        for (k, v) in user_collected {
            self.props.user_collected.insert(k, v);
        }
        let props_payload = self.props.encode();
        let props_handle = self.write_raw_block(&props_payload, CompressionType::None)?;
        meta_index.add(META_PROPERTIES_BLOCK_NAME, props_handle);

        let minmax_payload = std::mem::take(&mut self.minmax).finish();
        let minmax_handle = self.write_raw_block(&minmax_payload, CompressionType::None)?;
        meta_index.add(META_MINMAX_BLOCK_NAME, minmax_handle);

        let meta_index_handle =
            self.write_raw_block(&meta_index.finish(), CompressionType::None)?;

        let index_payload =
            std::mem::replace(&mut self.index_builder, IndexBlockBuilder::new(1)).finish();
        let index_handle = self.write_block(&index_payload, CompressionType::None)?;

        let footer = Footer::new(meta_index_handle, index_handle);
        let footer_encoding = footer.encode();
        self.writer.write_all(&footer_encoding)?;
        self.offset += footer_encoding.len() as u64;

        self.writer.flush()?;
        let file = self.writer.get_ref();
        if use_fsync {
            file.sync_all()?;
        } else {
            file.sync_data()?;
        }
        Ok(self.offset)
    }
}

/// Writes a logical table: one main file plus N sub-column files.
///
/// Keys must be added in strictly increasing internal-key order. The
/// builder must be consumed with [`finish`](Self::finish) or
/// [`abandon`](Self::abandon).
pub struct ColumnTableBuilder {
    main: Stream,
    subs: Vec<Stream>,
    options: Options,
    internal_comparator: InternalKeyComparator,
    splitter: Arc<dyn Splitter>,
    collectors: Vec<Box<dyn TablePropertiesCollector>>,
    error: Option<Error>,
    closed: bool,
}

impl ColumnTableBuilder {
    /// Creates a builder writing to `path` (the main file); sub files land
    /// next to it as `<path>.1` .. `<path>.N`.
    pub fn new<P: AsRef<Path>>(path: P, options: &Options) -> Result<Self> {
        Self::with_collectors(path, options, Vec::new())
    }

    /// Like [`new`](Self::new) with user property collectors attached to
    /// the main file.
    pub fn with_collectors<P: AsRef<Path>>(
        path: P,
        options: &Options,
        collectors: Vec<Box<dyn TablePropertiesCollector>>,
    ) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        let internal_comparator = InternalKeyComparator::new(options.comparator.clone());

        let main = Stream::create(
            path.clone(),
            true,
            Arc::new(internal_comparator.clone()),
            options,
        )?;

        let mut subs = Vec::with_capacity(options.column_count);
        for i in 0..options.column_count {
            subs.push(Stream::create(
                sub_file_path(&path, i + 1),
                false,
                Arc::new(OrdinalComparator),
                options,
            )?);
        }

        Ok(Self {
            main,
            subs,
            options: options.clone(),
            internal_comparator,
            splitter: options.splitter.clone(),
            collectors,
            error: None,
            closed: false,
        })
    }

    /// Adds an entry. `key` is an encoded internal key; `value` is the full
    /// user value before column decomposition.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        assert!(!self.closed);
        if let Some(err) = &self.error {
            return Err(err.duplicate());
        }

        if self.main.props.num_entries > 0
            && self.internal_comparator.compare(key, &self.main.last_key)
                != std::cmp::Ordering::Greater
        {
            return Err(Error::invalid_argument("keys must be added in sorted order"));
        }

        let ordinal = self.main.props.num_entries;
        let pos = ordinal.to_be_bytes();

        let result = self.add_inner(key, value, ordinal, &pos);
        if let Err(err) = &result {
            self.error = Some(err.duplicate());
        }
        result
    }

    fn add_inner(&mut self, key: &[u8], value: &[u8], ordinal: u64, pos: &[u8; 8]) -> Result<()> {
        let user_key = extract_user_key(key).to_vec();
        self.main.add(
            key,
            pos,
            &user_key,
            ordinal,
            self.options.block_size,
            self.options.compression,
        )?;
        for collector in &mut self.collectors {
            collector.add(key, pos);
        }

        let pieces = self.splitter.split(value);
        check_column_count(&pieces, self.subs.len())?;
        for (i, sub) in self.subs.iter_mut().enumerate() {
            let col: &[u8] = if pieces.is_empty() { &[] } else { &pieces[i] };
            sub.add(pos, col, col, ordinal, self.options.block_size, self.options.compression)?;
        }
        Ok(())
    }

    /// Finalizes every stream: sub files first (their final sizes go into
    /// the main file's column block), then the main file.
    pub fn finish(mut self) -> Result<u64> {
        assert!(!self.closed);
        self.closed = true;
        if let Some(err) = &self.error {
            return Err(err.duplicate());
        }

        let column_count = self.subs.len() as u32;
        let mut sub_sizes = Vec::with_capacity(self.subs.len());
        for sub in &mut self.subs {
            let size = sub.finish(
                self.options.compression,
                MetaColumnBlock { main: false, column_count, sub_file_sizes: vec![] },
                self.options.use_fsync,
                Vec::new(),
                String::new(),
            )?;
            sub_sizes.push(size);
        }

        let mut collected = Vec::new();
        let mut names = Vec::new();
        for collector in &mut self.collectors {
            names.push(collector.name().to_string());
            collected.extend(collector.finish());
        }
        let collectors_names = format!("[{}]", names.join(","));

        self.main.finish(
            self.options.compression,
            MetaColumnBlock { main: true, column_count, sub_file_sizes: sub_sizes },
            self.options.use_fsync,
            collected,
            collectors_names,
        )
    }

    /// Drops the builder without writing footers. The partially written
    /// files are left on disk for the caller to remove.
    pub fn abandon(mut self) -> Vec<PathBuf> {
        self.closed = true;
        let mut paths = vec![self.main.path.clone()];
        paths.extend(self.subs.iter().map(|s| s.path.clone()));
        paths
    }

    /// Number of entries added so far.
    pub fn num_entries(&self) -> u64 {
        self.main.props.num_entries
    }

    /// Bytes written to the main file so far.
    pub fn file_size(&self) -> u64 {
        self.main.offset
    }

    /// Bytes written across the main and all sub files, including data
    /// still buffered in open blocks.
    pub fn file_size_total(&self) -> u64 {
        let buffered: u64 = self.main.data_block.current_size() as u64
            + self.subs.iter().map(|s| s.data_block.current_size() as u64).sum::<u64>();
        self.main.offset + self.subs.iter().map(|s| s.offset).sum::<u64>() + buffered
    }

    /// The last internal key added.
    pub fn last_key(&self) -> &[u8] {
        &self.main.last_key
    }
}
