//! Configuration options for the stripekv storage engine.

use std::sync::Arc;

use crate::comparator::{BytewiseComparator, Comparator};
use crate::splitter::{PipeSplitter, Splitter};

/// Configuration options for opening a database.
#[derive(Clone)]
pub struct Options {
    /// Create the database if it doesn't exist.
    /// Default: true
    pub create_if_missing: bool,

    /// Error if the database already exists.
    /// Default: false
    pub error_if_exists: bool,

    /// User-key total order.
    /// Default: byte-lexicographic
    pub comparator: Arc<dyn Comparator>,

    /// Column decomposition/composition function.
    /// Default: `PipeSplitter` on `|`
    pub splitter: Arc<dyn Splitter>,

    /// Number of sub-column files per table. Fixed at database creation.
    /// Default: 3
    pub column_count: usize,

    /// Compression codec for table blocks.
    /// Default: Snappy when the feature is enabled, None otherwise
    pub compression: CompressionType,

    /// Size threshold for flushing the memtable to a level-0 table (bytes).
    /// Default: 4MB
    pub memtable_size: usize,

    /// Target size for main/sub data blocks (bytes).
    /// Default: 4KB
    pub block_size: usize,

    /// Restart density for entry blocks.
    /// Default: 16
    pub block_restart_interval: usize,

    /// Restart density for index blocks. 1 enables pure binary search.
    /// Default: 1
    pub index_block_restart_interval: usize,

    /// Block cache capacity in bytes. Set to 0 to disable caching.
    /// Default: 8MB
    pub block_cache_size: usize,

    /// Table-cache capacity: maximum number of table files held open.
    /// Default: 1000
    pub max_open_files: usize,

    /// fsync (true) vs fdatasync (false) when closing table files.
    /// Default: false
    pub use_fsync: bool,

    /// Maximum number of Level 0 files before triggering compaction.
    /// Default: 4
    pub level0_compaction_threshold: usize,

    /// Base level size (Level 1 target size in bytes).
    /// Default: 10MB
    pub base_level_size: u64,

    /// Size multiplier between levels.
    /// Default: 10
    pub level_size_multiplier: u64,

    /// Maximum number of levels.
    /// Default: 7
    pub max_levels: usize,

    /// Target size for a single compaction output file (bytes).
    /// Default: 2MB
    pub max_output_file_size: u64,

    /// When true, compaction fails with `Corruption` on a malformed internal
    /// key instead of counting it and writing it through.
    /// Default: false (write-through, matching historical behavior)
    pub paranoid_corrupt_keys: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            comparator: Arc::new(BytewiseComparator),
            splitter: Arc::new(PipeSplitter::default()),
            column_count: 3,
            compression: CompressionType::default(),
            memtable_size: 4 * 1024 * 1024,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            index_block_restart_interval: 1,
            block_cache_size: 8 * 1024 * 1024,
            max_open_files: 1000,
            use_fsync: false,
            level0_compaction_threshold: 4,
            base_level_size: 10 * 1024 * 1024,
            level_size_multiplier: 10,
            max_levels: 7,
            max_output_file_size: 2 * 1024 * 1024,
            paranoid_corrupt_keys: false,
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("create_if_missing", &self.create_if_missing)
            .field("comparator", &self.comparator.name())
            .field("splitter", &self.splitter.name())
            .field("column_count", &self.column_count)
            .field("compression", &self.compression)
            .field("memtable_size", &self.memtable_size)
            .field("block_size", &self.block_size)
            .field("max_open_files", &self.max_open_files)
            .finish()
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if it doesn't exist.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the user-key comparator.
    pub fn comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Sets the value splitter.
    pub fn splitter(mut self, splitter: Arc<dyn Splitter>) -> Self {
        self.splitter = splitter;
        self
    }

    /// Sets the number of sub-column files per table.
    pub fn column_count(mut self, count: usize) -> Self {
        self.column_count = count;
        self
    }

    /// Sets the compression codec.
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the memtable flush threshold.
    pub fn memtable_size(mut self, size: usize) -> Self {
        self.memtable_size = size;
        self
    }

    /// Sets the target data-block size.
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Sets the block cache capacity.
    pub fn block_cache_size(mut self, size: usize) -> Self {
        self.block_cache_size = size;
        self
    }

    /// Sets the table-cache capacity.
    pub fn max_open_files(mut self, count: usize) -> Self {
        self.max_open_files = count;
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.column_count == 0 {
            return Err(crate::Error::invalid_argument("column_count must be > 0"));
        }
        if self.column_count > 255 {
            return Err(crate::Error::invalid_argument("column_count must be <= 255"));
        }
        if self.memtable_size == 0 {
            return Err(crate::Error::invalid_argument("memtable_size must be > 0"));
        }
        if self.block_size == 0 {
            return Err(crate::Error::invalid_argument("block_size must be > 0"));
        }
        if self.block_restart_interval == 0 || self.index_block_restart_interval == 0 {
            return Err(crate::Error::invalid_argument("restart intervals must be > 0"));
        }
        if self.max_levels < 2 {
            return Err(crate::Error::invalid_argument("max_levels must be >= 2"));
        }
        if self.max_open_files == 0 {
            return Err(crate::Error::invalid_argument("max_open_files must be > 0"));
        }
        Ok(())
    }
}

/// Per-read options: snapshot pinning and column projection.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Read as of this sequence number instead of the latest state.
    pub snapshot: Option<u64>,

    /// Sub-columns to materialize; `None` reads every column. Positions
    /// outside the projection stitch as empty.
    pub projection: Option<Vec<usize>>,
}

impl ReadOptions {
    /// Options reading the latest state with all columns.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts reads to the given columns.
    pub fn projection(mut self, columns: Vec<usize>) -> Self {
        self.projection = Some(columns);
        self
    }

    /// Pins reads to a snapshot sequence.
    pub fn snapshot(mut self, sequence: u64) -> Self {
        self.snapshot = Some(sequence);
        self
    }
}

/// Compression codecs recognized on the wire.
///
/// The numeric values are the block-trailer type codes and must not change.
/// A codec whose crate feature is disabled falls back to `None` when writing
/// and surfaces `NotSupported` when reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    /// No compression.
    None = 0,
    /// Snappy (fast, moderate ratio).
    Snappy = 1,
    /// Zlib/deflate.
    Zlib = 2,
    /// BZip2 (no bundled codec).
    BZip2 = 3,
    /// LZ4 (very fast).
    Lz4 = 4,
    /// LZ4 high-compression mode.
    Lz4hc = 5,
    /// Xpress (no bundled codec).
    Xpress = 6,
    /// Zstandard, pre-1.0 framing.
    ZstdNotFinal = 7,
}

impl CompressionType {
    /// Convert from the wire code.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Snappy),
            2 => Some(CompressionType::Zlib),
            3 => Some(CompressionType::BZip2),
            4 => Some(CompressionType::Lz4),
            5 => Some(CompressionType::Lz4hc),
            6 => Some(CompressionType::Xpress),
            7 => Some(CompressionType::ZstdNotFinal),
            _ => None,
        }
    }

    /// The name persisted in the table properties block.
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionType::None => "NoCompression",
            CompressionType::Snappy => "Snappy",
            CompressionType::Zlib => "Zlib",
            CompressionType::BZip2 => "BZip2",
            CompressionType::Lz4 => "LZ4",
            CompressionType::Lz4hc => "LZ4HC",
            CompressionType::Xpress => "Xpress",
            CompressionType::ZstdNotFinal => "ZSTDNotFinal",
        }
    }

    /// Whether a codec for this type is compiled in.
    pub fn is_available(self) -> bool {
        match self {
            CompressionType::None => true,
            #[cfg(feature = "snappy")]
            CompressionType::Snappy => true,
            #[cfg(feature = "zlib-compression")]
            CompressionType::Zlib => true,
            #[cfg(feature = "lz4-compression")]
            CompressionType::Lz4 | CompressionType::Lz4hc => true,
            _ => false,
        }
    }
}

impl Default for CompressionType {
    fn default() -> Self {
        #[cfg(feature = "snappy")]
        return CompressionType::Snappy;

        #[cfg(not(feature = "snappy"))]
        CompressionType::None
    }
}
