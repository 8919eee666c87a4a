//! Column-striped sorted table format.
//!
//! A logical table is one *main* file plus N *sub-column* files:
//!
//! ```text
//! main file (<nnnnnn>.sst)              sub file c (<nnnnnn>.sst.<c>)
//! [Data Block: internal_key -> row]     [Data Block: row -> column value]
//! ...                                   ...
//! [meta-column block]                   [meta-column block]
//! [properties block]                    [properties block]
//! [min/max summary block]               [min/max summary block]
//! [meta-index block]                    [meta-index block]
//! [index block]                         [index block]
//! [Footer: 53B]                         [Footer: 53B]
//! ```
//!
//! The main file's value stream is the 8-byte big-endian row ordinal; sub
//! files are keyed by that same ordinal, so the block and index machinery
//! is shared between both kinds of file.
//!
//! Every block is stored as `payload | type:u8 | masked_crc32c:u32`.

pub mod block;
pub mod builder;
pub mod footer;
pub mod index;
pub mod meta;
pub mod reader;

pub use block::{Block, BlockBuilder, BlockIterator};
pub use builder::ColumnTableBuilder;
pub use footer::{BlockHandle, Footer};
pub use index::IndexBlock;
pub use meta::TableProperties;
pub use reader::{ColumnPredicate, ColumnTableReader, GetState, RangeEntry, TableIterator};

use std::path::{Path, PathBuf};

use crate::config::CompressionType;
use crate::error::{Error, Result};

/// Magic number trailing every table file (little-endian on the wire).
pub const MAGIC_NUMBER: u64 = 0x88E2_41B7_85F4_CFFF;

/// Footer size in bytes (fixed).
pub const FOOTER_SIZE: usize = 53;

/// Table format version written into the footer.
pub const FORMAT_VERSION: u32 = 1;

/// Per-block trailer: 1 byte compression type + 4 bytes masked CRC.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Blocks at or above this size skip compression outright.
pub const COMPRESSION_SIZE_LIMIT: usize = 32 * 1024 * 1024;

/// Meta-index entry name for the column layout block.
pub const META_COLUMN_BLOCK_NAME: &[u8] = b"stripekv.columns";

/// Meta-index entry name for the properties block.
pub const META_PROPERTIES_BLOCK_NAME: &[u8] = b"stripekv.properties";

/// Meta-index entry name for the per-block min/max summary.
pub const META_MINMAX_BLOCK_NAME: &[u8] = b"stripekv.minmax";

const CRC_MASK_DELTA: u32 = 0xA282_EAD8;

/// Masks a CRC so that storing the CRC of data that itself contains CRCs
/// does not produce degenerate values.
pub fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(CRC_MASK_DELTA)
}

/// Inverse of [`mask_crc`].
pub fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(CRC_MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

/// CRC of a block payload extended over its type byte, as stored in the
/// block trailer.
pub fn block_crc(payload: &[u8], type_byte: u8) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.update(&[type_byte]);
    hasher.finalize()
}

/// Path of the `index`-th sub-column file (1-based) next to a main file.
pub fn sub_file_path(main_path: &Path, index: usize) -> PathBuf {
    let mut name = main_path.as_os_str().to_os_string();
    name.push(format!(".{}", index));
    PathBuf::from(name)
}

/// Compresses a block payload, falling back to no compression when the
/// codec is unavailable or the ratio is not worth it (saving < 12.5%).
/// Returns the bytes to store and the type byte actually used.
pub fn compress_block(raw: &[u8], requested: CompressionType) -> (Vec<u8>, CompressionType) {
    if requested == CompressionType::None || raw.len() >= COMPRESSION_SIZE_LIMIT {
        return (raw.to_vec(), CompressionType::None);
    }

    let compressed: Option<Vec<u8>> = match requested {
        #[cfg(feature = "snappy")]
        CompressionType::Snappy => snap::raw::Encoder::new().compress_vec(raw).ok(),
        #[cfg(feature = "zlib-compression")]
        CompressionType::Zlib => {
            use std::io::Write;
            let mut enc =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(raw).ok().and_then(|_| enc.finish().ok())
        }
        #[cfg(feature = "lz4-compression")]
        CompressionType::Lz4 | CompressionType::Lz4hc => {
            Some(lz4_flex::compress_prepend_size(raw))
        }
        _ => None,
    };

    match compressed {
        Some(out) if good_compression_ratio(out.len(), raw.len()) => (out, requested),
        _ => (raw.to_vec(), CompressionType::None),
    }
}

/// Decompresses a block payload according to its trailer type byte.
pub fn decompress_block(data: &[u8], compression: CompressionType) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        #[cfg(feature = "snappy")]
        CompressionType::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| Error::corruption(format!("snappy decompression failed: {}", e))),
        #[cfg(feature = "zlib-compression")]
        CompressionType::Zlib => {
            use std::io::Read;
            let mut out = Vec::new();
            flate2::read::ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| Error::corruption(format!("zlib decompression failed: {}", e)))?;
            Ok(out)
        }
        #[cfg(feature = "lz4-compression")]
        CompressionType::Lz4 | CompressionType::Lz4hc => {
            lz4_flex::decompress_size_prepended(data)
                .map_err(|e| Error::corruption(format!("lz4 decompression failed: {}", e)))
        }
        other => Err(Error::not_supported(format!(
            "compression codec {} not compiled in",
            other.as_str()
        ))),
    }
}

/// Check to see if compressed less than 12.5%.
fn good_compression_ratio(compressed_size: usize, raw_size: usize) -> bool {
    compressed_size < raw_size - (raw_size / 8)
}
