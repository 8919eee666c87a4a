//! Table footer and block handles.
//!
//! The footer is a fixed-size (53 byte) structure at the end of every table
//! file:
//!
//! ```text
//! [meta_index_handle: varint64 offset + varint64 size]
//! [index_handle:      varint64 offset + varint64 size]
//! [padding to 41 bytes]
//! [format_version: u32 little-endian]
//! [magic: u64 little-endian]
//! ```

use crate::error::{Error, Result};
use crate::splitter::{decode_varint, encode_varint};
use crate::sstable::{FOOTER_SIZE, FORMAT_VERSION, MAGIC_NUMBER};

/// Maximum encoded size of the two varint handle pairs, plus one pad byte.
const FOOTER_HANDLES_AREA: usize = 41;

/// BlockHandle locates a block within a file: offset and size of the
/// payload, excluding the 5-byte trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    /// Offset of the block in the file.
    pub offset: u64,
    /// Size of the block payload in bytes.
    pub size: u64,
}

impl BlockHandle {
    /// Create a new BlockHandle.
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Encode as two varint64s.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20);
        self.encode_to(&mut buf);
        buf
    }

    /// Append the encoding to an existing buffer.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        encode_varint(buf, self.offset);
        encode_varint(buf, self.size);
    }

    /// Decode a BlockHandle, returning it and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let (offset, n1) =
            decode_varint(data).ok_or_else(|| Error::corruption("bad block handle offset"))?;
        let (size, n2) = decode_varint(&data[n1..])
            .ok_or_else(|| Error::corruption("bad block handle size"))?;
        Ok((Self { offset, size }, n1 + n2))
    }
}

/// Footer is the last 53 bytes of a table file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    /// Handle to the meta-index block.
    pub meta_index_handle: BlockHandle,
    /// Handle to the primary index block.
    pub index_handle: BlockHandle,
    /// Table format version.
    pub format_version: u32,
}

impl Footer {
    /// Create a new Footer at the current format version.
    pub fn new(meta_index_handle: BlockHandle, index_handle: BlockHandle) -> Self {
        Self { meta_index_handle, index_handle, format_version: FORMAT_VERSION }
    }

    /// Encode the footer to its fixed 53-byte form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        self.meta_index_handle.encode_to(&mut buf);
        self.index_handle.encode_to(&mut buf);
        buf.resize(FOOTER_HANDLES_AREA, 0);
        buf.extend_from_slice(&self.format_version.to_le_bytes());
        buf.extend_from_slice(&MAGIC_NUMBER.to_le_bytes());
        debug_assert_eq!(buf.len(), FOOTER_SIZE);
        buf
    }

    /// Decode a footer from exactly 53 bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != FOOTER_SIZE {
            return Err(Error::corruption(format!(
                "footer size mismatch: expected {}, got {}",
                FOOTER_SIZE,
                data.len()
            )));
        }

        let magic = u64::from_le_bytes(data[45..53].try_into().unwrap());
        if magic != MAGIC_NUMBER {
            return Err(Error::corruption(format!(
                "not a stripekv table (bad magic {:#x})",
                magic
            )));
        }

        let format_version = u32::from_le_bytes(data[41..45].try_into().unwrap());
        if format_version != FORMAT_VERSION {
            return Err(Error::not_supported(format!(
                "table format version {} not supported",
                format_version
            )));
        }

        let (meta_index_handle, n) = BlockHandle::decode(&data[..FOOTER_HANDLES_AREA])?;
        let (index_handle, _) = BlockHandle::decode(&data[n..FOOTER_HANDLES_AREA])?;

        Ok(Self { meta_index_handle, index_handle, format_version })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_handle_encode_decode() {
        for (offset, size) in [(0u64, 0u64), (1234, 5678), (u64::MAX, 1), (1 << 40, 1 << 20)] {
            let handle = BlockHandle::new(offset, size);
            let encoded = handle.encode();
            let (decoded, n) = BlockHandle::decode(&encoded).unwrap();
            assert_eq!(decoded, handle);
            assert_eq!(n, encoded.len());
        }
    }

    #[test]
    fn test_footer_encode_decode() {
        let footer = Footer::new(BlockHandle::new(1000, 100), BlockHandle::new(2000, 200));

        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_SIZE);

        let decoded = Footer::decode(&encoded).unwrap();
        assert_eq!(decoded, footer);
    }

    #[test]
    fn test_footer_magic_number() {
        let footer = Footer::new(BlockHandle::new(0, 0), BlockHandle::new(0, 0));
        let encoded = footer.encode();

        let magic = u64::from_le_bytes(encoded[45..53].try_into().unwrap());
        assert_eq!(magic, MAGIC_NUMBER);
    }

    #[test]
    fn test_footer_invalid_magic() {
        let mut data = Footer::new(BlockHandle::new(1, 2), BlockHandle::new(3, 4)).encode();
        data[45..53].copy_from_slice(&0x1234_5678_90ab_cdefu64.to_le_bytes());

        let result = Footer::decode(&data);
        assert!(matches!(result.unwrap_err(), Error::Corruption(_)));
    }

    #[test]
    fn test_footer_unknown_version() {
        let mut data = Footer::new(BlockHandle::new(1, 2), BlockHandle::new(3, 4)).encode();
        data[41..45].copy_from_slice(&99u32.to_le_bytes());

        let result = Footer::decode(&data);
        assert!(matches!(result.unwrap_err(), Error::NotSupported(_)));
    }

    #[test]
    fn test_footer_large_handles_fit() {
        // Worst case: both handles at the varint64 maximum width
        let footer =
            Footer::new(BlockHandle::new(u64::MAX, u64::MAX), BlockHandle::new(u64::MAX, u64::MAX));
        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_SIZE);
        assert_eq!(Footer::decode(&encoded).unwrap(), footer);
    }
}
