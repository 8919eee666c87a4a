//! Meta blocks: column layout, table properties, and min/max summaries.
//!
//! Every table file carries a meta-index block mapping block names to
//! handles, through which readers locate the column layout block, the
//! properties block, and the per-block min/max summary.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::splitter::{decode_varint, encode_varint};
use crate::sstable::block::{Block, BlockBuilder};
use crate::sstable::footer::BlockHandle;

/// Collects custom properties while a table is built.
///
/// Collectors observe every `(internal_key, value)` added to the main file
/// and contribute string properties to the properties block at finish.
/// Sub-column files never run collectors.
pub trait TablePropertiesCollector: Send {
    /// The collector's name, recorded in the properties block.
    fn name(&self) -> &'static str;

    /// Observe one added entry.
    fn add(&mut self, key: &[u8], value: &[u8]);

    /// Produce the collected properties.
    fn finish(&mut self) -> Vec<(String, String)>;
}

/// Column layout block: discriminates main files from sub files and, for
/// main files, records the sub-column file sizes.
///
/// Encoding: `main:u8 | column_count:u32le | sub_file_size:u64le * count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaColumnBlock {
    /// True for the main file, false for a sub-column file.
    pub main: bool,
    /// Number of sub-column files in the table.
    pub column_count: u32,
    /// Byte size of each sub-column file (main files only).
    pub sub_file_sizes: Vec<u64>,
}

impl MetaColumnBlock {
    /// Encode to the block payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.sub_file_sizes.len() * 8);
        buf.push(self.main as u8);
        buf.extend_from_slice(&self.column_count.to_le_bytes());
        for size in &self.sub_file_sizes {
            buf.extend_from_slice(&size.to_le_bytes());
        }
        buf
    }

    /// Decode from a block payload.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 5 {
            return Err(Error::corruption("meta-column block too small"));
        }
        let main = data[0] != 0;
        let column_count = u32::from_le_bytes(data[1..5].try_into().unwrap());
        let mut sub_file_sizes = Vec::new();
        if main {
            let expected = 5 + column_count as usize * 8;
            if data.len() < expected {
                return Err(Error::corruption("meta-column block truncated"));
            }
            for i in 0..column_count as usize {
                let off = 5 + i * 8;
                sub_file_sizes
                    .push(u64::from_le_bytes(data[off..off + 8].try_into().unwrap()));
            }
        }
        Ok(Self { main, column_count, sub_file_sizes })
    }
}

/// Table-wide properties persisted in every file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableProperties {
    /// Persisted name of the comparator the keys were sorted with.
    pub comparator_name: String,
    /// Persisted name of the splitter (main file only; empty for subs).
    pub splitter_name: String,
    /// Name of the compression codec requested for this table.
    pub compression_name: String,
    /// Number of entries.
    pub num_entries: u64,
    /// Total uncompressed key bytes.
    pub raw_key_size: u64,
    /// Total uncompressed value bytes.
    pub raw_value_size: u64,
    /// Number of data blocks.
    pub num_data_blocks: u64,
    /// Byte size of the data area (blocks + trailers).
    pub data_size: u64,
    /// Byte size of the index block.
    pub index_size: u64,
    /// Owning column family id.
    pub column_family_id: u32,
    /// Owning column family name.
    pub column_family_name: String,
    /// Names of the property collectors that ran (main file only).
    pub property_collectors_names: String,
    /// Properties contributed by user collectors.
    pub user_collected: BTreeMap<String, String>,
}

const PROP_COMPARATOR: &str = "stripekv.comparator";
const PROP_SPLITTER: &str = "stripekv.splitter";
const PROP_COMPRESSION: &str = "stripekv.compression";
const PROP_NUM_ENTRIES: &str = "stripekv.num.entries";
const PROP_RAW_KEY_SIZE: &str = "stripekv.raw.key.size";
const PROP_RAW_VALUE_SIZE: &str = "stripekv.raw.value.size";
const PROP_NUM_DATA_BLOCKS: &str = "stripekv.num.data.blocks";
const PROP_DATA_SIZE: &str = "stripekv.data.size";
const PROP_INDEX_SIZE: &str = "stripekv.index.size";
const PROP_CF_ID: &str = "stripekv.column.family.id";
const PROP_CF_NAME: &str = "stripekv.column.family.name";
const PROP_COLLECTORS: &str = "stripekv.property.collectors";

impl TableProperties {
    /// Encode into a restart-interval-1 key/value block payload.
    pub fn encode(&self) -> Bytes {
        // Block entries must be added in key order; a BTreeMap does the
        // sorting across the fixed and user-collected properties.
        let mut props: BTreeMap<&str, Vec<u8>> = BTreeMap::new();
        props.insert(PROP_COMPARATOR, self.comparator_name.clone().into_bytes());
        props.insert(PROP_SPLITTER, self.splitter_name.clone().into_bytes());
        props.insert(PROP_COMPRESSION, self.compression_name.clone().into_bytes());
        props.insert(PROP_NUM_ENTRIES, varint_value(self.num_entries));
        props.insert(PROP_RAW_KEY_SIZE, varint_value(self.raw_key_size));
        props.insert(PROP_RAW_VALUE_SIZE, varint_value(self.raw_value_size));
        props.insert(PROP_NUM_DATA_BLOCKS, varint_value(self.num_data_blocks));
        props.insert(PROP_DATA_SIZE, varint_value(self.data_size));
        props.insert(PROP_INDEX_SIZE, varint_value(self.index_size));
        props.insert(PROP_CF_ID, varint_value(self.column_family_id as u64));
        props.insert(PROP_CF_NAME, self.column_family_name.clone().into_bytes());
        props.insert(PROP_COLLECTORS, self.property_collectors_names.clone().into_bytes());
        for (k, v) in &self.user_collected {
            props.insert(k.as_str(), v.clone().into_bytes());
        }

        let mut builder = BlockBuilder::new(1);
        for (k, v) in &props {
            builder.add(k.as_bytes(), v);
        }
        builder.finish()
    }

    /// Decode from a properties block payload.
    pub fn decode(data: Bytes) -> Result<Self> {
        let block = Block::new(data)?;
        let mut props = TableProperties::default();
        let mut iter = block.iter();
        iter.seek_to_first();
        while iter.valid() {
            let key = String::from_utf8_lossy(iter.key()).into_owned();
            let value = iter.value();
            match key.as_str() {
                PROP_COMPARATOR => props.comparator_name = string_value(value),
                PROP_SPLITTER => props.splitter_name = string_value(value),
                PROP_COMPRESSION => props.compression_name = string_value(value),
                PROP_NUM_ENTRIES => props.num_entries = numeric_value(value, &key)?,
                PROP_RAW_KEY_SIZE => props.raw_key_size = numeric_value(value, &key)?,
                PROP_RAW_VALUE_SIZE => props.raw_value_size = numeric_value(value, &key)?,
                PROP_NUM_DATA_BLOCKS => props.num_data_blocks = numeric_value(value, &key)?,
                PROP_DATA_SIZE => props.data_size = numeric_value(value, &key)?,
                PROP_INDEX_SIZE => props.index_size = numeric_value(value, &key)?,
                PROP_CF_ID => props.column_family_id = numeric_value(value, &key)? as u32,
                PROP_CF_NAME => props.column_family_name = string_value(value),
                PROP_COLLECTORS => props.property_collectors_names = string_value(value),
                _ => {
                    props.user_collected.insert(key, string_value(value));
                }
            }
            iter.advance();
        }
        Ok(props)
    }
}

fn varint_value(v: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    encode_varint(&mut buf, v);
    buf
}

fn string_value(v: &[u8]) -> String {
    String::from_utf8_lossy(v).into_owned()
}

fn numeric_value(v: &[u8], key: &str) -> Result<u64> {
    decode_varint(v)
        .map(|(n, _)| n)
        .ok_or_else(|| Error::corruption(format!("bad numeric property {}", key)))
}

/// Per-data-block summary used for block-level predicate skipping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    /// Row ordinal of the block's first entry.
    pub first_ordinal: u64,
    /// Smallest key (main file: user key; sub file: column value).
    pub min: Vec<u8>,
    /// Largest key (main file: user key; sub file: column value).
    pub max: Vec<u8>,
}

/// Accumulates one [`BlockSummary`] per finished data block.
#[derive(Debug, Default)]
pub struct MinMaxBlockBuilder {
    summaries: Vec<BlockSummary>,
}

impl MinMaxBlockBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the summary of a finished data block.
    pub fn add(&mut self, first_ordinal: u64, min: Vec<u8>, max: Vec<u8>) {
        self.summaries.push(BlockSummary { first_ordinal, min, max });
    }

    /// Encode to the summary block payload.
    pub fn finish(self) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_varint(&mut buf, self.summaries.len() as u64);
        for s in &self.summaries {
            encode_varint(&mut buf, s.first_ordinal);
            encode_varint(&mut buf, s.min.len() as u64);
            buf.extend_from_slice(&s.min);
            encode_varint(&mut buf, s.max.len() as u64);
            buf.extend_from_slice(&s.max);
        }
        buf
    }
}

/// Decode a summary block payload.
pub fn decode_minmax_block(data: &[u8]) -> Result<Vec<BlockSummary>> {
    let corrupt = || Error::corruption("bad min/max summary block");
    let (count, mut pos) = decode_varint(data).ok_or_else(corrupt)?;
    let mut summaries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (first_ordinal, n) = decode_varint(&data[pos..]).ok_or_else(corrupt)?;
        pos += n;
        let (min_len, n) = decode_varint(&data[pos..]).ok_or_else(corrupt)?;
        pos += n;
        if data.len() < pos + min_len as usize {
            return Err(corrupt());
        }
        let min = data[pos..pos + min_len as usize].to_vec();
        pos += min_len as usize;
        let (max_len, n) = decode_varint(&data[pos..]).ok_or_else(corrupt)?;
        pos += n;
        if data.len() < pos + max_len as usize {
            return Err(corrupt());
        }
        let max = data[pos..pos + max_len as usize].to_vec();
        pos += max_len as usize;
        summaries.push(BlockSummary { first_ordinal, min, max });
    }
    Ok(summaries)
}

/// Builds the meta-index block: block name -> block handle.
#[derive(Debug, Default)]
pub struct MetaIndexBuilder {
    entries: BTreeMap<Vec<u8>, BlockHandle>,
}

impl MetaIndexBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named meta block.
    pub fn add(&mut self, name: &[u8], handle: BlockHandle) {
        self.entries.insert(name.to_vec(), handle);
    }

    /// Encode to the meta-index payload.
    pub fn finish(self) -> Bytes {
        let mut builder = BlockBuilder::new(1);
        for (name, handle) in &self.entries {
            builder.add(name, &handle.encode());
        }
        builder.finish()
    }
}

/// Decode a meta-index payload into a name -> handle map.
pub fn decode_meta_index(data: Bytes) -> Result<BTreeMap<Vec<u8>, BlockHandle>> {
    let block = Block::new(data)?;
    let mut map = BTreeMap::new();
    let mut iter = block.iter();
    iter.seek_to_first();
    while iter.valid() {
        let (handle, _) = BlockHandle::decode(iter.value())
            .map_err(|_| Error::corruption("bad handle in meta-index"))?;
        map.insert(iter.key().to_vec(), handle);
        iter.advance();
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_column_block_main() {
        let block = MetaColumnBlock {
            main: true,
            column_count: 3,
            sub_file_sizes: vec![100, 200, 300],
        };
        let decoded = MetaColumnBlock::decode(&block.encode()).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_meta_column_block_sub() {
        // Sub files omit the size list
        let block = MetaColumnBlock { main: false, column_count: 3, sub_file_sizes: vec![] };
        let encoded = block.encode();
        assert_eq!(encoded.len(), 5);
        assert_eq!(MetaColumnBlock::decode(&encoded).unwrap(), block);
    }

    #[test]
    fn test_properties_round_trip() {
        let mut props = TableProperties {
            comparator_name: "stripekv.BytewiseComparator".to_string(),
            splitter_name: "stripekv.PipeSplitter".to_string(),
            compression_name: "Snappy".to_string(),
            num_entries: 12345,
            raw_key_size: 99999,
            raw_value_size: 1 << 40,
            num_data_blocks: 42,
            data_size: 4096,
            index_size: 128,
            column_family_id: 7,
            column_family_name: "default".to_string(),
            property_collectors_names: "[]".to_string(),
            user_collected: BTreeMap::new(),
        };
        props.user_collected.insert("app.rows".to_string(), "77".to_string());

        let decoded = TableProperties::decode(props.encode()).unwrap();
        assert_eq!(decoded, props);
    }

    #[test]
    fn test_minmax_round_trip() {
        let mut builder = MinMaxBlockBuilder::new();
        builder.add(0, b"aaa".to_vec(), b"mmm".to_vec());
        builder.add(57, b"nnn".to_vec(), b"zzz".to_vec());

        let summaries = decode_minmax_block(&builder.finish()).unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].first_ordinal, 0);
        assert_eq!(summaries[0].min, b"aaa");
        assert_eq!(summaries[1].first_ordinal, 57);
        assert_eq!(summaries[1].max, b"zzz");
    }

    #[test]
    fn test_meta_index_round_trip() {
        let mut builder = MetaIndexBuilder::new();
        builder.add(b"stripekv.properties", BlockHandle::new(10, 20));
        builder.add(b"stripekv.columns", BlockHandle::new(0, 10));

        let map = decode_meta_index(builder.finish()).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[b"stripekv.columns".as_ref()], BlockHandle::new(0, 10));
        assert_eq!(map[b"stripekv.properties".as_ref()], BlockHandle::new(10, 20));
    }
}
