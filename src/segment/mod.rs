//! Segment file format.
//!
//! A segment is an immutable run of key/value records, written once and
//! published whole. Goals:
//! - Self-describing on-disk format with verifiable xxhash64 integrity.
//! - Aligned data blocks so lookups touch a minimal number of backing-store
//!   read units.
//! - Point lookups via an ordered block index (+ optional bloom filter).
//! - Bidirectional iteration via block streaming.
//!
//! File layout:
//! ```text
//! [data blocks..., each padded to the alignment unit]
//! [meta block]
//! [trailer: meta_offset u64 | meta_hash u64 | version u8]
//! ```
//!
//! Data block format (before compression/padding):
//! ```text
//! repeated:
//!   [key_len u16][val_len u32][key bytes][val bytes]
//! ```
//!
//! Meta block format:
//! ```text
//! [first_key_len u16][first_key]
//! [last_key_len u16][last_key]
//! [bloom presence u8]; if present: [filter_len u64][filter bytes]
//! [compression u8]
//! [block index kind u8]
//! [entry_count u64]
//! repeated entry_count times:
//!   [first_key_len u16][first_key][offset u64][block_len u64]
//!   [uncompressed_len u64][compressed_len u64][hash u64]
//! ```
//!
//! All integers are little-endian. The meta hash is xxhash64 over the meta
//! block bytes; each block hash is xxhash64 over the block's final on-disk
//! bytes including padding.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use bytes::Bytes;

mod block;
mod iter;
mod reader;
mod writer;

pub use iter::RowIter;
pub use reader::{ByteSource, DynSegmentReader, SegmentReader};
pub use writer::{BloomOptions, SegmentWriter, WriterOptions};

/// Keys carry a u16 length prefix.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;
/// Values carry a u32 length prefix.
pub const MAX_VALUE_LEN: usize = u32::MAX as usize;

pub const SEGMENT_VERSION: u8 = 1;
pub const TRAILER_LEN: u64 = 17;

pub const DEFAULT_BLOCK_THRESHOLD_BYTES: u64 = 3584;
pub const DEFAULT_BLOCK_ALIGN_BYTES: u64 = 4096;

/// [key_len u16][val_len u32]
pub(crate) const RECORD_HEADER_LEN: usize = 6;

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("io error during {0}: {1}")]
    Io(&'static str, #[source] std::io::Error),

    #[error("key must not be empty")]
    InvalidKey,

    #[error("key too large: {0} bytes, max {MAX_KEY_LEN}")]
    KeyTooLarge(usize),

    #[error("value too large: {0} bytes, max {MAX_VALUE_LEN}")]
    ValueTooLarge(usize),

    #[error("keys must be written in strictly ascending order")]
    OutOfOrderKey,

    #[error("segment writer is closed")]
    WriterClosed,

    #[error("segment closed with no rows written")]
    EmptySegment,

    #[error("unknown segment version: expected {expected} got {got}")]
    UnknownSegmentVersion { expected: u8, got: u8 },

    #[error("mismatched meta block hash: expected {expected} got {got}")]
    MismatchedMetaBlockHash { expected: u64, got: u64 },

    #[error("mismatched data block hash at offset {offset}: expected {expected} got {got}")]
    MismatchedBlockHash {
        offset: u64,
        expected: u64,
        got: u64,
    },

    #[error("invalid meta block: {0}")]
    InvalidMetaBlock(&'static str),

    #[error("corrupt data block: {0}")]
    CorruptBlock(&'static str),
}

/// One key/value record as materialized by readers and the merge scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: Bytes,
    pub value: Bytes,
}

impl Row {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// A seek/range bound. `Start` sorts below every key and `End` above every
/// key; keys are never empty, so the sentinels cannot collide with user data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanKey {
    Start,
    End,
    Key(Bytes),
}

impl ScanKey {
    pub fn key(key: impl Into<Bytes>) -> Self {
        ScanKey::Key(key.into())
    }

    /// Ordering of this bound relative to a concrete key.
    pub(crate) fn cmp_key(&self, key: &[u8]) -> Ordering {
        match self {
            ScanKey::Start => Ordering::Less,
            ScanKey::End => Ordering::Greater,
            ScanKey::Key(k) => k.as_ref().cmp(key),
        }
    }

    /// Ordering between two bounds.
    pub(crate) fn cmp_bound(&self, other: &ScanKey) -> Ordering {
        match (self, other) {
            (ScanKey::Start, ScanKey::Start) => Ordering::Equal,
            (ScanKey::Start, _) => Ordering::Less,
            (_, ScanKey::Start) => Ordering::Greater,
            (ScanKey::End, ScanKey::End) => Ordering::Equal,
            (ScanKey::End, _) => Ordering::Greater,
            (_, ScanKey::End) => Ordering::Less,
            (ScanKey::Key(a), ScanKey::Key(b)) => a.cmp(b),
        }
    }
}

/// Per-segment block compression. Encoded once in the meta block; every data
/// block in a segment uses the same codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionCodec {
    None,
    Zstd,
    Lz4,
}

impl CompressionCodec {
    fn as_byte(self) -> u8 {
        match self {
            CompressionCodec::None => 0,
            CompressionCodec::Zstd => 1,
            CompressionCodec::Lz4 => 2,
        }
    }

    fn from_byte(b: u8) -> Result<Self, SegmentError> {
        match b {
            0 => Ok(CompressionCodec::None),
            1 => Ok(CompressionCodec::Zstd),
            2 => Ok(CompressionCodec::Lz4),
            _ => Err(SegmentError::InvalidMetaBlock("unknown compression byte")),
        }
    }
}

const BLOOM_ABSENT: u8 = 0;
const BLOOM_PRESENT: u8 = 1;

const BLOCK_INDEX_SIMPLE: u8 = 0;

/// Per-block statistics. `offset` is the block's start offset in the file;
/// `block_len` is the final on-disk length including alignment padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStat {
    pub first_key: Bytes,
    pub offset: u64,
    pub block_len: u64,
    pub uncompressed_len: u64,
    /// 0 when the block is stored raw.
    pub compressed_len: u64,
    /// xxhash64 of the on-disk block bytes including padding.
    pub hash: u64,
}

/// Parsed contents of a segment's meta block.
///
/// The block index maps each block's first key to its stats; iteration order
/// is file order because keys are written strictly ascending.
pub struct SegmentMeta {
    pub first_key: Bytes,
    pub last_key: Bytes,
    pub compression: CompressionCodec,
    pub bloom: Option<bloomfilter::Bloom<Bytes>>,
    pub block_index: BTreeMap<Bytes, BlockStat>,
}

impl std::fmt::Debug for SegmentMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentMeta")
            .field("first_key", &self.first_key)
            .field("last_key", &self.last_key)
            .field("compression", &self.compression)
            .field("bloom", &self.bloom.is_some())
            .field("blocks", &self.block_index.len())
            .finish()
    }
}

impl SegmentMeta {
    /// Serializes the meta block exactly as described in the module docs.
    pub fn encode(&self) -> Result<Vec<u8>, SegmentError> {
        let mut buf = Vec::new();

        buf.extend_from_slice(&(self.first_key.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.first_key);
        buf.extend_from_slice(&(self.last_key.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.last_key);

        match &self.bloom {
            None => buf.push(BLOOM_ABSENT),
            Some(filter) => {
                buf.push(BLOOM_PRESENT);
                let raw = bincode::serialize(filter)
                    .map_err(|_| SegmentError::InvalidMetaBlock("bloom filter encode"))?;
                buf.extend_from_slice(&(raw.len() as u64).to_le_bytes());
                buf.extend_from_slice(&raw);
            }
        }

        buf.push(self.compression.as_byte());
        buf.push(BLOCK_INDEX_SIMPLE);

        buf.extend_from_slice(&(self.block_index.len() as u64).to_le_bytes());
        for stat in self.block_index.values() {
            buf.extend_from_slice(&(stat.first_key.len() as u16).to_le_bytes());
            buf.extend_from_slice(&stat.first_key);
            buf.extend_from_slice(&stat.offset.to_le_bytes());
            buf.extend_from_slice(&stat.block_len.to_le_bytes());
            buf.extend_from_slice(&stat.uncompressed_len.to_le_bytes());
            buf.extend_from_slice(&stat.compressed_len.to_le_bytes());
            buf.extend_from_slice(&stat.hash.to_le_bytes());
        }

        Ok(buf)
    }

    /// Parses meta block bytes, validating structure and index ordering.
    pub fn parse(bytes: &[u8]) -> Result<Self, SegmentError> {
        let mut cur = MetaCursor { buf: bytes, pos: 0 };

        let first_key_len = cur.read_u16()? as usize;
        let first_key = Bytes::copy_from_slice(cur.read_bytes(first_key_len)?);
        let last_key_len = cur.read_u16()? as usize;
        let last_key = Bytes::copy_from_slice(cur.read_bytes(last_key_len)?);
        if first_key.is_empty() || last_key.is_empty() {
            return Err(SegmentError::InvalidMetaBlock("empty segment bound key"));
        }

        let bloom = match cur.read_u8()? {
            BLOOM_ABSENT => None,
            BLOOM_PRESENT => {
                let filter_len = cur.read_u64()? as usize;
                let raw = cur.read_bytes(filter_len)?;
                let filter: bloomfilter::Bloom<Bytes> = bincode::deserialize(raw)
                    .map_err(|_| SegmentError::InvalidMetaBlock("bloom filter decode"))?;
                Some(filter)
            }
            _ => {
                return Err(SegmentError::InvalidMetaBlock(
                    "unsupported bloom filter kind",
                ))
            }
        };

        let compression = CompressionCodec::from_byte(cur.read_u8()?)?;

        if cur.read_u8()? != BLOCK_INDEX_SIMPLE {
            return Err(SegmentError::InvalidMetaBlock(
                "unsupported block index kind",
            ));
        }

        let entry_count = cur.read_u64()? as usize;
        if entry_count == 0 {
            return Err(SegmentError::InvalidMetaBlock("no block index entries"));
        }

        let mut block_index = BTreeMap::new();
        let mut prev_key: Option<Bytes> = None;
        for _ in 0..entry_count {
            let key_len = cur.read_u16()? as usize;
            let key = Bytes::copy_from_slice(cur.read_bytes(key_len)?);
            if key.is_empty() {
                return Err(SegmentError::InvalidMetaBlock("empty block first key"));
            }
            if let Some(prev) = &prev_key {
                if key <= *prev {
                    return Err(SegmentError::InvalidMetaBlock("block index out of order"));
                }
            }
            let stat = BlockStat {
                first_key: key.clone(),
                offset: cur.read_u64()?,
                block_len: cur.read_u64()?,
                uncompressed_len: cur.read_u64()?,
                compressed_len: cur.read_u64()?,
                hash: cur.read_u64()?,
            };
            prev_key = Some(key.clone());
            block_index.insert(key, stat);
        }

        if cur.pos != bytes.len() {
            return Err(SegmentError::InvalidMetaBlock("trailing bytes"));
        }

        Ok(Self {
            first_key,
            last_key,
            compression,
            bloom,
            block_index,
        })
    }
}

struct MetaCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MetaCursor<'a> {
    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], SegmentError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(SegmentError::InvalidMetaBlock("truncated"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, SegmentError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, SegmentError> {
        let raw = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn read_u64(&mut self) -> Result<u64, SegmentError> {
        let raw: [u8; 8] = self
            .read_bytes(8)?
            .try_into()
            .map_err(|_| SegmentError::InvalidMetaBlock("truncated"))?;
        Ok(u64::from_le_bytes(raw))
    }
}
