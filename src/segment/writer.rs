use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use bytes::Bytes;
use xxhash_rust::xxh64::xxh64;

use super::block::{pad_to_alignment, BlockEncoder};
use super::{
    BlockStat, CompressionCodec, SegmentError, SegmentMeta, DEFAULT_BLOCK_ALIGN_BYTES,
    DEFAULT_BLOCK_THRESHOLD_BYTES, MAX_KEY_LEN, MAX_VALUE_LEN, SEGMENT_VERSION,
};

pub(crate) const BLOOM_SEED: [u8; 32] = *b"segkv.segment.bloom.filter.seed!";

/// Bloom filter sizing for a segment's point keys.
#[derive(Debug, Clone, Copy)]
pub struct BloomOptions {
    pub items: usize,
    pub false_positive_rate: f64,
}

impl Default for BloomOptions {
    fn default() -> Self {
        Self {
            items: 100_000,
            false_positive_rate: 1e-6,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    pub compression: CompressionCodec,
    /// Only consulted when `compression` is zstd.
    pub zstd_level: i32,
    /// A block is flushed once its encoded record bytes reach this size.
    pub block_threshold_bytes: u64,
    /// On-disk blocks are zero-padded to a multiple of this unit.
    pub block_align_bytes: u64,
    /// `None` disables the bloom filter.
    pub bloom: Option<BloomOptions>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            compression: CompressionCodec::None,
            zstd_level: 1,
            block_threshold_bytes: DEFAULT_BLOCK_THRESHOLD_BYTES,
            block_align_bytes: DEFAULT_BLOCK_ALIGN_BYTES,
            bloom: Some(BloomOptions::default()),
        }
    }
}

/// Streams strictly ascending key/value rows into a segment.
///
/// A writer can never be reused and is not thread safe. Any error poisons
/// the writer: every later call fails `WriterClosed` and the caller must
/// discard the partially written sink.
pub struct SegmentWriter<W: Write> {
    sink: W,
    options: WriterOptions,

    block: Option<BlockEncoder>,
    block_first_key: Option<Bytes>,

    /// Where the next block lands in the file.
    offset: u64,
    index: Vec<BlockStat>,
    first_key: Option<Bytes>,
    last_key: Option<Bytes>,
    bloom: Option<bloomfilter::Bloom<Bytes>>,

    poisoned: bool,
}

impl SegmentWriter<std::io::BufWriter<std::fs::File>> {
    /// Creates a segment file at `path`, truncating any existing file.
    pub fn create(path: impl AsRef<Path>, options: WriterOptions) -> Result<Self, SegmentError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|e| SegmentError::Io("create segment file", e))?;
        Ok(Self::new(std::io::BufWriter::new(file), options))
    }
}

impl<W: Write> SegmentWriter<W> {
    pub fn new(sink: W, options: WriterOptions) -> Self {
        let bloom = options.bloom.map(|opts| {
            bloomfilter::Bloom::new_for_fp_rate_with_seed(
                opts.items.max(1),
                opts.false_positive_rate,
                &BLOOM_SEED,
            )
        });
        Self {
            sink,
            options,
            block: None,
            block_first_key: None,
            offset: 0,
            index: Vec::new(),
            first_key: None,
            last_key: None,
            bloom,
            poisoned: false,
        }
    }

    /// Appends one row. Keys must arrive in strictly ascending order.
    pub fn write_row(&mut self, key: &[u8], value: &[u8]) -> Result<(), SegmentError> {
        if self.poisoned {
            return Err(SegmentError::WriterClosed);
        }
        match self.write_row_inner(key, value) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    fn write_row_inner(&mut self, key: &[u8], value: &[u8]) -> Result<(), SegmentError> {
        if key.is_empty() {
            return Err(SegmentError::InvalidKey);
        }
        if key.len() > MAX_KEY_LEN {
            return Err(SegmentError::KeyTooLarge(key.len()));
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(SegmentError::ValueTooLarge(value.len()));
        }
        if let Some(last) = &self.last_key {
            if key <= last.as_ref() {
                return Err(SegmentError::OutOfOrderKey);
            }
        }

        let key_bytes = Bytes::copy_from_slice(key);
        if self.block.is_none() {
            self.block = Some(BlockEncoder::new(
                self.options.compression,
                self.options.zstd_level,
            )?);
            self.block_first_key = Some(key_bytes.clone());
        }
        if self.first_key.is_none() {
            self.first_key = Some(key_bytes.clone());
        }
        self.last_key = Some(key_bytes.clone());

        let Some(block) = self.block.as_mut() else {
            return Err(SegmentError::CorruptBlock("missing block encoder"));
        };
        block.push_row(key, value)?;

        if let Some(filter) = &mut self.bloom {
            filter.set(&key_bytes);
        }

        if block.uncompressed_len() >= self.options.block_threshold_bytes {
            self.flush_block()?;
        }

        Ok(())
    }

    fn flush_block(&mut self) -> Result<(), SegmentError> {
        let Some(block) = self.block.take() else {
            return Ok(());
        };
        let first_key = self
            .block_first_key
            .take()
            .ok_or(SegmentError::CorruptBlock("block without first key"))?;

        let uncompressed_len = block.uncompressed_len();
        let (mut payload, compressed_len) = block.finish()?;
        pad_to_alignment(&mut payload, self.options.block_align_bytes);
        let hash = xxh64(&payload, 0);

        self.sink
            .write_all(&payload)
            .map_err(|e| SegmentError::Io("write data block", e))?;

        self.index.push(BlockStat {
            first_key,
            offset: self.offset,
            block_len: payload.len() as u64,
            uncompressed_len,
            compressed_len,
            hash,
        });
        self.offset += payload.len() as u64;
        Ok(())
    }

    /// Flushes the open block, writes the meta block and trailer, and
    /// returns `(total_file_len, meta_block_bytes)`. The meta bytes can be
    /// handed straight to `SegmentMeta::parse` and cached so later readers
    /// skip the trailer fetch.
    pub fn finish(mut self) -> Result<(u64, Vec<u8>), SegmentError> {
        if self.poisoned {
            return Err(SegmentError::WriterClosed);
        }
        self.finish_inner()
    }

    fn finish_inner(&mut self) -> Result<(u64, Vec<u8>), SegmentError> {
        self.flush_block()?;
        if self.index.is_empty() {
            return Err(SegmentError::EmptySegment);
        }

        let (Some(first_key), Some(last_key)) = (self.first_key.take(), self.last_key.take())
        else {
            return Err(SegmentError::EmptySegment);
        };

        let mut block_index = BTreeMap::new();
        for stat in self.index.drain(..) {
            block_index.insert(stat.first_key.clone(), stat);
        }

        let meta = SegmentMeta {
            first_key,
            last_key,
            compression: self.options.compression,
            bloom: self.bloom.take(),
            block_index,
        };
        let meta_bytes = meta.encode()?;

        let meta_offset = self.offset;
        self.sink
            .write_all(&meta_bytes)
            .map_err(|e| SegmentError::Io("write meta block", e))?;

        let mut trailer = [0u8; 17];
        trailer[0..8].copy_from_slice(&meta_offset.to_le_bytes());
        trailer[8..16].copy_from_slice(&xxh64(&meta_bytes, 0).to_le_bytes());
        trailer[16] = SEGMENT_VERSION;
        self.sink
            .write_all(&trailer)
            .map_err(|e| SegmentError::Io("write trailer", e))?;
        self.sink
            .flush()
            .map_err(|e| SegmentError::Io("flush segment sink", e))?;

        let total = meta_offset + meta_bytes.len() as u64 + trailer.len() as u64;
        Ok((total, meta_bytes))
    }
}
