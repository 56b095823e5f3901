use std::io::{Read, Seek, SeekFrom};
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use xxhash_rust::xxh64::xxh64;

use super::{block, BlockStat, Direction, Row, RowIter, SegmentError, SegmentMeta, TRAILER_LEN};

/// A seekable byte source a segment can be read from: a local file, an
/// in-memory buffer, or an adapter over a ranged object-store download.
pub trait ByteSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> ByteSource for T {}

/// The reader shape produced by a snapshot reader factory.
pub type DynSegmentReader = SegmentReader<Box<dyn ByteSource>>;

/// Reads one immutable segment.
///
/// Metadata loads lazily from the trailer on first use, or can be supplied
/// up front: from a shared cache via [`SegmentReader::with_meta`], or by
/// parsing the bytes a writer just returned with [`SegmentMeta::parse`].
///
/// Not thread safe; each concurrent lookup needs its own reader.
pub struct SegmentReader<R: Read + Seek> {
    source: R,
    file_len: u64,
    meta: Option<Arc<SegmentMeta>>,
}

impl SegmentReader<std::io::BufReader<std::fs::File>> {
    /// Opens a segment file, taking the byte length from file metadata.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SegmentError> {
        let file = std::fs::File::open(path.as_ref())
            .map_err(|e| SegmentError::Io("open segment file", e))?;
        let file_len = file
            .metadata()
            .map_err(|e| SegmentError::Io("stat segment file", e))?
            .len();
        Ok(Self::new(std::io::BufReader::new(file), file_len))
    }
}

impl<R: Read + Seek> SegmentReader<R> {
    pub fn new(source: R, file_len: u64) -> Self {
        Self {
            source,
            file_len,
            meta: None,
        }
    }

    /// Attaches already-parsed metadata, skipping the trailer fetch.
    pub fn with_meta(mut self, meta: Arc<SegmentMeta>) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Erases the source type so heterogeneous readers can flow through one
    /// factory signature.
    pub fn into_dyn(self) -> DynSegmentReader
    where
        R: Send + 'static,
    {
        SegmentReader {
            source: Box::new(self.source) as Box<dyn ByteSource>,
            file_len: self.file_len,
            meta: self.meta,
        }
    }

    /// Returns the segment metadata, fetching and verifying it from the
    /// source on first call.
    pub fn metadata(&mut self) -> Result<Arc<SegmentMeta>, SegmentError> {
        if let Some(meta) = &self.meta {
            return Ok(meta.clone());
        }
        let meta = Arc::new(self.fetch_metadata()?);
        self.meta = Some(meta.clone());
        Ok(meta)
    }

    fn fetch_metadata(&mut self) -> Result<SegmentMeta, SegmentError> {
        if self.file_len < TRAILER_LEN {
            return Err(SegmentError::InvalidMetaBlock("file shorter than trailer"));
        }

        let mut trailer = [0u8; TRAILER_LEN as usize];
        self.source
            .seek(SeekFrom::End(-(TRAILER_LEN as i64)))
            .map_err(|e| SegmentError::Io("seek to trailer", e))?;
        self.source
            .read_exact(&mut trailer)
            .map_err(|e| SegmentError::Io("read trailer", e))?;

        let version = trailer[16];
        if version != super::SEGMENT_VERSION {
            return Err(SegmentError::UnknownSegmentVersion {
                expected: super::SEGMENT_VERSION,
                got: version,
            });
        }

        let meta_offset = u64::from_le_bytes(
            trailer[0..8]
                .try_into()
                .map_err(|_| SegmentError::InvalidMetaBlock("truncated trailer"))?,
        );
        let meta_hash = u64::from_le_bytes(
            trailer[8..16]
                .try_into()
                .map_err(|_| SegmentError::InvalidMetaBlock("truncated trailer"))?,
        );

        let meta_len = self
            .file_len
            .checked_sub(TRAILER_LEN)
            .and_then(|end| end.checked_sub(meta_offset))
            .ok_or(SegmentError::InvalidMetaBlock("meta offset out of bounds"))?;

        let mut meta_bytes = vec![0u8; meta_len as usize];
        self.source
            .seek(SeekFrom::Start(meta_offset))
            .map_err(|e| SegmentError::Io("seek to meta block", e))?;
        self.source
            .read_exact(&mut meta_bytes)
            .map_err(|e| SegmentError::Io("read meta block", e))?;

        let got = xxh64(&meta_bytes, 0);
        if got != meta_hash {
            return Err(SegmentError::MismatchedMetaBlockHash {
                expected: meta_hash,
                got,
            });
        }

        SegmentMeta::parse(&meta_bytes)
    }

    /// Reads, verifies, and decodes one data block.
    pub fn read_block(&mut self, stat: &BlockStat) -> Result<Vec<Row>, SegmentError> {
        let meta = self.metadata()?;

        let mut buf = vec![0u8; stat.block_len as usize];
        self.source
            .seek(SeekFrom::Start(stat.offset))
            .map_err(|e| SegmentError::Io("seek to data block", e))?;
        self.source
            .read_exact(&mut buf)
            .map_err(|e| SegmentError::Io("read data block", e))?;

        let got = xxh64(&buf, 0);
        if got != stat.hash {
            return Err(SegmentError::MismatchedBlockHash {
                offset: stat.offset,
                expected: stat.hash,
                got,
            });
        }

        block::decode(stat, meta.compression, &buf)
    }

    /// Point lookup. `Ok(None)` when the key is not in this segment.
    pub fn get_row(&mut self, key: &[u8]) -> Result<Option<Bytes>, SegmentError> {
        let meta = self.metadata()?;

        if let Some(filter) = &meta.bloom {
            if !filter.check(&Bytes::copy_from_slice(key)) {
                return Ok(None);
            }
        }

        // The candidate is the last block whose first key is <= the probe.
        let Some(stat) = meta
            .block_index
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(_, stat)| stat.clone())
        else {
            return Ok(None);
        };

        let rows = self.read_block(&stat)?;
        Ok(rows
            .into_iter()
            .find(|row| row.key.as_ref() == key)
            .map(|row| row.value))
    }

    /// Segment-local range fetch over `[start, end)`. Utility surface; the
    /// snapshot reader composes row iterators instead.
    pub fn get_range(&mut self, start: &[u8], end: &[u8]) -> Result<Vec<Row>, SegmentError> {
        if start >= end {
            return Ok(Vec::new());
        }
        let meta = self.metadata()?;

        let mut stats: Vec<BlockStat> = Vec::new();
        // A block spans from its first key up to the next block's first key,
        // so the block at or before `start` may still hold in-range rows.
        if let Some((_, stat)) = meta
            .block_index
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(start)))
            .next_back()
        {
            stats.push(stat.clone());
        }
        for (_, stat) in meta
            .block_index
            .range::<[u8], _>((Bound::Excluded(start), Bound::Excluded(end)))
        {
            stats.push(stat.clone());
        }

        let mut rows = Vec::new();
        for stat in stats {
            for row in self.read_block(&stat)? {
                if row.key.as_ref() >= start && row.key.as_ref() < end {
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }

    /// Turns this reader into a bidirectional cursor over the segment.
    pub fn row_iter(self, direction: Direction) -> RowIter<R> {
        RowIter::new(self, direction)
    }
}
