use std::io::{Read, Seek};
use std::ops::Bound;

use bytes::Bytes;

use super::{BlockStat, Direction, Row, ScanKey, SegmentError, SegmentReader};

/// Bidirectional cursor over one segment.
///
/// Blocks load one at a time; in descending mode a block's rows are reversed
/// on load so `next` always walks forward through the buffered rows. The
/// iterator owns its reader, so dropping it releases the byte source.
pub struct RowIter<R: Read + Seek> {
    reader: SegmentReader<R>,
    direction: Direction,
    rows: Vec<Row>,
    row_idx: usize,
    /// First key of the block the rows were loaded from; the next block in
    /// the travel direction is found relative to this.
    block_key: Option<Bytes>,
}

impl<R: Read + Seek> RowIter<R> {
    pub(crate) fn new(reader: SegmentReader<R>, direction: Direction) -> Self {
        Self {
            reader,
            direction,
            rows: Vec::new(),
            row_idx: 0,
            block_key: None,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Gives the underlying reader back, e.g. to reuse its cached metadata.
    pub fn into_reader(self) -> SegmentReader<R> {
        self.reader
    }

    /// Returns the next row in the travel direction, or `Ok(None)` at the
    /// end of the segment. EOF is stable: later calls keep returning
    /// `Ok(None)`.
    pub fn next(&mut self) -> Result<Option<Row>, SegmentError> {
        if self.row_idx < self.rows.len() {
            let row = self.rows[self.row_idx].clone();
            self.row_idx += 1;
            return Ok(Some(row));
        }

        let meta = self.reader.metadata()?;
        let next_stat: Option<BlockStat> = match (self.direction, &self.block_key) {
            (Direction::Ascending, None) => meta.block_index.values().next().cloned(),
            (Direction::Ascending, Some(key)) => meta
                .block_index
                .range::<[u8], _>((Bound::Excluded(key.as_ref()), Bound::Unbounded))
                .next()
                .map(|(_, stat)| stat.clone()),
            (Direction::Descending, None) => meta.block_index.values().next_back().cloned(),
            (Direction::Descending, Some(key)) => meta
                .block_index
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key.as_ref())))
                .next_back()
                .map(|(_, stat)| stat.clone()),
        };

        let Some(stat) = next_stat else {
            return Ok(None);
        };
        self.load_block(&stat)?;
        if self.rows.is_empty() {
            return Err(SegmentError::CorruptBlock("data block with no rows"));
        }
        self.row_idx = 1;
        Ok(Some(self.rows[0].clone()))
    }

    fn load_block(&mut self, stat: &BlockStat) -> Result<(), SegmentError> {
        let mut rows = self.reader.read_block(stat)?;
        if self.direction == Direction::Descending {
            rows.reverse();
        }
        self.rows = rows;
        self.row_idx = 0;
        self.block_key = Some(stat.first_key.clone());
        Ok(())
    }

    /// Positions the cursor so the next `next` call returns the first key in
    /// travel order that is `>= target` (ascending) or `<= target`
    /// (descending), or EOF when no such key exists.
    ///
    /// `ScanKey::Start` descending and `ScanKey::End` ascending are
    /// positions past the data in the travel direction: immediate EOF.
    pub fn seek(&mut self, target: &ScanKey) -> Result<(), SegmentError> {
        let meta = self.reader.metadata()?;

        let edge_block = |back: bool| -> Result<BlockStat, SegmentError> {
            let stat = if back {
                meta.block_index.values().next_back()
            } else {
                meta.block_index.values().next()
            };
            stat.cloned()
                .ok_or(SegmentError::InvalidMetaBlock("no block index entries"))
        };

        // Seeking past the data in the travel direction parks the cursor at
        // EOF: there is no block beyond the edge one, so `next` stops.
        match (target, self.direction) {
            (ScanKey::End, Direction::Ascending) => {
                let stat = edge_block(true)?;
                self.rows.clear();
                self.row_idx = 0;
                self.block_key = Some(stat.first_key);
                return Ok(());
            }
            (ScanKey::Start, Direction::Descending) => {
                let stat = edge_block(false)?;
                self.rows.clear();
                self.row_idx = 0;
                self.block_key = Some(stat.first_key);
                return Ok(());
            }
            _ => {}
        }

        let candidate = match target {
            ScanKey::Start => Some(edge_block(false)?),
            ScanKey::End => Some(edge_block(true)?),
            ScanKey::Key(key) => meta
                .block_index
                .range::<[u8], _>((Bound::Unbounded, Bound::Included(key.as_ref())))
                .next_back()
                .map(|(_, stat)| stat.clone()),
        };

        // The probe sits below every block's first key. Ascending, the
        // segment's first block holds the first qualifying row; descending,
        // walking down from the last block finds nothing <= target and lands
        // on EOF.
        let stat = match candidate {
            Some(stat) => stat,
            None => match self.direction {
                Direction::Ascending => edge_block(false)?,
                Direction::Descending => edge_block(true)?,
            },
        };

        self.load_block(&stat)?;
        loop {
            let Some(row) = self.next()? else {
                return Ok(());
            };
            let found = match self.direction {
                Direction::Ascending => target.cmp_key(&row.key) != std::cmp::Ordering::Greater,
                Direction::Descending => target.cmp_key(&row.key) != std::cmp::Ordering::Less,
            };
            if found {
                self.row_idx -= 1;
                return Ok(());
            }
        }
    }
}
