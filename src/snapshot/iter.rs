use std::collections::VecDeque;

use crate::segment::{Direction, Row, ScanKey};

use super::{SnapshotError, SnapshotReader};

/// Tuning for [`SnapshotIter`].
#[derive(Debug, Clone, Copy)]
pub struct SnapshotIterOptions {
    /// Rows fetched per underlying range request.
    pub page_rows: usize,
}

impl Default for SnapshotIterOptions {
    fn default() -> Self {
        Self { page_rows: 256 }
    }
}

/// Buffered cursor over the whole segment set, walking from a start bound in
/// one direction without a preset limit.
///
/// Convenience wrapper over repeated `get_range` pages: each refill runs
/// against the segment set as published at that moment, so a scan that
/// straddles an `update_segments` call may observe the swap at a page
/// boundary. Use a single `get_range` when one consistent snapshot must
/// cover the entire scan.
pub struct SnapshotIter<'a> {
    reader: &'a SnapshotReader,
    direction: Direction,
    /// Next page bound: the scan resumes after the last buffered key.
    cursor: ScanKey,
    buffer: VecDeque<Row>,
    exhausted: bool,
    options: SnapshotIterOptions,
}

impl<'a> SnapshotIter<'a> {
    pub(super) fn new(
        reader: &'a SnapshotReader,
        start: ScanKey,
        direction: Direction,
        options: SnapshotIterOptions,
    ) -> Self {
        Self {
            reader,
            direction,
            cursor: start,
            buffer: VecDeque::new(),
            exhausted: false,
            options,
        }
    }

    /// Returns the next row, or `Ok(None)` once the keyspace is exhausted in
    /// the travel direction.
    pub fn next(&mut self) -> Result<Option<Row>, SnapshotError> {
        self.fill_buffer()?;
        Ok(self.buffer.pop_front())
    }

    /// Returns the next row without consuming it.
    pub fn peek(&mut self) -> Result<Option<Row>, SnapshotError> {
        self.fill_buffer()?;
        Ok(self.buffer.front().cloned())
    }

    fn fill_buffer(&mut self) -> Result<(), SnapshotError> {
        if !self.buffer.is_empty() || self.exhausted {
            return Ok(());
        }

        let page = self.options.page_rows.max(1);
        let rows = match self.direction {
            Direction::Ascending => {
                if self.cursor.cmp_bound(&ScanKey::End) != std::cmp::Ordering::Less {
                    self.exhausted = true;
                    return Ok(());
                }
                self.reader
                    .get_range(&self.cursor, &ScanKey::End, page, self.direction)?
            }
            Direction::Descending => {
                if ScanKey::Start.cmp_bound(&self.cursor) != std::cmp::Ordering::Less {
                    self.exhausted = true;
                    return Ok(());
                }
                self.reader
                    .get_range(&ScanKey::Start, &self.cursor, page, self.direction)?
            }
        };

        if rows.len() < page {
            // A short page means the range ran dry; no point asking again.
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.cursor = match self.direction {
                // Ascending range starts are inclusive, so resume from the
                // last key's immediate successor.
                Direction::Ascending => {
                    let mut successor = Vec::with_capacity(last.key.len() + 1);
                    successor.extend_from_slice(&last.key);
                    successor.push(0);
                    ScanKey::Key(successor.into())
                }
                // Descending range ends are exclusive already.
                Direction::Descending => ScanKey::Key(last.key.clone()),
            };
        }
        self.buffer.extend(rows);
        Ok(())
    }
}
