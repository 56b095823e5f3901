//! K-way merge scan across segment row iterators.
//!
//! One cursor per candidate segment, candidates pre-sorted by precedence.
//! Each step finds the cursors tied on the front key for the scan direction,
//! emits the highest-precedence one (unless it is a level-0 tombstone), and
//! advances every tied cursor together so duplicate keys are consumed in the
//! same step they are resolved. Tied cursors advance in one parallel pass
//! that completes before the next step begins; a cursor whose iterator hits
//! EOF is exhausted and drops out of front-set computation.

use std::cmp::Ordering;

use rayon::prelude::*;

use crate::segment::{ByteSource, Direction, Row, RowIter, ScanKey, SegmentError};

use super::{ReaderFactory, SegmentRecord, SnapshotError};

struct Cursor {
    iter: RowIter<Box<dyn ByteSource>>,
    row: Option<Row>,
}

pub(super) fn scan(
    factory: &ReaderFactory,
    candidates: &[SegmentRecord],
    start: &ScanKey,
    end: &ScanKey,
    limit: usize,
    direction: Direction,
) -> Result<Vec<Row>, SnapshotError> {
    // Ascending scans enter the range at `start`; descending scans at `end`
    // (the bound itself is excluded below).
    let seek_to = match direction {
        Direction::Ascending => start,
        Direction::Descending => end,
    };

    let mut cursors: Vec<Cursor> = candidates
        .par_iter()
        .map(|record| -> Result<Cursor, SnapshotError> {
            let reader =
                (factory)(record).map_err(|e| SnapshotError::segment(&record.id, e))?;
            let mut iter = reader.row_iter(direction);
            iter.seek(seek_to)
                .map_err(|e| SnapshotError::segment(&record.id, e))?;
            let row = iter
                .next()
                .map_err(|e| SnapshotError::segment(&record.id, e))?;
            Ok(Cursor { iter, row })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut rows = Vec::with_capacity(limit.min(1024));
    loop {
        let front = front_indexes(&cursors, direction);
        let Some(&lead) = front.first() else {
            // Every cursor is exhausted.
            break;
        };
        let Some(front_row) = cursors[lead].row.clone() else {
            break;
        };

        // A level-0 empty value deletes the key: skip it and every older
        // copy underneath in the same step.
        if candidates[lead].level == 0 && front_row.value.is_empty() {
            advance(&mut cursors, &front, candidates)?;
            continue;
        }

        match direction {
            Direction::Ascending => {
                // Cursors were seeked to `start`, so only the end bound can
                // cut the scan short.
                if end.cmp_key(&front_row.key) != Ordering::Greater {
                    break;
                }
            }
            Direction::Descending => {
                // The descending seek lands at the first key <= `end`; the
                // end bound is exclusive, so a cursor sitting exactly on it
                // is skipped rather than emitted.
                if end.cmp_key(&front_row.key) != Ordering::Greater {
                    advance(&mut cursors, &front, candidates)?;
                    continue;
                }
                if start.cmp_key(&front_row.key) == Ordering::Greater {
                    break;
                }
            }
        }

        rows.push(front_row);
        if rows.len() >= limit {
            break;
        }
        advance(&mut cursors, &front, candidates)?;
    }

    Ok(rows)
}

/// Indexes of the cursors holding the front key for `direction`, in
/// candidate (precedence) order.
fn front_indexes(cursors: &[Cursor], direction: Direction) -> Vec<usize> {
    let mut best: Option<&Row> = None;
    let mut indexes: Vec<usize> = Vec::new();

    for (i, cursor) in cursors.iter().enumerate() {
        let Some(row) = &cursor.row else {
            continue;
        };
        let Some(best_row) = best else {
            best = Some(row);
            indexes.push(i);
            continue;
        };
        match (row.key.cmp(&best_row.key), direction) {
            (Ordering::Equal, _) => indexes.push(i),
            (Ordering::Less, Direction::Ascending)
            | (Ordering::Greater, Direction::Descending) => {
                best = Some(row);
                indexes.clear();
                indexes.push(i);
            }
            _ => {}
        }
    }

    indexes
}

/// Advances every cursor in `indexes` (sorted ascending) by one row, in
/// parallel. EOF exhausts a cursor; read errors abort the scan naming the
/// segment.
fn advance(
    cursors: &mut [Cursor],
    indexes: &[usize],
    candidates: &[SegmentRecord],
) -> Result<(), SnapshotError> {
    let advanced: Vec<(usize, Result<Option<Row>, SegmentError>)> = cursors
        .par_iter_mut()
        .enumerate()
        .filter(|(i, _)| indexes.binary_search(i).is_ok())
        .map(|(i, cursor)| (i, cursor.iter.next()))
        .collect();

    for (i, result) in advanced {
        cursors[i].row = result.map_err(|e| SnapshotError::segment(&candidates[i].id, e))?;
    }
    Ok(())
}
