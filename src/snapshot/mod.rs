//! Snapshot-consistent reads across a published segment set.
//!
//! The reader holds two ordered views over the same segments: one by ID
//! (drives membership, supports delete-by-ID) and one by key range (supports
//! descending from a probe key to find every segment that might cover it).
//! Both live under a single readers-writer lock; `update_segments` swaps
//! compaction results in atomically while point and range reads run against
//! the candidate list they snapshot at entry.
//!
//! Precedence when several segments hold the same key: lower level wins,
//! then the greater (newer) ID within level 0. Level >= 1 segments are
//! range-disjoint, so precedence between them never matters.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::segment::{
    Direction, DynSegmentReader, Row, ScanKey, SegmentError, SegmentMeta,
};

mod iter;
mod merge;

pub use iter::{SnapshotIter, SnapshotIterOptions};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("invalid range: end must be strictly greater than start")]
    InvalidRange,

    #[error("segment {id}: {source}")]
    Segment {
        id: String,
        #[source]
        source: SegmentError,
    },
}

impl SnapshotError {
    pub(crate) fn segment(id: &str, source: SegmentError) -> Self {
        Self::Segment {
            id: id.to_string(),
            source,
        }
    }
}

/// Handle to one published segment.
///
/// IDs sort lexicographically and a greater ID is newer. Level 0 segments
/// may overlap each other; level >= 1 segments are compacted and
/// range-disjoint within their level.
#[derive(Debug, Clone)]
pub struct SegmentRecord {
    pub id: String,
    pub level: u8,
    pub meta: Arc<SegmentMeta>,
}

impl SegmentRecord {
    pub fn new(id: impl Into<String>, level: u8, meta: Arc<SegmentMeta>) -> Self {
        Self {
            id: id.into(),
            level,
            meta,
        }
    }
}

/// Opens a fresh reader for a segment. The snapshot reader performs no I/O
/// itself; caching, pooling, and transport policy live behind this seam.
/// Each returned reader is owned by a single lookup or scan cursor.
pub type ReaderFactory =
    Box<dyn Fn(&SegmentRecord) -> Result<DynSegmentReader, SegmentError> + Send + Sync>;

/// Key range index entry: (first key asc, last key asc, ID) uniquely orders
/// records even when ranges coincide.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
struct RangeKey {
    first: Bytes,
    last: Bytes,
    id: String,
}

impl RangeKey {
    fn of(record: &SegmentRecord) -> Self {
        Self {
            first: record.meta.first_key.clone(),
            last: record.meta.last_key.clone(),
            id: record.id.clone(),
        }
    }
}

#[derive(Default)]
struct SegmentIndex {
    by_id: BTreeMap<String, SegmentRecord>,
    by_range: BTreeMap<RangeKey, SegmentRecord>,
}

pub struct SnapshotReader {
    index: RwLock<SegmentIndex>,
    factory: ReaderFactory,
}

impl SnapshotReader {
    pub fn new(factory: ReaderFactory) -> Self {
        Self {
            index: RwLock::new(SegmentIndex::default()),
            factory,
        }
    }

    /// Atomically applies a segment-set edit: every record in `drop` leaves
    /// both indexes, then every record in `add` enters both. Readers that
    /// captured their candidates before this call keep reading their
    /// snapshot; no reader observes a partially applied edit.
    ///
    /// Drops are driven by the ID index; dropping an ID that is not present
    /// is a no-op.
    pub fn update_segments(&self, add: Vec<SegmentRecord>, drop: Vec<SegmentRecord>) {
        let mut index = self.index.write();

        for record in drop {
            if let Some(existing) = index.by_id.remove(&record.id) {
                index.by_range.remove(&RangeKey::of(&existing));
            }
        }

        for record in add {
            if let Some(previous) = index.by_id.insert(record.id.clone(), record.clone()) {
                index.by_range.remove(&RangeKey::of(&previous));
            }
            index.by_range.insert(RangeKey::of(&record), record);
        }

        debug_assert_eq!(index.by_id.len(), index.by_range.len());
    }

    /// Current segment set, newest-ID-last. Mostly useful for introspection
    /// and tests.
    pub fn segments(&self) -> Vec<SegmentRecord> {
        self.index.read().by_id.values().cloned().collect()
    }

    /// Point lookup across the segment set. `Ok(None)` when no segment
    /// holds the key or the newest holder is a level-0 tombstone.
    pub fn get_row(&self, key: &[u8]) -> Result<Option<Bytes>, SnapshotError> {
        let mut candidates = self.candidates_for_key(key);
        candidates.sort_by(|a, b| a.level.cmp(&b.level).then_with(|| b.id.cmp(&a.id)));

        for record in candidates {
            let mut reader = (self.factory)(&record)
                .map_err(|e| SnapshotError::segment(&record.id, e))?;
            match reader
                .get_row(key)
                .map_err(|e| SnapshotError::segment(&record.id, e))?
            {
                None => continue,
                Some(value) => {
                    if record.level == 0 && value.is_empty() {
                        // Tombstone: the key is deleted as of the newest
                        // segment that mentions it.
                        return Ok(None);
                    }
                    return Ok(Some(value));
                }
            }
        }

        Ok(None)
    }

    /// Range scan over `[start, end)` returning at most `limit` rows in
    /// `direction` order. Tombstoned keys are suppressed; for every
    /// remaining key the highest-precedence copy is returned.
    pub fn get_range(
        &self,
        start: &ScanKey,
        end: &ScanKey,
        limit: usize,
        direction: Direction,
    ) -> Result<Vec<Row>, SnapshotError> {
        if start.cmp_bound(end) != std::cmp::Ordering::Less {
            return Err(SnapshotError::InvalidRange);
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut candidates = self.candidates_for_range(start, end);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // Merge order: level, then newest first within L0. L1+ segments are
        // disjoint, so order them by position in the scan direction.
        candidates.sort_by(|a, b| {
            a.level.cmp(&b.level).then_with(|| {
                if a.level == 0 {
                    b.id.cmp(&a.id)
                } else {
                    match direction {
                        Direction::Ascending => a.meta.first_key.cmp(&b.meta.first_key),
                        Direction::Descending => b.meta.last_key.cmp(&a.meta.last_key),
                    }
                }
            })
        });

        merge::scan(&self.factory, &candidates, start, end, limit, direction)
    }

    /// Buffered cursor from `start` in `direction`, paging through
    /// `get_range` under the hood. See [`SnapshotIter`] for its snapshot
    /// semantics.
    pub fn row_iter(
        &self,
        start: ScanKey,
        direction: Direction,
        options: SnapshotIterOptions,
    ) -> SnapshotIter<'_> {
        SnapshotIter::new(self, start, direction, options)
    }

    /// Every segment whose `[first, last]` range covers `key`, newest range
    /// entries first. Holds the read lock only while collecting.
    fn candidates_for_key(&self, key: &[u8]) -> Vec<SegmentRecord> {
        let index = self.index.read();
        let mut out = Vec::new();
        for (_, record) in index
            .by_range
            .range(..Self::range_probe_above(key))
            .rev()
        {
            let meta = &record.meta;
            if meta.first_key.as_ref() <= key && key <= meta.last_key.as_ref() {
                out.push(record.clone());
            }
        }
        out
    }

    /// Every segment whose `[first, last]` range overlaps `[start, end)`.
    fn candidates_for_range(&self, start: &ScanKey, end: &ScanKey) -> Vec<SegmentRecord> {
        let index = self.index.read();
        let mut out = Vec::new();

        let walk = |record: &SegmentRecord, out: &mut Vec<SegmentRecord>| {
            let meta = &record.meta;
            let disjoint = start.cmp_key(&meta.last_key) == std::cmp::Ordering::Greater
                || end.cmp_key(&meta.first_key) == std::cmp::Ordering::Less;
            if !disjoint {
                out.push(record.clone());
            }
        };

        match end {
            // Segments starting at or after an unbounded end can still
            // overlap, so walk the whole index.
            ScanKey::End | ScanKey::Start => {
                for (_, record) in index.by_range.iter().rev() {
                    walk(record, &mut out);
                }
            }
            ScanKey::Key(end_key) => {
                for (_, record) in index
                    .by_range
                    .range(..Self::range_probe_above(end_key))
                    .rev()
                {
                    walk(record, &mut out);
                }
            }
        }

        out
    }

    /// Smallest range-index key strictly above every entry whose first key
    /// is <= `key`: appending a zero byte yields `key`'s immediate
    /// lexicographic successor.
    fn range_probe_above(key: &[u8]) -> RangeKey {
        let mut successor = Vec::with_capacity(key.len() + 1);
        successor.extend_from_slice(key);
        successor.push(0);
        RangeKey {
            first: Bytes::from(successor),
            last: Bytes::new(),
            id: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{SegmentReader, SegmentWriter, WriterOptions};
    use std::io::Cursor;

    fn build_segment(rows: Vec<(&str, &str)>) -> (Bytes, Arc<SegmentMeta>) {
        let mut sink = Vec::new();
        let mut writer = SegmentWriter::new(
            &mut sink,
            WriterOptions {
                bloom: None,
                ..Default::default()
            },
        );
        for (key, value) in &rows {
            writer
                .write_row(key.as_bytes(), value.as_bytes())
                .expect("write");
        }
        let (_, meta_bytes) = writer.finish().expect("finish");
        let meta = Arc::new(SegmentMeta::parse(&meta_bytes).expect("parse"));
        (Bytes::from(sink), meta)
    }

    fn reader_with_segments(
        segments: Vec<(&str, u8, Vec<(&str, &str)>)>,
    ) -> (SnapshotReader, Vec<SegmentRecord>) {
        let mut store: std::collections::HashMap<String, Bytes> = Default::default();
        let mut records = Vec::new();
        for (id, level, rows) in segments {
            let (bytes, meta) = build_segment(rows);
            store.insert(id.to_string(), bytes);
            records.push(SegmentRecord::new(id, level, meta));
        }

        let reader = SnapshotReader::new(Box::new(move |record: &SegmentRecord| {
            let bytes = store
                .get(&record.id)
                .cloned()
                .ok_or(SegmentError::CorruptBlock("unknown segment id"))?;
            let len = bytes.len() as u64;
            Ok(SegmentReader::new(Cursor::new(bytes), len)
                .with_meta(record.meta.clone())
                .into_dyn())
        }));
        reader.update_segments(records.clone(), Vec::new());
        (reader, records)
    }

    #[test]
    fn indexes_stay_consistent_across_updates() {
        let (reader, records) = reader_with_segments(vec![
            ("a-1", 0, vec![("k1", "v1")]),
            ("a-2", 0, vec![("k2", "v2")]),
            ("b-1", 1, vec![("k3", "v3")]),
        ]);

        {
            let index = reader.index.read();
            assert_eq!(index.by_id.len(), 3);
            assert_eq!(index.by_range.len(), 3);
        }

        // Dropping an unknown ID is a no-op; dropping a known one removes it
        // from both indexes.
        let ghost = SegmentRecord::new("ghost", 0, records[0].meta.clone());
        reader.update_segments(Vec::new(), vec![ghost, records[1].clone()]);
        {
            let index = reader.index.read();
            assert_eq!(index.by_id.len(), 2);
            assert_eq!(index.by_range.len(), 2);
            assert!(!index.by_id.contains_key("a-2"));
        }

        // Re-adding a live ID replaces its range entry rather than leaking a
        // duplicate.
        reader.update_segments(vec![records[0].clone()], Vec::new());
        {
            let index = reader.index.read();
            assert_eq!(index.by_id.len(), 2);
            assert_eq!(index.by_range.len(), 2);
        }
    }

    #[test]
    fn key_candidates_ignore_non_covering_ranges() {
        let (reader, _) = reader_with_segments(vec![
            // Wide range, would be skipped by a walk that stops at the first
            // non-covering entry after a narrow one.
            ("wide", 1, vec![("a", "1"), ("z", "2")]),
            ("narrow", 0, vec![("b", "3"), ("c", "4")]),
        ]);

        let hits = reader.candidates_for_key(b"m");
        let ids: Vec<_> = hits.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["wide"]);

        let hits = reader.candidates_for_key(b"b");
        let mut ids: Vec<_> = hits.iter().map(|r| r.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["narrow", "wide"]);
    }

    #[test]
    fn range_candidates_use_overlap() {
        let (reader, _) = reader_with_segments(vec![
            ("low", 1, vec![("a", "1"), ("f", "2")]),
            ("high", 1, vec![("m", "3"), ("t", "4")]),
        ]);

        let ids = |start: &ScanKey, end: &ScanKey| {
            let mut ids: Vec<_> = reader
                .candidates_for_range(start, end)
                .iter()
                .map(|r| r.id.clone())
                .collect();
            ids.sort();
            ids
        };

        assert_eq!(
            ids(&ScanKey::key(&b"e"[..]), &ScanKey::key(&b"n"[..])),
            vec!["high", "low"]
        );
        assert_eq!(
            ids(&ScanKey::key(&b"g"[..]), &ScanKey::key(&b"h"[..])),
            Vec::<String>::new()
        );
        assert_eq!(ids(&ScanKey::Start, &ScanKey::End), vec!["high", "low"]);
        assert_eq!(
            ids(&ScanKey::key(&b"u"[..]), &ScanKey::End),
            Vec::<String>::new()
        );
    }
}
