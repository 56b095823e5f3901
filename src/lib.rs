//! `segkv` is the storage core of an object-storage-native key-value store:
//! an immutable segment file format plus a snapshot-consistent merge reader
//! over a two-level segment set.
//!
//! This crate is intentionally opinionated about correctness first:
//! - Segments are written once, in strictly ascending key order, and never
//!   mutated after publish.
//! - Data blocks are padded to a fixed alignment and carry xxhash64
//!   integrity hashes that readers verify on every load.
//! - Reads run against a consistent snapshot of the published segment set;
//!   `update_segments` swaps segments in and out atomically.
//! - Deletes are tombstones: an empty value in a level-0 segment masks every
//!   older occurrence of its key.
//!
//! The crate does no I/O policy of its own. Writers stream into any byte
//! sink, readers pull from any seekable byte source, and the snapshot reader
//! opens segments through an injected factory so caching, pooling, and
//! transport live with the caller.

pub mod segment;
pub mod snapshot;

pub use segment::{
    BlockStat, BloomOptions, ByteSource, CompressionCodec, Direction, DynSegmentReader, Row,
    RowIter, ScanKey, SegmentError, SegmentMeta, SegmentReader, SegmentWriter, WriterOptions,
};
pub use snapshot::{
    ReaderFactory, SegmentRecord, SnapshotError, SnapshotIter, SnapshotIterOptions, SnapshotReader,
};
