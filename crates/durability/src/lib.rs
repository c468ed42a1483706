//! Persistence layer for HelioDB
//!
//! - Append-only write-ahead log per configured log stream
//! - Length-prefixed, CRC-framed records; packed streams compress payloads
//! - Atomic snapshots via temp file and rename
//! - Recovery: newest complete snapshot plus ascending log replay with
//!   torn-tail truncation
//! - Segment pruning once a snapshot covers a segment's last commit

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod format;
pub mod recovery;
pub mod segment;
pub mod snapshot;
pub mod stream;
pub mod wal;

pub use format::{LogRecord, RecordWrite};
pub use recovery::{recover, RecoveredState};
pub use segment::{SegmentHeader, WalSegment, SEGMENT_HEADER_SIZE};
pub use snapshot::{SnapshotData, SnapshotObject};
pub use stream::{LogStream, StreamSet};
pub use wal::{DurabilityMode, WalReader, WalWriter};
