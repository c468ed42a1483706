//! Configured log streams.
//!
//! Every class persists to exactly one stream; a committing transaction's
//! record is projected per stream so each stream's log replays standalone.
//! Stream 0 is the implicit main stream.

use crate::format::LogRecord;
use crate::snapshot::{self, SnapshotData};
use crate::wal::{DurabilityMode, WalReader, WalWriter};
use helio_core::config::{expand_node_name, LogStreamConfig, PersistenceConfig};
use helio_core::error::{Error, NotFoundKind, Result};
use helio_core::types::{ClassId, Version};
use parking_lot::Mutex;
use std::path::PathBuf;

/// One open log stream: its WAL plus its snapshot directory.
pub struct LogStream {
    name: String,
    log_dir: PathBuf,
    snapshot_dir: PathBuf,
    packed: bool,
    wal: Mutex<WalWriter>,
}

impl LogStream {
    fn open(
        config: &LogStreamConfig,
        node_name: &str,
        database_uuid: [u8; 16],
        mode: DurabilityMode,
    ) -> Result<Self> {
        let log_dir = PathBuf::from(expand_node_name(&config.directory, node_name));
        let snapshot_dir = PathBuf::from(expand_node_name(&config.snapshot_directory, node_name));
        let wal = WalWriter::open(
            &log_dir,
            database_uuid,
            config.packed,
            config.max_size,
            mode,
        )?;
        Ok(LogStream {
            name: config.name.clone(),
            log_dir,
            snapshot_dir,
            packed: config.packed,
            wal: Mutex::new(wal),
        })
    }

    /// Stream name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether payloads are compressed.
    pub fn packed(&self) -> bool {
        self.packed
    }

    /// The resolved log directory.
    pub fn log_dir(&self) -> &PathBuf {
        &self.log_dir
    }

    /// Append and apply the durability mode.
    pub fn append(&self, record: &LogRecord) -> Result<()> {
        self.wal.lock().append(record)
    }

    /// Force buffered records to disk.
    pub fn sync(&self) -> Result<()> {
        self.wal.lock().sync()
    }

    /// Persist a snapshot and release covered log segments plus stale
    /// snapshots.
    pub fn write_snapshot(&self, database_uuid: [u8; 16], data: &SnapshotData) -> Result<()> {
        snapshot::write_snapshot(&self.snapshot_dir, database_uuid, data)?;
        let mut wal = self.wal.lock();
        wal.prune_through(data.commit_version)?;
        snapshot::prune_snapshots(&self.snapshot_dir, 2)?;
        Ok(())
    }

    /// Load this stream's newest snapshot and remaining log suffix.
    pub fn read_state(
        &self,
        database_uuid: [u8; 16],
    ) -> Result<(Option<SnapshotData>, Vec<LogRecord>)> {
        let snapshot = snapshot::load_newest_snapshot(&self.snapshot_dir, database_uuid)?;
        let read = WalReader::read_all(&self.log_dir, database_uuid)?;
        Ok((snapshot, read.records))
    }
}

/// All configured streams, in configuration order (main first).
pub struct StreamSet {
    streams: Vec<LogStream>,
}

impl StreamSet {
    /// Open every configured stream.
    pub fn open(
        config: &PersistenceConfig,
        node_name: &str,
        database_uuid: [u8; 16],
        mode: DurabilityMode,
    ) -> Result<Self> {
        config.validate()?;
        let streams = config
            .streams
            .iter()
            .map(|s| LogStream::open(s, node_name, database_uuid, mode))
            .collect::<Result<Vec<_>>>()?;
        Ok(StreamSet { streams })
    }

    /// The stream at a configured index.
    pub fn stream(&self, index: u8) -> Result<&LogStream> {
        self.streams
            .get(index as usize)
            .ok_or_else(|| Error::NotFound(NotFoundKind::LogStream(format!("#{index}"))))
    }

    /// The main stream.
    pub fn main(&self) -> &LogStream {
        &self.streams[0]
    }

    /// All streams.
    pub fn iter(&self) -> impl Iterator<Item = &LogStream> {
        self.streams.iter()
    }

    /// Number of open streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// A stream set always has the main stream.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Append a committed record, split across the streams its classes
    /// persist to. Streams a record does not touch see nothing.
    pub fn append(&self, record: &LogRecord, stream_of: impl Fn(ClassId) -> u8) -> Result<()> {
        for (index, stream) in self.streams.iter().enumerate() {
            if let Some(projected) = record.project(index as u8, &stream_of) {
                stream.append(&projected)?;
            }
        }
        Ok(())
    }

    /// Force every stream to disk.
    pub fn sync_all(&self) -> Result<()> {
        for stream in &self.streams {
            stream.sync()?;
        }
        Ok(())
    }

    /// Highest commit version present across all streams' logs and
    /// snapshots. Recovery uses this to restore the version counter.
    pub fn max_commit_version(&self, database_uuid: [u8; 16]) -> Result<Version> {
        let mut max = 0;
        for stream in &self.streams {
            let (snapshot, records) = stream.read_state(database_uuid)?;
            if let Some(s) = snapshot {
                max = max.max(s.commit_version);
            }
            if let Some(last) = records.last() {
                max = max.max(last.commit_version);
            }
        }
        Ok(max)
    }
}
