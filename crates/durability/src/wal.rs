//! WAL writer and reader with durability modes.

use crate::format::LogRecord;
use crate::segment::{WalSegment, SEGMENT_HEADER_SIZE};
use fs2::FileExt;
use helio_core::error::{Error, PersistenceKind, Result};
use helio_core::types::Version;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// When the writer forces records to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// fsync after every commit.
    Strict,
    /// fsync after `max_writes` commits or `max_interval`, whichever first.
    Batched {
        /// Commit count threshold.
        max_writes: usize,
        /// Time threshold.
        max_interval: Duration,
    },
}

impl Default for DurabilityMode {
    fn default() -> Self {
        DurabilityMode::Batched {
            max_writes: 128,
            max_interval: Duration::from_millis(10),
        }
    }
}

/// Appends log records to rotating segments in one stream directory.
pub struct WalWriter {
    dir: PathBuf,
    database_uuid: [u8; 16],
    packed: bool,
    max_segment_size: u64,
    mode: DurabilityMode,
    segment: WalSegment,
    /// Last commit version per closed segment, for pruning.
    closed_last_commit: BTreeMap<u64, Version>,
    current_last_commit: Version,
    writes_since_sync: usize,
    last_sync: Instant,
    /// Held for the writer's lifetime so two processes never share a
    /// stream directory.
    _dir_lock: File,
}

impl WalWriter {
    /// Open the stream directory, continuing the newest segment or starting
    /// segment 1.
    pub fn open(
        dir: &Path,
        database_uuid: [u8; 16],
        packed: bool,
        max_segment_size: u64,
        mode: DurabilityMode,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let dir_lock = File::create(dir.join("wal.lock"))?;
        dir_lock.try_lock_exclusive().map_err(|_| {
            Error::Persistence(PersistenceKind::SharingViolation(
                dir.display().to_string(),
            ))
        })?;
        let mut segments = existing_segments(dir)?;
        let active = segments.pop();
        // Earlier segments are already closed; recover their last commit
        // versions so pruning keeps working across restarts.
        let mut closed_last_commit = BTreeMap::new();
        for (number, path) in &segments {
            let bytes = WalSegment::read_records(path)?;
            let mut input = &bytes[..];
            let mut last = 0;
            while let Ok(Some(record)) = LogRecord::decode_from(&mut input) {
                last = record.commit_version;
            }
            closed_last_commit.insert(*number, last);
        }
        let segment = match active {
            Some((_, path)) => WalSegment::open_for_append(&path, database_uuid)?,
            None => WalSegment::create(dir, 1, database_uuid)?,
        };
        Ok(WalWriter {
            dir: dir.to_path_buf(),
            database_uuid,
            packed,
            max_segment_size: max_segment_size.max(SEGMENT_HEADER_SIZE as u64 + 1),
            mode,
            segment,
            closed_last_commit,
            current_last_commit: 0,
            writes_since_sync: 0,
            last_sync: Instant::now(),
            _dir_lock: dir_lock,
        })
    }

    /// Append one record and apply the durability mode.
    pub fn append(&mut self, record: &LogRecord) -> Result<()> {
        let framed = record.encode(self.packed)?;
        if self.segment.size() + framed.len() as u64 > self.max_segment_size {
            self.rotate()?;
        }
        self.segment.append(&framed)?;
        self.current_last_commit = record.commit_version;
        self.writes_since_sync += 1;
        match self.mode {
            DurabilityMode::Strict => {
                self.segment.sync()?;
                self.writes_since_sync = 0;
                self.last_sync = Instant::now();
            }
            DurabilityMode::Batched {
                max_writes,
                max_interval,
            } => {
                if self.writes_since_sync >= max_writes || self.last_sync.elapsed() >= max_interval
                {
                    self.segment.sync()?;
                    self.writes_since_sync = 0;
                    self.last_sync = Instant::now();
                }
            }
        }
        Ok(())
    }

    /// Force everything written so far to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.segment.sync()?;
        self.writes_since_sync = 0;
        self.last_sync = Instant::now();
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.segment.sync()?;
        let closed_number = self.segment.segment_number();
        self.closed_last_commit
            .insert(closed_number, self.current_last_commit);
        let next = closed_number + 1;
        debug!(segment = next, dir = %self.dir.display(), "rotating wal segment");
        self.segment = WalSegment::create(&self.dir, next, self.database_uuid)?;
        Ok(())
    }

    /// Delete closed segments fully covered by a snapshot at
    /// `snapshot_version`.
    pub fn prune_through(&mut self, snapshot_version: Version) -> Result<usize> {
        let doomed: Vec<u64> = self
            .closed_last_commit
            .iter()
            .filter(|(_, last)| **last <= snapshot_version)
            .map(|(n, _)| *n)
            .collect();
        for number in &doomed {
            let path = self.dir.join(WalSegment::file_name(*number));
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(segment = number, error = %e, "failed to prune wal segment");
            } else {
                self.closed_last_commit.remove(number);
            }
        }
        Ok(doomed.len())
    }

    /// The active segment's number.
    pub fn current_segment(&self) -> u64 {
        self.segment.segment_number()
    }
}

/// Reads every record in a stream directory in segment order.
pub struct WalReader;

/// Outcome of reading one stream's log.
pub struct WalReadResult {
    /// Records in append order.
    pub records: Vec<LogRecord>,
    /// Whether a torn tail was found and truncated.
    pub truncated: bool,
}

impl WalReader {
    /// Read all records, truncating at the first torn or corrupt frame.
    /// Bytes past the damage are discarded on disk so a later append never
    /// splices onto garbage.
    pub fn read_all(dir: &Path, database_uuid: [u8; 16]) -> Result<WalReadResult> {
        let mut records = Vec::new();
        let mut truncated = false;
        let segments = existing_segments(dir)?;
        for (i, (_, path)) in segments.iter().enumerate() {
            let (header, _) = WalSegment::read_header(path)?;
            if header.database_uuid != database_uuid {
                return Err(Error::Persistence(PersistenceKind::CorruptLog(format!(
                    "segment {} belongs to another database",
                    path.display()
                ))));
            }
            let bytes = WalSegment::read_records(path)?;
            let mut input = &bytes[..];
            loop {
                match LogRecord::decode_from(&mut input) {
                    Ok(Some(record)) => records.push(record),
                    Ok(None) => break,
                    Err(e) => {
                        let valid = bytes.len() - input.len();
                        warn!(
                            segment = %path.display(),
                            offset = valid,
                            error = %e,
                            "torn wal tail, truncating"
                        );
                        WalSegment::truncate(path, (SEGMENT_HEADER_SIZE + valid) as u64)?;
                        // Anything in later segments is unreachable garbage.
                        for (_, later) in &segments[i + 1..] {
                            std::fs::remove_file(later)?;
                        }
                        truncated = true;
                        return Ok(WalReadResult { records, truncated });
                    }
                }
            }
        }
        Ok(WalReadResult { records, truncated })
    }
}

fn existing_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(number) = entry
            .file_name()
            .to_str()
            .and_then(WalSegment::parse_file_name)
        {
            segments.push((number, entry.path()));
        }
    }
    segments.sort_unstable_by_key(|(n, _)| *n);
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::RecordWrite;
    use helio_core::types::{ObjectId, WriteOp};
    use helio_core::value::{PropertyBlock, PropertyValue};

    fn record(cv: Version, payload: &str) -> LogRecord {
        LogRecord {
            commit_version: cv,
            tx_id: cv,
            writes: vec![RecordWrite {
                class_id: 1,
                op: WriteOp::Insert,
                object_id: ObjectId::new(1, cv),
                block: Some(PropertyBlock::new(vec![PropertyValue::string(payload)])),
            }],
        }
    }

    fn open(dir: &Path, uuid: [u8; 16]) -> WalWriter {
        WalWriter::open(dir, uuid, false, 64 << 20, DurabilityMode::Strict).unwrap()
    }

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = [1u8; 16];
        let mut writer = open(dir.path(), uuid);
        for cv in 1..=10 {
            writer.append(&record(cv, "r")).unwrap();
        }
        drop(writer);

        let result = WalReader::read_all(dir.path(), uuid).unwrap();
        assert!(!result.truncated);
        let versions: Vec<Version> = result.records.iter().map(|r| r.commit_version).collect();
        assert_eq!(versions, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn reopened_writer_continues_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = [1u8; 16];
        let mut writer = open(dir.path(), uuid);
        writer.append(&record(1, "first")).unwrap();
        drop(writer);

        let mut writer = open(dir.path(), uuid);
        writer.append(&record(2, "second")).unwrap();
        drop(writer);

        let result = WalReader::read_all(dir.path(), uuid).unwrap();
        assert_eq!(result.records.len(), 2);
    }

    #[test]
    fn rotation_and_pruning() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = [1u8; 16];
        // Tiny max size forces a rotation per record.
        let mut writer =
            WalWriter::open(dir.path(), uuid, false, 128, DurabilityMode::Strict).unwrap();
        for cv in 1..=4 {
            writer.append(&record(cv, "rotating")).unwrap();
        }
        assert!(writer.current_segment() >= 3);

        // A snapshot at version 2 releases every closed segment whose last
        // commit is covered.
        let pruned = writer.prune_through(2).unwrap();
        assert_eq!(pruned, 2);

        let result = WalReader::read_all(dir.path(), uuid).unwrap();
        assert!(!result.records.is_empty());
        assert!(result.records.iter().all(|r| r.commit_version > 2));
    }

    #[test]
    fn torn_tail_is_truncated_once() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = [1u8; 16];
        let mut writer = open(dir.path(), uuid);
        writer.append(&record(1, "keep")).unwrap();
        writer.append(&record(2, "keep too")).unwrap();
        drop(writer);

        // Tear the file mid-record.
        let path = dir.path().join(WalSegment::file_name(1));
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();
        drop(file);

        let result = WalReader::read_all(dir.path(), uuid).unwrap();
        assert!(result.truncated);
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].commit_version, 1);

        // After truncation the log reads clean.
        let again = WalReader::read_all(dir.path(), uuid).unwrap();
        assert!(!again.truncated);
        assert_eq!(again.records.len(), 1);
    }

    #[test]
    fn packed_stream_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = [1u8; 16];
        let mut writer =
            WalWriter::open(dir.path(), uuid, true, 64 << 20, DurabilityMode::Strict).unwrap();
        let long = "compressible ".repeat(500);
        writer.append(&record(1, &long)).unwrap();
        drop(writer);

        let result = WalReader::read_all(dir.path(), uuid).unwrap();
        let block = result.records[0].writes[0].block.as_ref().unwrap();
        assert_eq!(block.get(0).unwrap().as_str().as_deref(), Some(long.as_str()));
    }
}
