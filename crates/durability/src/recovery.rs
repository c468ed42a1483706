//! Crash recovery.
//!
//! Per stream: load the newest complete snapshot, then the log suffix with
//! commit versions above it. Records from all streams are merged back into
//! ascending commit order; a transaction that spanned streams reassembles
//! into a single record. The engine applies snapshots first, then replays
//! the merged suffix.

use crate::format::LogRecord;
use crate::snapshot::SnapshotData;
use crate::stream::StreamSet;
use helio_core::error::Result;
use helio_core::types::{TxnId, Version};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tracing::info;

/// Everything recovery reconstructed.
pub struct RecoveredState {
    /// One snapshot per stream that had one, in stream order.
    pub snapshots: Vec<SnapshotData>,
    /// Replayable records, ascending by commit version, reassembled across
    /// streams.
    pub records: Vec<LogRecord>,
    /// Highest commit version seen anywhere; the engine restores its
    /// version counter from this.
    pub max_commit_version: Version,
    /// Highest transaction id seen; fresh ids start above it.
    pub max_txn_id: TxnId,
}

/// Run recovery over every stream in `streams`.
pub fn recover(streams: &StreamSet, database_uuid: [u8; 16]) -> Result<RecoveredState> {
    let mut snapshots = Vec::new();
    let mut merged: BTreeMap<Version, LogRecord> = BTreeMap::new();
    let mut max_commit_version = 0;
    let mut max_txn_id = 0;

    for stream in streams.iter() {
        let (snapshot, records) = stream.read_state(database_uuid)?;
        let floor = snapshot.as_ref().map(|s| s.commit_version).unwrap_or(0);
        if let Some(snapshot) = snapshot {
            max_commit_version = max_commit_version.max(snapshot.commit_version);
            snapshots.push(snapshot);
        }
        for record in records {
            max_commit_version = max_commit_version.max(record.commit_version);
            max_txn_id = max_txn_id.max(record.tx_id);
            if record.commit_version <= floor {
                // Already captured by this stream's snapshot.
                continue;
            }
            match merged.entry(record.commit_version) {
                Entry::Occupied(mut existing) => {
                    existing.get_mut().writes.extend(record.writes);
                }
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
            }
        }
    }

    let records: Vec<LogRecord> = merged.into_values().collect();
    info!(
        snapshots = snapshots.len(),
        records = records.len(),
        max_commit_version,
        "recovery scan complete"
    );
    Ok(RecoveredState {
        snapshots,
        records,
        max_commit_version,
        max_txn_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::RecordWrite;
    use crate::snapshot::SnapshotObject;
    use crate::wal::DurabilityMode;
    use helio_core::config::{LogStreamConfig, PersistenceConfig};
    use helio_core::types::{ObjectId, WriteOp};
    use helio_core::value::{PropertyBlock, PropertyValue};

    fn write(class: u16, seq: u64, n: i64) -> RecordWrite {
        RecordWrite {
            class_id: class,
            op: WriteOp::Insert,
            object_id: ObjectId::new(class, seq),
            block: Some(PropertyBlock::new(vec![PropertyValue::I64(n)])),
        }
    }

    fn record(cv: Version, writes: Vec<RecordWrite>) -> LogRecord {
        LogRecord {
            commit_version: cv,
            tx_id: cv + 100,
            writes,
        }
    }

    #[test]
    fn replay_resumes_after_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();
        let uuid = [2u8; 16];
        let set = StreamSet::open(
            &PersistenceConfig::main_only(base),
            "n1",
            uuid,
            DurabilityMode::Strict,
        )
        .unwrap();

        for cv in 1..=6 {
            set.append(&record(cv, vec![write(1, cv, cv as i64)]), |_| 0)
                .unwrap();
        }
        set.main()
            .write_snapshot(
                uuid,
                &SnapshotData {
                    commit_version: 4,
                    classes: vec![(
                        1,
                        vec![SnapshotObject {
                            object_id: ObjectId::new(1, 4),
                            commit_version: 4,
                            block: Some(PropertyBlock::new(vec![PropertyValue::I64(4)])),
                        }],
                    )],
                },
            )
            .unwrap();

        let state = recover(&set, uuid).unwrap();
        assert_eq!(state.snapshots.len(), 1);
        assert_eq!(state.snapshots[0].commit_version, 4);
        let versions: Vec<Version> = state.records.iter().map(|r| r.commit_version).collect();
        assert_eq!(versions, vec![5, 6], "only the suffix past the snapshot replays");
        assert_eq!(state.max_commit_version, 6);
        assert_eq!(state.max_txn_id, 106);
    }

    #[test]
    fn cross_stream_transaction_reassembles() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();
        let uuid = [2u8; 16];
        let mut config = PersistenceConfig::main_only(base);
        config
            .create_stream(LogStreamConfig {
                name: "side".to_string(),
                directory: format!("{base}/side/log"),
                snapshot_directory: format!("{base}/side/snapshot"),
                max_size: 64 << 20,
                packed: false,
            })
            .unwrap();
        let set = StreamSet::open(&config, "n1", uuid, DurabilityMode::Strict).unwrap();

        // One transaction touching both streams.
        set.append(
            &record(1, vec![write(1, 1, 10), write(2, 1, 20)]),
            |class| if class == 1 { 0 } else { 1 },
        )
        .unwrap();

        let state = recover(&set, uuid).unwrap();
        assert_eq!(state.records.len(), 1);
        let classes: Vec<u16> = state.records[0].writes.iter().map(|w| w.class_id).collect();
        assert_eq!(classes.len(), 2);
        assert!(classes.contains(&1) && classes.contains(&2));
    }

    #[test]
    fn empty_directories_recover_to_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();
        let uuid = [2u8; 16];
        let set = StreamSet::open(
            &PersistenceConfig::main_only(base),
            "n1",
            uuid,
            DurabilityMode::Strict,
        )
        .unwrap();
        let state = recover(&set, uuid).unwrap();
        assert!(state.snapshots.is_empty());
        assert!(state.records.is_empty());
        assert_eq!(state.max_commit_version, 0);
    }
}
