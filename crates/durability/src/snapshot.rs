//! Snapshots: the object state of one stream at one commit version.
//!
//! Snapshot files are named `snapshot-VVVVVVVVVVVVVVVVVVVV.snp` (the commit
//! version, zero padded so lexicographic order equals version order).
//! Writing goes through a temp file and an atomic rename; a crash mid-write
//! leaves the previous snapshot authoritative. A successful snapshot
//! releases the log segments it covers.

use crate::segment::{SegmentHeader, SEGMENT_HEADER_SIZE};
use helio_core::error::{Error, PersistenceKind, Result};
use helio_core::types::{ClassId, ObjectId, Version};
use helio_core::value::PropertyBlock;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One object's newest version as captured by a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotObject {
    /// The object.
    pub object_id: ObjectId,
    /// Commit version of the captured head.
    pub commit_version: Version,
    /// The captured block; `None` for a tombstone retained because older
    /// snapshots of replicas may still need to learn about the deletion.
    pub block: Option<PropertyBlock>,
}

/// Everything one stream's snapshot captures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotData {
    /// The snapshot's commit version: every write at or below is included.
    pub commit_version: Version,
    /// Captured objects grouped by class.
    pub classes: Vec<(ClassId, Vec<SnapshotObject>)>,
}

/// File name for a snapshot version.
pub fn snapshot_file_name(version: Version) -> String {
    format!("snapshot-{version:020}.snp")
}

fn parse_snapshot_name(name: &str) -> Option<Version> {
    name.strip_prefix("snapshot-")?
        .strip_suffix(".snp")?
        .parse()
        .ok()
}

/// Write `data` atomically into `dir`.
pub fn write_snapshot(dir: &Path, database_uuid: [u8; 16], data: &SnapshotData) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let final_path = dir.join(snapshot_file_name(data.commit_version));
    let tmp_path = dir.join(format!(".{}.tmp", snapshot_file_name(data.commit_version)));

    let payload = bincode::serialize(data)
        .map_err(|e| Error::Persistence(PersistenceKind::SnapshotFailed(e.to_string())))?;
    {
        let mut file = std::fs::File::create(&tmp_path)
            .map_err(|e| Error::Persistence(PersistenceKind::SnapshotFailed(e.to_string())))?;
        // Reuse the segment header layout so every durable file self-identifies.
        file.write_all(&SegmentHeader::new(data.commit_version, database_uuid).to_bytes())?;
        file.write_all(&payload)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, &final_path)
        .map_err(|e| Error::Persistence(PersistenceKind::SnapshotFailed(e.to_string())))?;
    info!(version = data.commit_version, path = %final_path.display(), "snapshot written");
    Ok(final_path)
}

/// Load the newest complete snapshot in `dir`, if any. Damaged snapshot
/// files are skipped with a warning; an older intact snapshot still wins
/// over no snapshot.
pub fn load_newest_snapshot(dir: &Path, database_uuid: [u8; 16]) -> Result<Option<SnapshotData>> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut versions: Vec<(Version, PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let version = parse_snapshot_name(entry.file_name().to_str()?)?;
            Some((version, entry.path()))
        })
        .collect();
    versions.sort_unstable_by_key(|(v, _)| *v);

    while let Some((version, path)) = versions.pop() {
        match load_snapshot(&path, database_uuid) {
            Ok(data) => {
                debug_assert_eq!(data.commit_version, version);
                return Ok(Some(data));
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping damaged snapshot");
            }
        }
    }
    Ok(None)
}

fn load_snapshot(path: &Path, database_uuid: [u8; 16]) -> Result<SnapshotData> {
    let mut file = std::fs::File::open(path)?;
    let mut header_bytes = [0u8; SEGMENT_HEADER_SIZE];
    file.read_exact(&mut header_bytes).map_err(|_| {
        Error::Persistence(PersistenceKind::SnapshotFailed(
            "snapshot shorter than its header".to_string(),
        ))
    })?;
    let header = SegmentHeader::from_bytes(&header_bytes).ok_or_else(|| {
        Error::Persistence(PersistenceKind::SnapshotFailed(
            "bad snapshot header".to_string(),
        ))
    })?;
    if header.database_uuid != database_uuid {
        return Err(Error::Persistence(PersistenceKind::SnapshotFailed(
            "snapshot belongs to another database".to_string(),
        )));
    }
    let mut payload = Vec::new();
    file.read_to_end(&mut payload)?;
    bincode::deserialize(&payload)
        .map_err(|e| Error::Persistence(PersistenceKind::SnapshotFailed(e.to_string())))
}

/// Delete snapshots older than the newest `keep` of them.
pub fn prune_snapshots(dir: &Path, keep: usize) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut versions: Vec<(Version, PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let version = parse_snapshot_name(entry.file_name().to_str()?)?;
            Some((version, entry.path()))
        })
        .collect();
    versions.sort_unstable_by_key(|(v, _)| *v);
    let mut removed = 0;
    while versions.len() > keep {
        let (_, path) = versions.remove(0);
        std::fs::remove_file(path)?;
        removed += 1;
    }
    Ok(removed)
}
