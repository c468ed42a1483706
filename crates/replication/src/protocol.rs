//! Replication wire protocol.
//!
//! Messages ride the chunked framing on the replication endpoint, encoded
//! with bincode. The stream is strictly ordered: records arrive in commit
//! order, acknowledgements report the newest contiguously applied version,
//! and reconnection resumes from the replica's reported state.

use bytes::Bytes;
use helio_core::error::{Error, Result};
use helio_durability::{LogRecord, SnapshotData};
use helio_core::types::Version;
use serde::{Deserialize, Serialize};

/// One replication-stream message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicationMsg {
    /// Replica → primary on connect: who I am and where my log ends.
    Hello {
        /// Replica node name.
        node: String,
        /// Newest version the replica has applied.
        applied_version: Version,
    },
    /// Primary → replica when the gap exceeds retained log: full state,
    /// then the tail follows as records.
    SnapshotTransfer {
        /// Snapshot version.
        commit_version: Version,
        /// Per-stream snapshot payloads.
        snapshots: Vec<SnapshotData>,
    },
    /// Primary → replica: one committed record, in commit order.
    Record(LogRecord),
    /// Replica → primary: everything at or below is applied.
    Ack {
        /// Newest applied version.
        applied_version: Version,
    },
    /// Keeps an idle stream's timeouts from firing.
    Heartbeat,
}

impl ReplicationMsg {
    /// Encode for the wire.
    pub fn encode(&self) -> Result<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode from a reassembled message payload.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_round_trip() {
        let messages = vec![
            ReplicationMsg::Hello {
                node: "n2".to_string(),
                applied_version: 17,
            },
            ReplicationMsg::Ack { applied_version: 3 },
            ReplicationMsg::Heartbeat,
            ReplicationMsg::Record(LogRecord {
                commit_version: 9,
                tx_id: 4,
                writes: Vec::new(),
            }),
        ];
        for msg in messages {
            let bytes = msg.encode().unwrap();
            let back = ReplicationMsg::decode(&bytes).unwrap();
            assert_eq!(format!("{msg:?}"), format!("{back:?}"));
        }
    }
}
