//! Node roles and replica connection states.

use helio_core::types::Version;
use serde::{Deserialize, Serialize};

/// Role inside a local-write cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalWriteRole {
    /// Accepts writes.
    Primary,
    /// Tails the primary's log.
    Standby,
    /// Not a member of a local-write cluster.
    None,
}

/// Role inside a global-write cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobalWriteRole {
    /// This site accepts writes.
    PrimarySite,
    /// This site tails the primary site.
    StandbySite,
    /// Not a member of a global-write cluster.
    None,
}

/// The combined role picture of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRoles {
    /// Local-write role.
    pub local: LocalWriteRole,
    /// Global-write role.
    pub global: GlobalWriteRole,
}

impl NodeRoles {
    /// A standalone node: it always writes.
    pub fn standalone() -> Self {
        NodeRoles {
            local: LocalWriteRole::None,
            global: GlobalWriteRole::None,
        }
    }

    /// Whether this node currently accepts writes: local Primary (or
    /// standalone) on a site that is PrimarySite (or not federated).
    pub fn write_master(&self) -> bool {
        let local_ok = matches!(self.local, LocalWriteRole::Primary | LocalWriteRole::None);
        let global_ok = matches!(
            self.global,
            GlobalWriteRole::PrimarySite | GlobalWriteRole::None
        );
        local_ok && global_ok
    }
}

/// Connection state of one replica, as seen by its primary.
///
/// ```text
/// NotUsed → NotStarted → Disconnected ⇄ ConnectedPendingSync
///                                          → ConnectedAsync → ConnectedSync
/// ```
///
/// The `aligned` flag toggles independently during catch-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaConnState {
    /// Configured off.
    NotUsed,
    /// Not yet attempted.
    NotStarted,
    /// No live connection.
    Disconnected,
    /// Connected, receiving the catch-up tail or a snapshot transfer.
    ConnectedPendingSync,
    /// Caught up, tailed best effort.
    ConnectedAsync,
    /// Caught up, acknowledged before commit success.
    ConnectedSync,
}

/// A point-in-time snapshot of one replica's status, for the admin
/// surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    /// Replica node name.
    pub name: String,
    /// Connection state.
    pub state: ReplicaConnState,
    /// Whether `applied_version` is within tolerance of the primary.
    pub aligned: bool,
    /// Newest version the replica acknowledged.
    pub applied_version: Version,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_master_truth_table() {
        let cases = [
            (LocalWriteRole::Primary, GlobalWriteRole::PrimarySite, true),
            (LocalWriteRole::Primary, GlobalWriteRole::None, true),
            (LocalWriteRole::Primary, GlobalWriteRole::StandbySite, false),
            (LocalWriteRole::Standby, GlobalWriteRole::PrimarySite, false),
            (LocalWriteRole::None, GlobalWriteRole::None, true),
            (LocalWriteRole::None, GlobalWriteRole::StandbySite, false),
        ];
        for (local, global, expected) in cases {
            assert_eq!(
                NodeRoles { local, global }.write_master(),
                expected,
                "{local:?}/{global:?}"
            );
        }
    }
}
