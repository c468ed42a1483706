//! Node state as reported by the administration surface.

use helio_core::types::Version;
use helio_replication::{NodeRoles, ReplicaStatus};
use serde::{Deserialize, Serialize};

/// A point-in-time picture of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    /// Node name.
    pub node: String,
    /// Local and global write roles.
    pub roles: NodeRoles,
    /// Latest committed version.
    pub committed_version: Version,
    /// Running transactions.
    pub live_transactions: usize,
    /// Per-replica connection states.
    pub replicas: Vec<ReplicaStatus>,
    /// Whether the witness answered the last probe; `None` for nodes
    /// without one.
    pub witness_reachable: Option<bool>,
    /// Installed model-version GUID.
    pub model_guid: String,
    /// Installed model version number.
    pub model_version: u32,
}
