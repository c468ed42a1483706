//! Replication and leader election for HelioDB
//!
//! A two-tier topology: inside a local-write cluster, a lightweight
//! witness-arbitrated election assigns the Primary and the standby tails
//! the log (synchronously or asynchronously); between two global-write
//! sites, role changes are manual with a split-brain confirmation gate.
//! Log records ship in commit order with resumable acknowledgement
//! windows.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod election;
pub mod global;
pub mod hub;
pub mod protocol;
pub mod replica;
pub mod roles;
pub mod witness;

pub use election::{ElectionManager, ElectionOutcome, PeerLink};
pub use global::GlobalWriteState;
pub use hub::{ReplicationHub, ReplicationSink, StateProvider};
pub use protocol::ReplicationMsg;
pub use replica::{ReplicaClient, RecordApplier};
pub use roles::{GlobalWriteRole, LocalWriteRole, NodeRoles, ReplicaConnState, ReplicaStatus};
pub use witness::{SharedFolderWitness, Witness};
