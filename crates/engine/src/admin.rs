//! Administration services.
//!
//! Three stable service names:
//! - `NodeAdministration`: node state and trace levels
//! - `LocalWriteClusterAdministration`: failover and site role changes
//! - `DatabaseAdministration`: cluster/persistence configuration and
//!   user-assembly bundles
//!
//! Every operation executes as a single request against engine state and
//! answers with typed errors from the shared taxonomy.

use crate::assembly::{self, UpdateOutcome};
use crate::database::Database;
use helio_core::config::{ClusterConfig, PersistenceConfig};
use helio_core::context::TraceLevel;
use helio_core::error::{ClusterKind, Error, Result};
use helio_replication::{ElectionOutcome, GlobalWriteRole};
use helio_rpc::envelope::{decode, encode};
use helio_rpc::{OpTableService, ServiceRegistry};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Service name: node-level administration.
pub const NODE_ADMIN: &str = "NodeAdministration";

/// Service name: local-write cluster administration.
pub const LWC_ADMIN: &str = "LocalWriteClusterAdministration";

/// Service name: database administration.
pub const DB_ADMIN: &str = "DatabaseAdministration";

/// Probes the peer site's global-write role; `None` when unreachable.
pub type PeerSiteProbe = Arc<dyn Fn() -> Option<GlobalWriteRole> + Send + Sync>;

/// Result of an assembly update, as reported to the administrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAssembliesReply {
    /// Whether anything changed.
    pub installed: bool,
    /// The (possibly unchanged) model-version GUID.
    pub version_guid: String,
}

/// Shared state behind the admin services.
pub struct AdminState {
    db: Arc<Database>,
    cluster_config: RwLock<Option<ClusterConfig>>,
    peer_site_probe: RwLock<Option<PeerSiteProbe>>,
}

impl AdminState {
    /// Build admin state over `db`.
    pub fn new(db: Arc<Database>) -> Arc<Self> {
        Arc::new(AdminState {
            db,
            cluster_config: RwLock::new(None),
            peer_site_probe: RwLock::new(None),
        })
    }

    /// Install the cluster configuration this node was started from.
    pub fn set_cluster_config(&self, config: ClusterConfig) {
        *self.cluster_config.write() = Some(config);
    }

    /// Install the peer-site role probe used by `become_primary`.
    pub fn set_peer_site_probe(&self, probe: PeerSiteProbe) {
        *self.peer_site_probe.write() = Some(probe);
    }
}

/// Build the registry served on the administration endpoint.
pub fn admin_registry(state: &Arc<AdminState>) -> Arc<ServiceRegistry> {
    let registry = Arc::new(ServiceRegistry::new());
    registry.register(NODE_ADMIN, Arc::new(node_admin(state)));
    registry.register(LWC_ADMIN, Arc::new(lwc_admin(state)));
    registry.register(DB_ADMIN, Arc::new(db_admin(state)));
    registry
}

fn node_admin(state: &Arc<AdminState>) -> OpTableService {
    let get_state = Arc::clone(state);
    let set_trace = Arc::clone(state);
    let set_user_trace = Arc::clone(state);
    OpTableService::new()
        .with_op("GetNodeState", move |_, _| {
            encode(&get_state.db.node_state())
        })
        .with_op("SetTraceLevel", move |_, payload| {
            let level: u8 = decode(payload)?;
            let level = TraceLevel::from_u8(level).ok_or_else(|| Error::InvalidArgument {
                field: "level".to_string(),
                reason: format!("unknown trace level {level}"),
            })?;
            set_trace.db.set_trace_level(level);
            encode(&())
        })
        .with_op("SetUserTraceLevel", move |_, payload| {
            let level: u8 = decode(payload)?;
            let level = TraceLevel::from_u8(level).ok_or_else(|| Error::InvalidArgument {
                field: "level".to_string(),
                reason: format!("unknown trace level {level}"),
            })?;
            set_user_trace.db.set_user_trace_level(level);
            encode(&())
        })
}

fn lwc_admin(state: &Arc<AdminState>) -> OpTableService {
    let failover = Arc::clone(state);
    let become_primary = Arc::clone(state);
    let become_standby = Arc::clone(state);
    OpTableService::new()
        .with_op("Failover", move |_, _| {
            let outcome = match failover.db.election() {
                Some(election) => election.request_failover(),
                None => ElectionOutcome::NotApplicable,
            };
            match outcome {
                ElectionOutcome::Success => encode(&outcome),
                ElectionOutcome::NotApplicable => {
                    Err(Error::Cluster(ClusterKind::NotInLocalWriteCluster))
                }
                ElectionOutcome::Busy => Err(Error::Cluster(ClusterKind::Busy)),
            }
        })
        .with_op("BecomePrimary", move |_, payload| {
            let confirmed: bool = decode(payload)?;
            let peer_role = become_primary
                .peer_site_probe
                .read()
                .as_ref()
                .and_then(|probe| probe());
            become_primary
                .db
                .global_role()
                .become_primary(peer_role, confirmed)?;
            encode(&())
        })
        .with_op("BecomeStandby", move |_, _| {
            become_standby.db.global_role().become_standby()?;
            encode(&())
        })
}

fn db_admin(state: &Arc<AdminState>) -> OpTableService {
    let get_cluster = Arc::clone(state);
    let get_persistence = Arc::clone(state);
    let apply_persistence = Arc::clone(state);
    let update_assemblies = Arc::clone(state);
    let get_assemblies = Arc::clone(state);
    OpTableService::new()
        .with_op("GetClusterConfiguration", move |_, _| {
            encode(&*get_cluster.cluster_config.read())
        })
        .with_op("GetPersistenceConfiguration", move |_, _| {
            encode(&get_persistence.db.persistence())
        })
        .with_op("ApplyPersistenceConfiguration", move |_, payload| {
            let config: PersistenceConfig = decode(payload)?;
            apply_persistence.db.apply_persistence(config)?;
            encode(&())
        })
        .with_op("UpdateUserAssemblies", move |_, payload| {
            let archive: Vec<u8> = decode(payload)?;
            let unpacked = assembly::unpack_bundle(&archive)?;
            let outcome = update_assemblies.db.update_assemblies(unpacked.bundle)?;
            encode(&UpdateAssembliesReply {
                installed: outcome == UpdateOutcome::Installed,
                version_guid: update_assemblies.db.model_guid().to_string(),
            })
        })
        .with_op("GetUserAssemblies", move |_, _| {
            encode(&get_assemblies.db.packed_assemblies()?)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::AssemblyBundle;
    use crate::database::DatabaseConfig;
    use helio_core::model::ModelDescriptor;
    use helio_rpc::RequestKind;
    use helio_rpc::Service as _;

    fn setup() -> (tempfile::TempDir, Arc<AdminState>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(
            DatabaseConfig::standalone("n1", dir.path()),
            AssemblyBundle::for_model(ModelDescriptor::empty()),
        )
        .unwrap();
        (dir, AdminState::new(db))
    }

    #[test]
    fn node_state_round_trips() {
        let (_dir, state) = setup();
        let service = node_admin(&state);
        let reply = service
            .invoke("GetNodeState", RequestKind::Read, &encode(&()).unwrap())
            .unwrap();
        let node_state: crate::node_state::NodeState = decode(&reply).unwrap();
        assert_eq!(node_state.node, "n1");
        assert_eq!(node_state.committed_version, 0);
        state.db.shutdown();
    }

    #[test]
    fn trace_level_validation() {
        let (_dir, state) = setup();
        let service = node_admin(&state);
        service
            .invoke("SetTraceLevel", RequestKind::ReadWrite, &encode(&3u8).unwrap())
            .unwrap();
        let err = service
            .invoke("SetTraceLevel", RequestKind::ReadWrite, &encode(&9u8).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        state.db.shutdown();
    }

    #[test]
    fn failover_outside_a_cluster_is_typed() {
        let (_dir, state) = setup();
        let service = lwc_admin(&state);
        let err = service
            .invoke("Failover", RequestKind::ReadWrite, &encode(&()).unwrap())
            .unwrap_err();
        assert_eq!(err, Error::Cluster(ClusterKind::NotInLocalWriteCluster));
        state.db.shutdown();
    }

    #[test]
    fn assembly_update_via_admin_is_idempotent() {
        let (_dir, state) = setup();
        let service = db_admin(&state);
        let archive = state.db.packed_assemblies().unwrap();
        let reply = service
            .invoke(
                "UpdateUserAssemblies",
                RequestKind::ReadWrite,
                &encode(&archive).unwrap(),
            )
            .unwrap();
        let reply: UpdateAssembliesReply = decode(&reply).unwrap();
        assert!(!reply.installed, "reinstalling the current bundle is a no-op");
        assert_eq!(reply.version_guid, state.db.model_guid().to_string());
        state.db.shutdown();
    }

    #[test]
    fn persistence_rejections_surface() {
        let (_dir, state) = setup();
        let service = db_admin(&state);
        let mut config = state.db.persistence();
        config.streams[0].name = "not-main".to_string();
        let err = service
            .invoke(
                "ApplyPersistenceConfiguration",
                RequestKind::ReadWrite,
                &encode(&config).unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        state.db.shutdown();
    }
}
