//! Cluster wiring: election endpoint, peer links, witness clients, and
//! the standby tailing supervisor.
//!
//! Every node of a local-write cluster runs the same set of pieces; the
//! election decides which of them matter at any moment:
//! - the election service (heartbeats, promotion confirmation) on the
//!   election endpoint
//! - the replication hub serving the replication endpoint (only useful
//!   while Primary)
//! - the tailing client against the peer (only runs while Standby)

use crate::database::{Database, EngineApplier};
use helio_core::config::{NodeConfig, WitnessConfig};
use helio_core::error::Result;
use helio_core::types::Version;
use helio_replication::replica::{ReplicaClient, ReplicaConfig};
use helio_replication::{
    ElectionManager, ElectionOutcome, LocalWriteRole, PeerLink, SharedFolderWitness, Witness,
};
use helio_rpc::{ClientConfig, OpTableService, RequestKind, RpcClient, RpcServer, ServerConfig, ServiceRegistry};
use helio_rpc::envelope::{decode, encode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

/// Service name on the election endpoint.
pub const ELECTION_SERVICE: &str = "Election";

/// Service name hosted by a standalone witness process.
pub const WITNESS_SERVICE: &str = "Witness";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeartbeatArgs {
    from: String,
    role: LocalWriteRole,
    committed: Version,
}

/// Build the registry served on the election endpoint.
pub fn election_registry(election: Arc<ElectionManager>) -> Arc<ServiceRegistry> {
    let registry = Arc::new(ServiceRegistry::new());
    let hb = Arc::clone(&election);
    let confirm = Arc::clone(&election);
    let promote = election;
    registry.register(
        ELECTION_SERVICE,
        Arc::new(
            OpTableService::new()
                .with_op("Heartbeat", move |_, payload| {
                    let args: HeartbeatArgs = decode(payload)?;
                    hb.on_peer_heartbeat(args.role);
                    encode(&())
                })
                .with_op("ConfirmPromotion", move |_, payload| {
                    let from: String = decode(payload)?;
                    encode(&confirm.on_confirm_request(&from))
                })
                .with_op("RequestPromotion", move |_, _| {
                    encode(&(promote.try_become_primary() == ElectionOutcome::Success))
                }),
        ),
    );
    registry
}

/// Build the registry a standalone witness process serves.
pub fn witness_registry(witness: Arc<SharedFolderWitness>) -> Arc<ServiceRegistry> {
    let registry = Arc::new(ServiceRegistry::new());
    let claim = Arc::clone(&witness);
    let release = Arc::clone(&witness);
    let holder = witness;
    registry.register(
        WITNESS_SERVICE,
        Arc::new(
            OpTableService::new()
                .with_op("Claim", move |_, payload| {
                    let node: String = decode(payload)?;
                    encode(&claim.try_claim(&node)?)
                })
                .with_op("Release", move |_, payload| {
                    let node: String = decode(payload)?;
                    release.release(&node)?;
                    encode(&())
                })
                .with_op("Holder", move |_, _| encode(&holder.holder()?)),
        ),
    );
    registry
}

/// A pooled blocking RPC caller used by election-thread code.
struct BlockingCaller {
    runtime: Handle,
    addr: String,
    timeout: Duration,
    client: Mutex<Option<Arc<RpcClient>>>,
}

impl BlockingCaller {
    fn new(runtime: Handle, addr: &str, timeout: Duration) -> Self {
        BlockingCaller {
            runtime,
            addr: addr.to_string(),
            timeout,
            client: Mutex::new(None),
        }
    }

    fn call<A: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        service: &str,
        operation: &str,
        args: &A,
    ) -> Result<R> {
        let client = {
            let mut cached = self.client.lock();
            match cached.as_ref() {
                Some(c) => Arc::clone(c),
                None => {
                    let config = ClientConfig {
                        connect_timeout: self.timeout,
                        request_timeout: self.timeout,
                        ..ClientConfig::default()
                    };
                    let addr = self.addr.clone();
                    let fresh = self
                        .runtime
                        .block_on(async move { RpcClient::connect(&addr, config).await })?;
                    let fresh = Arc::new(fresh);
                    *cached = Some(Arc::clone(&fresh));
                    fresh
                }
            }
        };
        let result = self.runtime.block_on(async {
            client
                .call(service, operation, RequestKind::ReadWrite, args)
                .await
        });
        if result.is_err() {
            // Drop the broken connection; the next call redials.
            *self.client.lock() = None;
        }
        result
    }
}

/// Peer link over the peer's election endpoint.
pub struct RpcPeerLink {
    caller: BlockingCaller,
}

impl RpcPeerLink {
    /// Link to the peer at its election address.
    pub fn new(runtime: Handle, election_addr: &str, timeout: Duration) -> Self {
        RpcPeerLink {
            caller: BlockingCaller::new(runtime, election_addr, timeout),
        }
    }
}

impl PeerLink for RpcPeerLink {
    fn send_heartbeat(&self, from: &str, role: LocalWriteRole, committed: Version) -> Result<()> {
        self.caller.call(
            ELECTION_SERVICE,
            "Heartbeat",
            &HeartbeatArgs {
                from: from.to_string(),
                role,
                committed,
            },
        )
    }

    fn confirm_promotion(&self, from: &str) -> Result<bool> {
        self.caller
            .call(ELECTION_SERVICE, "ConfirmPromotion", &from.to_string())
    }

    fn request_promotion(&self) -> Result<()> {
        let _: bool = self
            .caller
            .call(ELECTION_SERVICE, "RequestPromotion", &())?;
        Ok(())
    }
}

/// Witness client against a standalone arbiter service.
pub struct StandaloneWitness {
    node_caller: BlockingCaller,
}

impl StandaloneWitness {
    /// Connect to the arbiter at `addr`.
    pub fn new(runtime: Handle, addr: &str, timeout: Duration) -> Self {
        StandaloneWitness {
            node_caller: BlockingCaller::new(runtime, addr, timeout),
        }
    }
}

impl Witness for StandaloneWitness {
    fn try_claim(&self, node: &str) -> Result<bool> {
        self.node_caller
            .call(WITNESS_SERVICE, "Claim", &node.to_string())
    }

    fn release(&self, node: &str) -> Result<()> {
        self.node_caller
            .call(WITNESS_SERVICE, "Release", &node.to_string())
    }

    fn holder(&self) -> Result<Option<String>> {
        self.node_caller.call(WITNESS_SERVICE, "Holder", &())
    }
}

/// A node's membership in its local-write cluster, fully wired.
pub struct ClusterRuntime {
    election: Arc<ElectionManager>,
    supervisor: tokio::task::JoinHandle<()>,
    election_server: tokio::task::JoinHandle<()>,
    replication_server: tokio::task::JoinHandle<()>,
}

impl ClusterRuntime {
    /// The election state machine.
    pub fn election(&self) -> &Arc<ElectionManager> {
        &self.election
    }

    /// Stop the cluster tasks.
    pub fn shutdown(&self) {
        self.election.shutdown();
        self.supervisor.abort();
        self.election_server.abort();
        self.replication_server.abort();
    }
}

/// Join a local-write cluster: start the election endpoint and driver,
/// serve the replication endpoint, and supervise standby tailing.
pub async fn join_local_cluster(
    db: Arc<Database>,
    me: &NodeConfig,
    peer: &NodeConfig,
    witness_config: &WitnessConfig,
    election_timeout: Duration,
    sync_replication: bool,
) -> Result<ClusterRuntime> {
    let runtime = Handle::current();
    let witness: Arc<dyn Witness> = match witness_config {
        WitnessConfig::SharedFolderWitness {
            path,
            remote_file_timeout_ms,
        } => Arc::new(SharedFolderWitness::new(
            std::path::Path::new(path),
            Duration::from_millis(*remote_file_timeout_ms),
        )),
        WitnessConfig::StandaloneWitness { address } => Arc::new(StandaloneWitness::new(
            runtime.clone(),
            address,
            election_timeout / 2,
        )),
    };

    let peer_link = Arc::new(RpcPeerLink::new(
        runtime.clone(),
        &peer.endpoints.election,
        election_timeout / 4,
    ));
    // Capture the manager, not the database: the database owns the
    // election manager, and this closure lives inside it.
    let committed = {
        let manager = Arc::clone(db.manager());
        Arc::new(move || manager.current_version())
    };
    let election = ElectionManager::new(
        &me.name,
        Arc::clone(&witness),
        peer_link,
        election_timeout,
        committed,
    );
    db.set_election(Arc::clone(&election), witness);

    // Election endpoint.
    let (election_server, _) = RpcServer::new(
        election_registry(Arc::clone(&election)),
        ServerConfig::default(),
    )
    .serve(&me.endpoints.election)
    .await?;

    // Replication endpoint: the hub serves whenever we are Primary; a
    // connected peer that is itself Primary simply never dials us.
    db.hub().register_replica(&peer.name, sync_replication);
    let (replication_server, _) = Arc::clone(db.hub())
        .serve(&me.endpoints.replication)
        .await?;

    // Drive heartbeats and elections.
    let driver_interval = (election_timeout / 10).max(Duration::from_millis(20));
    election.start(driver_interval);

    // Supervise the standby tailing task against the peer.
    let supervisor = {
        let db = Arc::clone(&db);
        let election = Arc::clone(&election);
        let peer_replication = peer.endpoints.replication.clone();
        let me_name = me.name.clone();
        tokio::spawn(async move {
            let mut tailer: Option<Arc<std::sync::atomic::AtomicBool>> = None;
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                match election.role() {
                    LocalWriteRole::Standby => {
                        let dead = tailer
                            .as_ref()
                            .map(|t| t.load(Ordering::Relaxed))
                            .unwrap_or(true);
                        if dead {
                            info!(source = %peer_replication, "starting standby tailing");
                            let client = ReplicaClient::new(
                                ReplicaConfig {
                                    node: me_name.clone(),
                                    source_addr: peer_replication.clone(),
                                    ack_interval: Duration::from_millis(100),
                                    reconnect_delay: Duration::from_millis(250),
                                },
                                Arc::new(EngineApplier(Arc::clone(&db))),
                            );
                            tailer = Some(client.shutdown_handle());
                            client.spawn();
                        }
                    }
                    LocalWriteRole::Primary | LocalWriteRole::None => {
                        if let Some(handle) = tailer.take() {
                            info!("stopping standby tailing");
                            handle.store(true, Ordering::Relaxed);
                        }
                    }
                }
            }
        })
    };

    Ok(ClusterRuntime {
        election,
        supervisor,
        election_server,
        replication_server,
    })
}

/// Probe a remote node's global-write role through its admin endpoint.
/// Used by `become_primary`'s split-brain check.
pub fn probe_peer_site(
    runtime: Handle,
    admin_addr: &str,
    timeout: Duration,
) -> crate::admin::PeerSiteProbe {
    let caller = Arc::new(BlockingCaller::new(runtime, admin_addr, timeout));
    Arc::new(move || {
        let state: crate::node_state::NodeState = caller
            .call(crate::admin::NODE_ADMIN, "GetNodeState", &())
            .ok()?;
        Some(state.roles.global)
    })
}

