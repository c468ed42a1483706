//! HelioDB server bootstrap.
//!
//! Loads the cluster configuration file, opens the database for the named
//! node, serves the administration and execution endpoints, and, when the
//! node is a member of a local-write cluster, joins the election and
//! replication machinery. Runs until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use helio_core::config::{ClusterConfig, ClusterElement, GlobalMember, NodeConfig};
use helio_core::model::ModelDescriptor;
use helio_engine::admin::{admin_registry, AdminState};
use helio_engine::cluster::{join_local_cluster, probe_peer_site};
use helio_engine::{AssemblyBundle, Database, DatabaseConfig};
use helio_rpc::{RpcServer, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "helio-server", about = "HelioDB server")]
struct Args {
    /// Cluster configuration file. Omit for a standalone node.
    #[arg(long)]
    config: Option<PathBuf>,

    /// This node's name, as it appears in the cluster file.
    #[arg(long, default_value = "node")]
    node: String,

    /// Data directory.
    #[arg(long, default_value = "./helio-data")]
    data: PathBuf,

    /// Take a snapshot this often, in seconds. 0 disables.
    #[arg(long, default_value = "300")]
    snapshot_interval_secs: u64,
}

/// Where this node sits in the configured topology.
struct Placement {
    me: NodeConfig,
    lwc: Option<LwcPlacement>,
    global_peer_admin: Option<String>,
    global_sync: bool,
    /// Read-only children this node feeds.
    read_children: Vec<String>,
    /// The replication endpoint this node tails when it is itself a
    /// read-only child.
    tail_source: Option<String>,
}

struct LwcPlacement {
    peer: NodeConfig,
    witness: helio_core::config::WitnessConfig,
    election_timeout: Duration,
}

fn locate(config: &ClusterConfig, node: &str) -> Result<Placement> {
    let me = config
        .find_node(node)
        .with_context(|| format!("node '{node}' is not in the cluster configuration"))?
        .clone();

    let mut placement = Placement {
        me,
        lwc: None,
        global_peer_admin: None,
        global_sync: false,
        read_children: Vec::new(),
        tail_source: None,
    };

    match &config.cluster {
        ClusterElement::Node(_) => {}
        ClusterElement::LocalWriteCluster(lwc) => {
            placement.lwc = lwc_placement(lwc, node);
        }
        ClusterElement::GlobalWriteCluster(gwc) => {
            placement.global_sync = gwc.synchronous_replication;
            for (member, other) in [(&gwc.first, &gwc.second), (&gwc.second, &gwc.first)] {
                let contains_me = match member.as_ref() {
                    GlobalMember::Node(n) => n.name == node,
                    GlobalMember::LocalWriteCluster(lwc) => {
                        lwc.first.name == node || lwc.second.name == node
                    }
                };
                if contains_me {
                    if let GlobalMember::LocalWriteCluster(lwc) = member.as_ref() {
                        placement.lwc = lwc_placement(lwc, node);
                    }
                    placement.global_peer_admin = Some(match other.as_ref() {
                        GlobalMember::Node(n) => n.endpoints.administration.clone(),
                        GlobalMember::LocalWriteCluster(lwc) => {
                            lwc.first.endpoints.administration.clone()
                        }
                    });
                }
            }
        }
    }
    // Read-only replication edges: every (source node, read child) pair in
    // the tree. Cluster-level read children tail the first member; after a
    // failover the child's reconnect loop finds the survivor through the
    // same address once the collapsed configuration is rolled out.
    let mut edges: Vec<(String, NodeConfig)> = Vec::new();
    fn node_edges(owner: &NodeConfig, edges: &mut Vec<(String, NodeConfig)>) {
        for child in &owner.read_children {
            edges.push((owner.endpoints.replication.clone(), child.clone()));
            node_edges(child, edges);
        }
    }
    fn lwc_edges(
        lwc: &helio_core::config::LocalWriteClusterConfig,
        edges: &mut Vec<(String, NodeConfig)>,
    ) {
        node_edges(&lwc.first, edges);
        node_edges(&lwc.second, edges);
        for child in &lwc.read_children {
            edges.push((lwc.first.endpoints.replication.clone(), child.clone()));
            node_edges(child, edges);
        }
    }
    match &config.cluster {
        ClusterElement::Node(n) => node_edges(n, &mut edges),
        ClusterElement::LocalWriteCluster(lwc) => lwc_edges(lwc, &mut edges),
        ClusterElement::GlobalWriteCluster(gwc) => {
            for member in [&gwc.first, &gwc.second] {
                match member.as_ref() {
                    GlobalMember::Node(n) => node_edges(n, &mut edges),
                    GlobalMember::LocalWriteCluster(lwc) => lwc_edges(lwc, &mut edges),
                }
            }
        }
    }
    for (source, child) in &edges {
        if source == &placement.me.endpoints.replication {
            placement.read_children.push(child.name.clone());
        }
        if child.name == node {
            placement.tail_source = Some(source.clone());
        }
    }

    Ok(placement)
}

fn lwc_placement(
    lwc: &helio_core::config::LocalWriteClusterConfig,
    node: &str,
) -> Option<LwcPlacement> {
    let peer = if lwc.first.name == node {
        lwc.second.clone()
    } else if lwc.second.name == node {
        lwc.first.clone()
    } else {
        return None;
    };
    Some(LwcPlacement {
        peer,
        witness: lwc.witness.clone(),
        election_timeout: Duration::from_millis(lwc.election_timeout_ms),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let (cluster_config, placement) = match &args.config {
        Some(path) => {
            let config = ClusterConfig::load(path)?;
            let placement = locate(&config, &args.node)?;
            (Some(config), Some(placement))
        }
        None => (None, None),
    };

    let mut db_config = DatabaseConfig::standalone(&args.node, &args.data);
    db_config.snapshot_interval = match args.snapshot_interval_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    if let Some(placement) = &placement {
        db_config.hub.synchronous = placement.lwc.is_some() || placement.global_sync;
    }

    let db = Database::open(
        db_config,
        AssemblyBundle::for_model(ModelDescriptor::empty()),
    )?;
    info!(node = %args.node, "database open");

    // Administration endpoint.
    let admin_state = AdminState::new(Arc::clone(&db));
    if let Some(config) = cluster_config.clone() {
        admin_state.set_cluster_config(config);
    }
    let admin_addr = placement
        .as_ref()
        .map(|p| p.me.endpoints.administration.clone())
        .unwrap_or_else(|| "127.0.0.1:7568".to_string());
    let (admin_task, bound_admin) = RpcServer::new(admin_registry(&admin_state), ServerConfig::default())
        .serve(&admin_addr)
        .await?;
    info!(%bound_admin, "administration endpoint up");

    // Execution endpoint.
    let exec_addr = placement
        .as_ref()
        .map(|p| p.me.endpoints.execution.clone())
        .unwrap_or_else(|| "127.0.0.1:7569".to_string());
    let (exec_task, bound_exec) = RpcServer::new(db.execution_registry(), ServerConfig::default())
        .serve(&exec_addr)
        .await?;
    info!(%bound_exec, "execution endpoint up");

    // Read-only replication: feed registered children, tail the source
    // when this node is itself a read-only child.
    if let Some(placement) = &placement {
        for child in &placement.read_children {
            db.hub().register_replica(child, false);
        }
        if !placement.read_children.is_empty() && placement.lwc.is_none() {
            let (_task, bound) = Arc::clone(db.hub())
                .serve(&placement.me.endpoints.replication)
                .await?;
            info!(%bound, "replication endpoint up");
        }
        if let Some(source) = &placement.tail_source {
            db.set_read_only(true);
            let tailer = helio_replication::replica::ReplicaClient::new(
                helio_replication::replica::ReplicaConfig {
                    node: args.node.clone(),
                    source_addr: source.clone(),
                    ack_interval: Duration::from_millis(200),
                    reconnect_delay: Duration::from_millis(500),
                },
                Arc::new(helio_engine::EngineApplier(Arc::clone(&db))),
            );
            tailer.spawn();
            info!(%source, "tailing replication source");
        }
    }

    // Cluster membership.
    let mut cluster_runtime = None;
    if let Some(placement) = &placement {
        if let Some(lwc) = &placement.lwc {
            let runtime = join_local_cluster(
                Arc::clone(&db),
                &placement.me,
                &lwc.peer,
                &lwc.witness,
                lwc.election_timeout,
                true,
            )
            .await?;
            info!(peer = %lwc.peer.name, "joined local-write cluster");
            cluster_runtime = Some(runtime);
        }
        if let Some(peer_admin) = &placement.global_peer_admin {
            admin_state.set_peer_site_probe(probe_peer_site(
                tokio::runtime::Handle::current(),
                peer_admin,
                Duration::from_secs(2),
            ));
            // Federated sites come up standby; the operator promotes one.
            db.global_role()
                .set_initial_role(helio_replication::GlobalWriteRole::StandbySite);
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    if let Some(runtime) = &cluster_runtime {
        runtime.shutdown();
    }
    admin_task.abort();
    exec_task.abort();
    db.shutdown();
    Ok(())
}
