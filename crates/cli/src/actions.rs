//! Command execution.
//!
//! Each subcommand maps to one admin call or one edit of the working
//! configuration. Success prints to stdout; failures propagate to the
//! caller, which prints to stderr and sets the exit code.

use crate::state::SessionState;
use anyhow::{anyhow, bail, Result};
use clap::ArgMatches;
use helio_core::config::{
    ClusterConfig, ClusterElement, Endpoints, LocalWriteClusterConfig, LogStreamConfig, NodeConfig,
    PersistenceConfig, PortDefaults, WitnessConfig,
};
use helio_engine::admin::{UpdateAssembliesReply, DB_ADMIN, LWC_ADMIN, NODE_ADMIN};
use helio_replication::ElectionOutcome;
use std::path::Path;

/// Whether the command asked the session to end.
pub enum Flow {
    /// Keep going.
    Continue,
    /// Leave the interactive shell.
    Exit,
}

/// Execute one parsed command line.
pub fn execute(state: &mut SessionState, matches: &ArgMatches) -> Result<Flow> {
    if let Some(server) = matches.get_one::<String>("server") {
        state.server = Some(server.clone());
    }
    match matches.subcommand() {
        Some(("bind", m)) => {
            let address = m.get_one::<String>("address").expect("required");
            state.bind(address)?;
            println!("bound to {address}");
        }
        Some(("status", _)) => print_status(state)?,
        Some(("monitor", m)) => {
            let interval: u64 = m
                .get_one::<String>("interval-ms")
                .expect("defaulted")
                .parse()?;
            loop {
                print_status(state)?;
                std::thread::sleep(std::time::Duration::from_millis(interval));
            }
        }
        Some(("failover", _)) => {
            let outcome: ElectionOutcome = state.call(LWC_ADMIN, "Failover", &())?;
            println!("failover: {outcome:?}");
        }
        Some(("primary", m)) => {
            let confirm = m.get_flag("confirm");
            if !confirm {
                // The server refuses with SplitBrainRisk when the peer
                // site looks primary; surface its warning verbatim.
                if let Ok(peer_state) = state.node_state() {
                    if peer_state.roles.global
                        == helio_replication::GlobalWriteRole::PrimarySite
                    {
                        println!("note: this site already reports primary");
                    }
                }
            }
            state.call::<_, ()>(LWC_ADMIN, "BecomePrimary", &confirm)?;
            println!("site is now primary");
        }
        Some(("standby", _)) => {
            state.call::<_, ()>(LWC_ADMIN, "BecomeStandby", &())?;
            println!("site is now standby");
        }
        Some(("cluster-config", m)) => cluster_config(state, m)?,
        Some(("persist-config", m)) => persist_config(state, m)?,
        Some(("update-assemblies", m)) => {
            let file = m.get_one::<String>("file").expect("required");
            let archive = std::fs::read(file)?;
            let reply: UpdateAssembliesReply =
                state.call(DB_ADMIN, "UpdateUserAssemblies", &archive)?;
            if reply.installed {
                println!("installed; model version guid {}", reply.version_guid);
            } else {
                println!("no change; model version guid {}", reply.version_guid);
            }
        }
        Some(("get-assemblies", m)) => {
            let file = m.get_one::<String>("file").expect("required");
            let archive: Vec<u8> = state.call(DB_ADMIN, "GetUserAssemblies", &())?;
            std::fs::write(file, &archive)?;
            println!("wrote {} bytes to {file}", archive.len());
        }
        Some(("trace-level", m)) => {
            let level: u8 = m.get_one::<String>("level").expect("required").parse()?;
            state.call::<_, ()>(NODE_ADMIN, "SetTraceLevel", &level)?;
            println!("trace level set to {level}");
        }
        Some(("user-trace-level", m)) => {
            let level: u8 = m.get_one::<String>("level").expect("required").parse()?;
            state.call::<_, ()>(NODE_ADMIN, "SetUserTraceLevel", &level)?;
            println!("user trace level set to {level}");
        }
        Some(("exit", _)) => return Ok(Flow::Exit),
        Some((other, _)) => bail!("unknown command '{other}'"),
        None => bail!("no command given; try `help`"),
    }
    Ok(Flow::Continue)
}

fn print_status(state: &mut SessionState) -> Result<()> {
    let node = state.node_state()?;
    println!("node:              {}", node.node);
    println!("roles:             {:?}/{:?}", node.roles.local, node.roles.global);
    println!("write master:      {}", node.roles.write_master());
    println!("committed version: {}", node.committed_version);
    println!("live transactions: {}", node.live_transactions);
    if let Some(reachable) = node.witness_reachable {
        println!("witness reachable: {reachable}");
    }
    println!("model:             v{} ({})", node.model_version, node.model_guid);
    for replica in &node.replicas {
        println!(
            "replica {:<12} {:?} aligned={} applied={}",
            replica.name, replica.state, replica.aligned, replica.applied_version
        );
    }
    Ok(())
}

fn endpoints(host: &str, ports: PortDefaults) -> Endpoints {
    Endpoints {
        administration: format!("{host}:{}", ports.administration),
        execution: format!("{host}:{}", ports.execution),
        replication: format!("{host}:{}", ports.replication),
        election: format!("{host}:{}", ports.election),
    }
}

fn cluster_config(state: &mut SessionState, matches: &ArgMatches) -> Result<()> {
    let ports = PortDefaults::default();
    match matches.subcommand() {
        Some(("new", _)) => {
            state.cluster = None;
            println!("working configuration cleared");
        }
        Some(("load", m)) => {
            let file = m.get_one::<String>("file").expect("required");
            state.cluster = Some(ClusterConfig::load(Path::new(file))?);
            println!("loaded {file}");
        }
        Some(("save", m)) => {
            let file = m.get_one::<String>("file").expect("required");
            let config = state
                .cluster
                .as_ref()
                .ok_or_else(|| anyhow!("nothing to save; build or load a configuration first"))?;
            config.save(Path::new(file))?;
            println!("saved {file}");
        }
        Some(("show", _)) => match &state.cluster {
            Some(config) => println!("{}", serde_json::to_string_pretty(config)?),
            None => println!("(empty)"),
        },
        Some(("create-node", m)) => {
            let name = m.get_one::<String>("name").expect("required");
            let host = m.get_one::<String>("host").expect("required");
            state.cluster = Some(ClusterConfig::standalone(NodeConfig {
                name: name.clone(),
                endpoints: endpoints(host, ports),
                read_children: Vec::new(),
            }));
            println!("working configuration: standalone node '{name}'");
        }
        Some(("create-ha", m)) => {
            let name = m.get_one::<String>("name").expect("required");
            let first = m.get_one::<String>("first-host").expect("required");
            let second = m.get_one::<String>("second-host").expect("required");
            let witness_path = m.get_one::<String>("witness-path").expect("required");
            let election_timeout_ms: u64 = m
                .get_one::<String>("election-timeout-ms")
                .expect("defaulted")
                .parse()?;
            state.cluster = Some(ClusterConfig {
                cluster: ClusterElement::LocalWriteCluster(LocalWriteClusterConfig {
                    name: name.clone(),
                    first: NodeConfig {
                        name: format!("{name}-1"),
                        endpoints: endpoints(first, ports),
                        read_children: Vec::new(),
                    },
                    second: NodeConfig {
                        name: format!("{name}-2"),
                        endpoints: endpoints(second, ports),
                        read_children: Vec::new(),
                    },
                    witness: WitnessConfig::SharedFolderWitness {
                        path: witness_path.clone(),
                        remote_file_timeout_ms: 1000,
                    },
                    election_timeout_ms,
                    read_children: Vec::new(),
                }),
                port_defaults: ports,
            });
            println!("working configuration: HA cluster '{name}'");
        }
        Some(("delete", m)) => {
            let name = m.get_one::<String>("name").expect("required");
            let config = state
                .cluster
                .as_mut()
                .ok_or_else(|| anyhow!("no working configuration"))?;
            config.delete_element(name)?;
            println!("deleted '{name}'");
        }
        _ => unreachable!("subcommand required"),
    }
    Ok(())
}

fn persist_config(state: &mut SessionState, matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("create", m)) => {
            let stream = LogStreamConfig {
                name: m.get_one::<String>("name").expect("required").clone(),
                directory: m.get_one::<String>("directory").expect("required").clone(),
                snapshot_directory: m
                    .get_one::<String>("snapshot-directory")
                    .expect("required")
                    .clone(),
                max_size: m
                    .get_one::<String>("max-size")
                    .expect("defaulted")
                    .parse()?,
                packed: m.get_flag("packed"),
            };
            state.working_persistence()?.create_stream(stream)?;
            println!("stream added (apply to take effect)");
        }
        Some(("modify", m)) => {
            let name = m.get_one::<String>("name").expect("required").clone();
            let max_size = m
                .get_one::<String>("max-size")
                .map(|s| s.parse::<u64>())
                .transpose()?;
            let packed = m.get_one::<bool>("packed").copied();
            let config = state.working_persistence()?;
            let index = config
                .stream_index(&name)
                .ok_or_else(|| anyhow!("no stream named '{name}'"))?;
            if let Some(max_size) = max_size {
                config.streams[index].max_size = max_size;
            }
            if let Some(packed) = packed {
                config.streams[index].packed = packed;
            }
            config.streams[index].validate()?;
            println!("stream modified (apply to take effect)");
        }
        Some(("delete", m)) => {
            let name = m.get_one::<String>("name").expect("required").clone();
            state.working_persistence()?.delete_stream(&name)?;
            println!("stream deleted (apply to take effect)");
        }
        Some(("apply", _)) => {
            let config: PersistenceConfig = state
                .persistence
                .clone()
                .ok_or_else(|| anyhow!("nothing to apply; edit the configuration first"))?;
            state.call::<_, ()>(DB_ADMIN, "ApplyPersistenceConfiguration", &config)?;
            println!("persistence configuration applied");
        }
        _ => unreachable!("subcommand required"),
    }
    Ok(())
}
