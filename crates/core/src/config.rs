//! Persistence and cluster configuration models.
//!
//! Persistence configuration lives inside the engine and is updated through
//! the administration surface as a regular transaction. The cluster
//! configuration is a single schema-validated text file (JSON) shared by
//! every node of a cluster.

use crate::error::{ClusterKind, ConfigKind, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Upper bound on configured log streams.
pub const MAX_LOG_STREAMS: usize = 8;

/// Name of the implicit system stream. Stream 0 always exists and cannot be
/// deleted.
pub const MAIN_LOG_NAME: &str = "main";

/// Maximum log stream name length.
pub const MAX_LOG_NAME_LEN: usize = 64;

/// Maximum directory length, including the stream name.
pub const MAX_LOG_PATH_LEN: usize = 200;

/// Template expanded to the node name inside configured directories.
pub const NODE_NAME_TEMPLATE: &str = "${NodeName}";

fn valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | ' ' | '_' | '-' | ':')
}

fn valid_path_char(c: char) -> bool {
    valid_name_char(c) || matches!(c, '/' | '\\' | '$' | '{' | '}')
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_LOG_NAME_LEN || !name.chars().all(valid_name_char) {
        return Err(Error::Configuration(ConfigKind::InvalidName(
            name.to_string(),
        )));
    }
    Ok(())
}

fn validate_path(name: &str, path: &str) -> Result<()> {
    if path.is_empty() || name.len() + path.len() > MAX_LOG_PATH_LEN {
        return Err(Error::Configuration(ConfigKind::InvalidPath(
            path.to_string(),
        )));
    }
    // Only the literal template may use '$', '{', '}'.
    let stripped = path.replace(NODE_NAME_TEMPLATE, "");
    if stripped.chars().any(|c| matches!(c, '$' | '{' | '}')) || !path.chars().all(valid_path_char)
    {
        return Err(Error::Configuration(ConfigKind::InvalidPath(
            path.to_string(),
        )));
    }
    Ok(())
}

/// Expand the `${NodeName}` template in a configured directory.
pub fn expand_node_name(path: &str, node_name: &str) -> String {
    path.replace(NODE_NAME_TEMPLATE, node_name)
}

/// One append-only log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStreamConfig {
    /// Stream name, unique within the persistence configuration.
    pub name: String,
    /// Directory holding the log segments.
    pub directory: String,
    /// Directory holding snapshots.
    pub snapshot_directory: String,
    /// Size hint in bytes after which segments rotate.
    pub max_size: u64,
    /// Compress record payloads.
    pub packed: bool,
}

impl LogStreamConfig {
    /// The main system stream rooted at `base`.
    pub fn main(base: &str) -> Self {
        LogStreamConfig {
            name: MAIN_LOG_NAME.to_string(),
            directory: format!("{base}/log"),
            snapshot_directory: format!("{base}/snapshot"),
            max_size: 64 << 20,
            packed: false,
        }
    }

    /// Validate name and path constraints.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_path(&self.name, &self.directory)?;
        validate_path(&self.name, &self.snapshot_directory)?;
        if self.max_size == 0 {
            return Err(Error::Configuration(ConfigKind::OutOfRange {
                field: format!("{}.max_size", self.name),
            }));
        }
        Ok(())
    }
}

/// The complete persistence configuration: stream 0 is always the main
/// stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Configured streams, main first.
    pub streams: Vec<LogStreamConfig>,
}

impl PersistenceConfig {
    /// A configuration with just the main stream.
    pub fn main_only(base: &str) -> Self {
        PersistenceConfig {
            streams: vec![LogStreamConfig::main(base)],
        }
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<()> {
        if self.streams.len() > MAX_LOG_STREAMS {
            return Err(Error::Configuration(ConfigKind::TooManyLogs(
                MAX_LOG_STREAMS,
            )));
        }
        if self.streams.first().map(|s| s.name.as_str()) != Some(MAIN_LOG_NAME) {
            return Err(Error::Configuration(ConfigKind::InvalidName(
                "stream 0 must be 'main'".to_string(),
            )));
        }
        for stream in &self.streams {
            stream.validate()?;
        }
        for (i, stream) in self.streams.iter().enumerate() {
            if self.streams[..i].iter().any(|s| s.name == stream.name) {
                return Err(Error::Configuration(ConfigKind::DuplicateName(
                    stream.name.clone(),
                )));
            }
        }
        Ok(())
    }

    /// Index of a stream by name.
    pub fn stream_index(&self, name: &str) -> Option<usize> {
        self.streams.iter().position(|s| s.name == name)
    }

    /// Add a stream, enforcing the count limit and name uniqueness.
    pub fn create_stream(&mut self, stream: LogStreamConfig) -> Result<()> {
        stream.validate()?;
        if self.streams.len() >= MAX_LOG_STREAMS {
            return Err(Error::Configuration(ConfigKind::TooManyLogs(
                MAX_LOG_STREAMS,
            )));
        }
        if self.stream_index(&stream.name).is_some() {
            return Err(Error::Configuration(ConfigKind::DuplicateName(stream.name)));
        }
        self.streams.push(stream);
        Ok(())
    }

    /// Delete a stream by name. The main stream cannot be deleted.
    pub fn delete_stream(&mut self, name: &str) -> Result<()> {
        if name == MAIN_LOG_NAME {
            return Err(Error::InvalidArgument {
                field: "name".to_string(),
                reason: "the main log stream cannot be deleted".to_string(),
            });
        }
        match self.stream_index(name) {
            Some(i) => {
                self.streams.remove(i);
                Ok(())
            }
            None => Err(Error::NotFound(crate::error::NotFoundKind::LogStream(
                name.to_string(),
            ))),
        }
    }
}

/// The four endpoint addresses every node exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Administration service address.
    pub administration: String,
    /// Execution (client RPC) address.
    pub execution: String,
    /// Replication stream address.
    pub replication: String,
    /// Election/heartbeat address.
    pub election: String,
}

/// Default ports applied when an endpoint omits one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDefaults {
    /// Administration port.
    pub administration: u16,
    /// Execution port.
    pub execution: u16,
    /// Replication port.
    pub replication: u16,
    /// Election port.
    pub election: u16,
}

impl Default for PortDefaults {
    fn default() -> Self {
        PortDefaults {
            administration: 7568,
            execution: 7569,
            replication: 7570,
            election: 7571,
        }
    }
}

/// The external arbiter a local-write cluster uses to avoid split-brain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum WitnessConfig {
    /// A witness service at a fixed address.
    StandaloneWitness {
        /// Witness address.
        address: String,
    },
    /// A shared folder reachable from both members.
    SharedFolderWitness {
        /// Shared folder path.
        path: String,
        /// Bound on remote file operations, in milliseconds.
        remote_file_timeout_ms: u64,
    },
}

/// A single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name, unique within the cluster file.
    pub name: String,
    /// The node's endpoints.
    pub endpoints: Endpoints,
    /// Read-only children receiving replication from this node.
    #[serde(default)]
    pub read_children: Vec<NodeConfig>,
}

/// A two-node HA cluster with witness-arbitrated failover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalWriteClusterConfig {
    /// Cluster name.
    pub name: String,
    /// First member.
    pub first: NodeConfig,
    /// Second member.
    pub second: NodeConfig,
    /// The witness arbiter.
    pub witness: WitnessConfig,
    /// Election timeout in milliseconds.
    pub election_timeout_ms: u64,
    /// Read-only children receiving replication from the cluster primary.
    #[serde(default)]
    pub read_children: Vec<NodeConfig>,
}

/// A member of a global-write cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum GlobalMember {
    /// A standalone node site.
    Node(NodeConfig),
    /// An HA cluster site.
    LocalWriteCluster(LocalWriteClusterConfig),
}

impl GlobalMember {
    fn name(&self) -> &str {
        match self {
            GlobalMember::Node(n) => &n.name,
            GlobalMember::LocalWriteCluster(c) => &c.name,
        }
    }
}

/// Two sites federated under manual role control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalWriteClusterConfig {
    /// Cluster name.
    pub name: String,
    /// First site.
    pub first: Box<GlobalMember>,
    /// Second site.
    pub second: Box<GlobalMember>,
    /// Whether cross-site replication is synchronous.
    pub synchronous_replication: bool,
    /// Read-only children receiving replication from the primary site.
    #[serde(default)]
    pub read_children: Vec<NodeConfig>,
}

/// The root element of the cluster file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ClusterElement {
    /// A standalone node.
    Node(NodeConfig),
    /// A two-node HA cluster.
    LocalWriteCluster(LocalWriteClusterConfig),
    /// A two-site global-write cluster.
    GlobalWriteCluster(GlobalWriteClusterConfig),
}

/// The cluster configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// The topology root.
    pub cluster: ClusterElement,
    /// Ports used when an endpoint omits one.
    #[serde(default = "PortDefaults::default")]
    pub port_defaults: PortDefaults,
}

impl ClusterConfig {
    /// A single standalone node.
    pub fn standalone(node: NodeConfig) -> Self {
        ClusterConfig {
            cluster: ClusterElement::Node(node),
            port_defaults: PortDefaults::default(),
        }
    }

    /// Parse and validate a cluster file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: ClusterConfig = serde_json::from_str(&text)
            .map_err(|e| Error::Serialization(format!("cluster config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to the cluster file.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Enforce the configuration-time topology invariants.
    pub fn validate(&self) -> Result<()> {
        let mut names = Vec::new();
        collect_names(&self.cluster, &mut names);
        for (i, name) in names.iter().enumerate() {
            if name.is_empty() {
                return Err(Error::Configuration(ConfigKind::InvalidName(String::new())));
            }
            if names[..i].contains(name) {
                return Err(Error::Configuration(ConfigKind::DuplicateName(
                    name.clone(),
                )));
            }
        }
        if let ClusterElement::LocalWriteCluster(lwc) = &self.cluster {
            validate_lwc(lwc)?;
        }
        if let ClusterElement::GlobalWriteCluster(gwc) = &self.cluster {
            for member in [&gwc.first, &gwc.second] {
                if let GlobalMember::LocalWriteCluster(lwc) = member.as_ref() {
                    validate_lwc(lwc)?;
                }
            }
        }
        Ok(())
    }

    /// Find the node config for `node_name` anywhere in the tree.
    pub fn find_node(&self, node_name: &str) -> Option<&NodeConfig> {
        fn walk<'a>(element: &'a ClusterElement, name: &str) -> Option<&'a NodeConfig> {
            match element {
                ClusterElement::Node(n) => find_in_node(n, name),
                ClusterElement::LocalWriteCluster(lwc) => find_in_lwc(lwc, name),
                ClusterElement::GlobalWriteCluster(gwc) => {
                    for member in [&gwc.first, &gwc.second] {
                        let hit = match member.as_ref() {
                            GlobalMember::Node(n) => find_in_node(n, name),
                            GlobalMember::LocalWriteCluster(lwc) => find_in_lwc(lwc, name),
                        };
                        if hit.is_some() {
                            return hit;
                        }
                    }
                    gwc.read_children.iter().find_map(|c| find_in_node(c, name))
                }
            }
        }
        fn find_in_node<'a>(node: &'a NodeConfig, name: &str) -> Option<&'a NodeConfig> {
            if node.name == name {
                return Some(node);
            }
            node.read_children.iter().find_map(|c| find_in_node(c, name))
        }
        fn find_in_lwc<'a>(lwc: &'a LocalWriteClusterConfig, name: &str) -> Option<&'a NodeConfig> {
            find_in_node(&lwc.first, name)
                .or_else(|| find_in_node(&lwc.second, name))
                .or_else(|| lwc.read_children.iter().find_map(|c| find_in_node(c, name)))
        }
        walk(&self.cluster, node_name)
    }

    /// Delete an element by name. Deleting a member of a local-write
    /// cluster collapses the cluster to the surviving node, which keeps its
    /// addresses and read children. An element that feeds replication to
    /// read children cannot be deleted.
    pub fn delete_element(&mut self, name: &str) -> Result<()> {
        match &mut self.cluster {
            ClusterElement::Node(node) => {
                if node.name == name {
                    return Err(Error::InvalidArgument {
                        field: "name".to_string(),
                        reason: "cannot delete the topology root".to_string(),
                    });
                }
                delete_read_child(&mut node.read_children, name)
            }
            ClusterElement::LocalWriteCluster(lwc) => {
                if lwc.first.name == name || lwc.second.name == name {
                    let doomed = if lwc.first.name == name {
                        &lwc.first
                    } else {
                        &lwc.second
                    };
                    if !doomed.read_children.is_empty() {
                        return Err(Error::Cluster(ClusterKind::NotApplicable));
                    }
                    let survivor = if lwc.first.name == name {
                        lwc.second.clone()
                    } else {
                        lwc.first.clone()
                    };
                    let mut collapsed = survivor;
                    collapsed.read_children.extend(lwc.read_children.clone());
                    self.cluster = ClusterElement::Node(collapsed);
                    Ok(())
                } else {
                    delete_read_child(&mut lwc.read_children, name)
                        .or_else(|_| delete_read_child(&mut lwc.first.read_children, name))
                        .or_else(|_| delete_read_child(&mut lwc.second.read_children, name))
                }
            }
            ClusterElement::GlobalWriteCluster(gwc) => {
                if gwc.first.name() == name || gwc.second.name() == name {
                    // A global-write cluster must keep exactly two members.
                    return Err(Error::Cluster(ClusterKind::NotApplicable));
                }
                delete_read_child(&mut gwc.read_children, name)
            }
        }
    }
}

fn delete_read_child(children: &mut Vec<NodeConfig>, name: &str) -> Result<()> {
    if let Some(i) = children.iter().position(|c| c.name == name) {
        if !children[i].read_children.is_empty() {
            // Still the replication source of its own children.
            return Err(Error::Cluster(ClusterKind::NotApplicable));
        }
        children.remove(i);
        return Ok(());
    }
    for child in children.iter_mut() {
        if delete_read_child(&mut child.read_children, name).is_ok() {
            return Ok(());
        }
    }
    Err(Error::NotFound(crate::error::NotFoundKind::LogStream(
        name.to_string(),
    )))
}

fn validate_lwc(lwc: &LocalWriteClusterConfig) -> Result<()> {
    if lwc.first.name == lwc.second.name {
        return Err(Error::Configuration(ConfigKind::DuplicateName(
            lwc.first.name.clone(),
        )));
    }
    if lwc.election_timeout_ms == 0 {
        return Err(Error::Configuration(ConfigKind::OutOfRange {
            field: format!("{}.election_timeout_ms", lwc.name),
        }));
    }
    Ok(())
}

fn collect_names(element: &ClusterElement, names: &mut Vec<String>) {
    fn node_names(node: &NodeConfig, names: &mut Vec<String>) {
        names.push(node.name.clone());
        for c in &node.read_children {
            node_names(c, names);
        }
    }
    fn lwc_names(lwc: &LocalWriteClusterConfig, names: &mut Vec<String>) {
        names.push(lwc.name.clone());
        node_names(&lwc.first, names);
        node_names(&lwc.second, names);
        for c in &lwc.read_children {
            node_names(c, names);
        }
    }
    match element {
        ClusterElement::Node(n) => node_names(n, names),
        ClusterElement::LocalWriteCluster(lwc) => lwc_names(lwc, names),
        ClusterElement::GlobalWriteCluster(gwc) => {
            names.push(gwc.name.clone());
            for member in [&gwc.first, &gwc.second] {
                match member.as_ref() {
                    GlobalMember::Node(n) => node_names(n, names),
                    GlobalMember::LocalWriteCluster(lwc) => lwc_names(lwc, names),
                }
            }
            for c in &gwc.read_children {
                node_names(c, names);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeConfig {
        NodeConfig {
            name: name.to_string(),
            endpoints: Endpoints {
                administration: format!("{name}:7568"),
                execution: format!("{name}:7569"),
                replication: format!("{name}:7570"),
                election: format!("{name}:7571"),
            },
            read_children: Vec::new(),
        }
    }

    fn ha(name: &str, a: &str, b: &str) -> LocalWriteClusterConfig {
        LocalWriteClusterConfig {
            name: name.to_string(),
            first: node(a),
            second: node(b),
            witness: WitnessConfig::SharedFolderWitness {
                path: "/mnt/witness".to_string(),
                remote_file_timeout_ms: 1000,
            },
            election_timeout_ms: 2000,
            read_children: Vec::new(),
        }
    }

    // === Persistence configuration ===

    #[test]
    fn main_only_config_is_valid() {
        PersistenceConfig::main_only("/data").validate().unwrap();
    }

    #[test]
    fn ninth_stream_is_rejected() {
        let mut config = PersistenceConfig::main_only("/data");
        for i in 1..MAX_LOG_STREAMS {
            config
                .create_stream(LogStreamConfig {
                    name: format!("stream{i}"),
                    directory: format!("/data/log{i}"),
                    snapshot_directory: format!("/data/snap{i}"),
                    max_size: 1 << 20,
                    packed: false,
                })
                .unwrap();
        }
        let ninth = LogStreamConfig {
            name: "overflow".to_string(),
            directory: "/data/log9".to_string(),
            snapshot_directory: "/data/snap9".to_string(),
            max_size: 1 << 20,
            packed: false,
        };
        assert_eq!(
            config.create_stream(ninth),
            Err(Error::Configuration(ConfigKind::TooManyLogs(MAX_LOG_STREAMS)))
        );
    }

    #[test]
    fn main_stream_cannot_be_deleted() {
        let mut config = PersistenceConfig::main_only("/data");
        assert!(matches!(
            config.delete_stream(MAIN_LOG_NAME),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn name_charset_is_enforced() {
        let mut stream = LogStreamConfig::main("/data");
        stream.name = "bad*name".to_string();
        assert!(matches!(
            stream.validate(),
            Err(Error::Configuration(ConfigKind::InvalidName(_)))
        ));
    }

    #[test]
    fn node_name_template_is_allowed_in_paths() {
        let mut stream = LogStreamConfig::main("/data");
        stream.directory = "/data/${NodeName}/log".to_string();
        stream.validate().unwrap();
        assert_eq!(
            expand_node_name(&stream.directory, "n1"),
            "/data/n1/log"
        );
        // Stray template characters outside the literal form are rejected.
        stream.directory = "/data/${Other}/log".to_string();
        assert!(stream.validate().is_err());
    }

    #[test]
    fn path_length_limit_includes_name() {
        let mut stream = LogStreamConfig::main("/data");
        stream.directory = "d".repeat(MAX_LOG_PATH_LEN - stream.name.len() + 1);
        assert!(matches!(
            stream.validate(),
            Err(Error::Configuration(ConfigKind::InvalidPath(_)))
        ));
    }

    // === Cluster configuration ===

    #[test]
    fn ha_cluster_validates() {
        let config = ClusterConfig {
            cluster: ClusterElement::LocalWriteCluster(ha("ha", "n1", "n2")),
            port_defaults: PortDefaults::default(),
        };
        config.validate().unwrap();
        assert!(config.find_node("n2").is_some());
        assert!(config.find_node("missing").is_none());
    }

    #[test]
    fn duplicate_member_names_rejected() {
        let config = ClusterConfig {
            cluster: ClusterElement::LocalWriteCluster(ha("ha", "n1", "n1")),
            port_defaults: PortDefaults::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn deleting_ha_member_collapses_to_node() {
        let mut lwc = ha("ha", "n1", "n2");
        lwc.read_children.push(node("reader"));
        let mut config = ClusterConfig {
            cluster: ClusterElement::LocalWriteCluster(lwc),
            port_defaults: PortDefaults::default(),
        };
        config.delete_element("n1").unwrap();
        match &config.cluster {
            ClusterElement::Node(n) => {
                assert_eq!(n.name, "n2");
                assert_eq!(n.endpoints.execution, "n2:7569");
                assert_eq!(n.read_children.len(), 1);
                assert_eq!(n.read_children[0].name, "reader");
            }
            other => panic!("expected collapse to node, got {other:?}"),
        }
    }

    #[test]
    fn replication_source_cannot_be_deleted() {
        let mut parent = node("parent");
        parent.read_children.push(node("child"));
        let mut root = node("root");
        root.read_children.push(parent);
        let mut config = ClusterConfig::standalone(root);
        assert_eq!(
            config.delete_element("parent"),
            Err(Error::Cluster(ClusterKind::NotApplicable))
        );
        config.delete_element("child").unwrap();
        config.delete_element("parent").unwrap();
    }

    #[test]
    fn global_member_cannot_be_deleted() {
        let mut config = ClusterConfig {
            cluster: ClusterElement::GlobalWriteCluster(GlobalWriteClusterConfig {
                name: "global".to_string(),
                first: Box::new(GlobalMember::LocalWriteCluster(ha("site-a", "a1", "a2"))),
                second: Box::new(GlobalMember::Node(node("site-b"))),
                synchronous_replication: true,
                read_children: Vec::new(),
            }),
            port_defaults: PortDefaults::default(),
        };
        config.validate().unwrap();
        assert_eq!(
            config.delete_element("site-a"),
            Err(Error::Cluster(ClusterKind::NotApplicable))
        );
    }

    #[test]
    fn config_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        let config = ClusterConfig {
            cluster: ClusterElement::LocalWriteCluster(ha("ha", "n1", "n2")),
            port_defaults: PortDefaults::default(),
        };
        config.save(&path).unwrap();
        let loaded = ClusterConfig::load(&path).unwrap();
        assert_eq!(config, loaded);
    }
}
