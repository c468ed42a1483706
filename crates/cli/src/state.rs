//! Session state shared by shell and REPL modes.

use anyhow::{bail, Result};
use helio_core::config::{ClusterConfig, PersistenceConfig};
use helio_engine::admin::{DB_ADMIN, NODE_ADMIN};
use helio_engine::NodeState;
use helio_rpc::{ClientConfig, RequestKind, RpcClient};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Everything a CLI session carries between commands.
pub struct SessionState {
    runtime: Runtime,
    /// Bound administration endpoint.
    pub server: Option<String>,
    client: Option<RpcClient>,
    /// The cluster configuration being edited.
    pub cluster: Option<ClusterConfig>,
    /// The persistence configuration being edited.
    pub persistence: Option<PersistenceConfig>,
}

impl SessionState {
    /// A fresh session, optionally pre-bound to a server.
    pub fn new(server: Option<String>) -> Result<Self> {
        Ok(SessionState {
            runtime: Runtime::new()?,
            server,
            client: None,
            cluster: None,
            persistence: None,
        })
    }

    /// The REPL prompt, reflecting the bound server.
    pub fn prompt(&self) -> String {
        match &self.server {
            Some(server) => format!("helio {server}> "),
            None => "helio> ".to_string(),
        }
    }

    /// Bind to an administration endpoint.
    pub fn bind(&mut self, address: &str) -> Result<()> {
        self.server = Some(address.to_string());
        self.client = None;
        // Connect eagerly so a bad address fails here, not on first use.
        self.ensure_client()?;
        Ok(())
    }

    fn ensure_client(&mut self) -> Result<&RpcClient> {
        if self.client.is_none() {
            let Some(server) = self.server.clone() else {
                bail!("no server bound; run `bind <host:port>` first");
            };
            let config = ClientConfig {
                connect_timeout: Duration::from_secs(5),
                request_timeout: Duration::from_secs(30),
                ..ClientConfig::default()
            };
            let client = self
                .runtime
                .block_on(async { RpcClient::connect(&server, config).await })?;
            self.client = Some(client);
        }
        Ok(self.client.as_ref().expect("connected above"))
    }

    /// One admin call against the bound server.
    pub fn call<A: Serialize, R: DeserializeOwned>(
        &mut self,
        service: &str,
        operation: &str,
        args: &A,
    ) -> Result<R> {
        self.ensure_client()?;
        let client = self.client.as_ref().expect("ensured above");
        let result = self
            .runtime
            .block_on(client.call(service, operation, RequestKind::ReadWrite, args));
        if result.is_err() {
            // Force a redial next time; the connection may be gone.
            self.client = None;
        }
        Ok(result?)
    }

    /// Fetch the bound node's state.
    pub fn node_state(&mut self) -> Result<NodeState> {
        self.call(NODE_ADMIN, "GetNodeState", &())
    }

    /// Fetch the server's persistence configuration into the working copy.
    pub fn fetch_persistence(&mut self) -> Result<PersistenceConfig> {
        let config: PersistenceConfig = self.call(DB_ADMIN, "GetPersistenceConfiguration", &())?;
        self.persistence = Some(config.clone());
        Ok(config)
    }

    /// The working persistence configuration, fetched on first use.
    pub fn working_persistence(&mut self) -> Result<&mut PersistenceConfig> {
        if self.persistence.is_none() {
            self.fetch_persistence()?;
        }
        Ok(self.persistence.as_mut().expect("fetched above"))
    }
}
