//! User-operation registry and the execution service.
//!
//! Business-logic operations are registered as handlers keyed by service
//! and operation name. Each remote invocation runs as a single
//! transaction: the engine begins it, the handler works against the
//! [`crate::txn::Txn`] handle, and the engine commits (or aborts on
//! error). Conflicts surface to the client as retriable typed errors.

use crate::database::Database;
use crate::txn::Txn;
use helio_core::error::{Error, Result};
use helio_core::types::TxnKind;
use helio_rpc::{RequestKind, Service};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::debug;

/// A registered operation handler. The returned bytes are the
/// MessagePack-encoded result.
pub type OpHandler = Arc<dyn Fn(&mut Txn<'_>, &[u8]) -> Result<Vec<u8>> + Send + Sync>;

struct Registered {
    kind: RequestKind,
    handler: OpHandler,
}

/// All user operations, grouped by service name.
pub struct OperationRegistry {
    services: RwLock<FxHashMap<String, FxHashMap<String, Registered>>>,
}

impl OperationRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        OperationRegistry {
            services: RwLock::new(FxHashMap::default()),
        }
    }

    /// Register an operation handler.
    pub fn register(
        &self,
        service: &str,
        operation: &str,
        kind: RequestKind,
        handler: impl Fn(&mut Txn<'_>, &[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
    ) {
        self.services
            .write()
            .entry(service.to_string())
            .or_default()
            .insert(
                operation.to_string(),
                Registered {
                    kind,
                    handler: Arc::new(handler),
                },
            );
    }

    /// Names of all registered services.
    pub fn service_names(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }

    fn lookup(&self, service: &str, operation: &str) -> Result<(RequestKind, OpHandler)> {
        let services = self.services.read();
        let ops = services.get(service).ok_or_else(|| Error::InvalidArgument {
            field: "service".to_string(),
            reason: format!("unknown service '{service}'"),
        })?;
        let registered = ops.get(operation).ok_or_else(|| Error::InvalidArgument {
            field: "operation".to_string(),
            reason: format!("unknown operation '{operation}'"),
        })?;
        Ok((registered.kind, Arc::clone(&registered.handler)))
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapts one registered service to the RPC layer. Every invocation is
/// one transaction.
pub struct ExecutionService {
    db: Arc<Database>,
    registry: Arc<OperationRegistry>,
    service: String,
}

impl ExecutionService {
    /// Build an adapter for `service`.
    pub fn new(db: Arc<Database>, registry: Arc<OperationRegistry>, service: &str) -> Self {
        ExecutionService {
            db,
            registry,
            service: service.to_string(),
        }
    }
}

impl Service for ExecutionService {
    fn invoke(&self, operation: &str, kind: RequestKind, payload: &[u8]) -> Result<Vec<u8>> {
        let (registered_kind, handler) = self.registry.lookup(&self.service, operation)?;
        if registered_kind == RequestKind::ReadWrite && kind == RequestKind::Read {
            return Err(Error::InvalidArgument {
                field: "kind".to_string(),
                reason: format!("operation '{operation}' requires a read-write request"),
            });
        }
        let txn_kind = match registered_kind {
            RequestKind::Read => TxnKind::Read,
            RequestKind::ReadWrite => TxnKind::ReadWrite,
        };

        let mut txn = self.db.begin(txn_kind)?;
        match handler(&mut txn, payload) {
            Ok(result) => {
                let version = txn.commit()?;
                debug!(service = %self.service, operation, version, "operation committed");
                Ok(result)
            }
            Err(e) if e.is_fatal() => self.db.fail_fast(&e),
            Err(e) => {
                // The handler failed before commit; drop its buffered work.
                let _ = txn.abort();
                Err(e)
            }
        }
    }
}
