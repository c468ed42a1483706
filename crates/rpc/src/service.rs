//! Service registry: service name → operation handlers.

use crate::envelope::{RequestKind, SchemaDiscovery};
use helio_core::error::{Error, Result};
use helio_wire::HEADER_VERSION;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A server-side service. `invoke` may block (it typically runs a
/// transaction); the server calls it on the blocking pool.
pub trait Service: Send + Sync {
    /// Dispatch one operation. `payload` is the MessagePack argument
    /// tuple; the return value is the MessagePack result.
    fn invoke(&self, operation: &str, kind: RequestKind, payload: &[u8]) -> Result<Vec<u8>>;
}

/// Model metadata provider backing schema discovery.
pub trait ModelInfo: Send + Sync {
    /// The installed model-version GUID, as a string.
    fn model_guid(&self) -> String;
    /// The installed model version number.
    fn model_version(&self) -> u32;
}

struct StaticModelInfo;

impl ModelInfo for StaticModelInfo {
    fn model_guid(&self) -> String {
        String::new()
    }
    fn model_version(&self) -> u32 {
        0
    }
}

/// All registered services.
pub struct ServiceRegistry {
    services: RwLock<FxHashMap<String, Arc<dyn Service>>>,
    model_info: RwLock<Arc<dyn ModelInfo>>,
}

impl ServiceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        ServiceRegistry {
            services: RwLock::new(FxHashMap::default()),
            model_info: RwLock::new(Arc::new(StaticModelInfo)),
        }
    }

    /// Register (or replace) a service.
    pub fn register(&self, name: &str, service: Arc<dyn Service>) {
        self.services.write().insert(name.to_string(), service);
    }

    /// Install the model metadata advertised by discovery.
    pub fn set_model_info(&self, info: Arc<dyn ModelInfo>) {
        *self.model_info.write() = info;
    }

    /// Look up a service.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Service>> {
        self.services.read().get(name).cloned().ok_or_else(|| {
            Error::InvalidArgument {
                field: "service".to_string(),
                reason: format!("unknown service '{name}'"),
            }
        })
    }

    /// The discovery object advertised to connecting clients.
    pub fn discovery(&self) -> SchemaDiscovery {
        let info = self.model_info.read().clone();
        let mut services: Vec<String> = self.services.read().keys().cloned().collect();
        services.sort_unstable();
        SchemaDiscovery {
            protocol_version: HEADER_VERSION,
            model_guid: info.model_guid(),
            model_version: info.model_version(),
            services,
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A service assembled from closures, one per operation. Engine admin
/// services and tests both use this.
pub struct OpTableService {
    ops: FxHashMap<String, Box<dyn Fn(RequestKind, &[u8]) -> Result<Vec<u8>> + Send + Sync>>,
}

impl OpTableService {
    /// An empty operation table.
    pub fn new() -> Self {
        OpTableService {
            ops: FxHashMap::default(),
        }
    }

    /// Add an operation handler.
    pub fn with_op(
        mut self,
        name: &str,
        handler: impl Fn(RequestKind, &[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        self.ops.insert(name.to_string(), Box::new(handler));
        self
    }
}

impl Default for OpTableService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for OpTableService {
    fn invoke(&self, operation: &str, kind: RequestKind, payload: &[u8]) -> Result<Vec<u8>> {
        match self.ops.get(operation) {
            Some(handler) => handler(kind, payload),
            None => Err(Error::InvalidArgument {
                field: "operation".to_string(),
                reason: format!("unknown operation '{operation}'"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{decode, encode};

    #[test]
    fn registry_dispatches_to_registered_service() {
        let registry = ServiceRegistry::new();
        let echo = OpTableService::new().with_op("Echo", |_, payload| Ok(payload.to_vec()));
        registry.register("Test", Arc::new(echo));

        let service = registry.get("Test").unwrap();
        let payload = encode(&"hello").unwrap();
        let result = service.invoke("Echo", RequestKind::Read, &payload).unwrap();
        let back: String = decode(&result).unwrap();
        assert_eq!(back, "hello");
    }

    #[test]
    fn unknown_service_and_operation_are_typed() {
        let registry = ServiceRegistry::new();
        assert!(matches!(
            registry.get("Nope"),
            Err(Error::InvalidArgument { .. })
        ));

        let empty = OpTableService::new();
        assert!(matches!(
            empty.invoke("Nope", RequestKind::Read, &[]),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn discovery_lists_services_sorted() {
        let registry = ServiceRegistry::new();
        registry.register("Zeta", Arc::new(OpTableService::new()));
        registry.register("Alpha", Arc::new(OpTableService::new()));
        let discovery = registry.discovery();
        assert_eq!(discovery.services, vec!["Alpha", "Zeta"]);
        assert_eq!(discovery.protocol_version, HEADER_VERSION);
    }
}
