//! RPC layer for HelioDB
//!
//! Requests name a service, an operation, and a request kind, and carry a
//! MessagePack-encoded argument tuple. The transport is the chunked wire
//! protocol: one receive task per connection, handler execution on the
//! runtime's worker pool (blocking handlers on the blocking pool), and a
//! grouped writer amortizing small sends.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod envelope;
pub mod server;
pub mod service;

pub use client::{ClientConfig, RpcClient};
pub use envelope::{RequestEnvelope, RequestKind, ResponseEnvelope, SchemaDiscovery, DISCOVERY_SERVICE};
pub use server::{RpcServer, ServerConfig};
pub use service::{ModelInfo, OpTableService, Service, ServiceRegistry};
