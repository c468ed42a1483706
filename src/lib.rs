//! # HelioDB
//!
//! An in-memory, object-oriented OLTP database engine: MVCC storage with
//! optimistic concurrency control and strict-serializable commits, WAL +
//! snapshot persistence, a chunked binary RPC protocol, and two-tier
//! replication with witness-arbitrated failover.
//!
//! # Quick Start
//!
//! ```no_run
//! use heliodb::{
//!     AssemblyBundle, Database, DatabaseConfig, ModelDescriptor, PropertyBlock, PropertyValue,
//!     TxnKind,
//! };
//! use heliodb::model::{ClassDescriptor, PropertyDescriptor, PropertyKind};
//!
//! fn main() -> heliodb::Result<()> {
//!     let mut model = ModelDescriptor::empty();
//!     model.classes.push(ClassDescriptor {
//!         id: 1,
//!         name: "Book".to_string(),
//!         properties: vec![
//!             PropertyDescriptor { id: 0, name: "Title".to_string(), kind: PropertyKind::Str },
//!             PropertyDescriptor { id: 1, name: "Author".to_string(), kind: PropertyKind::Str },
//!         ],
//!         log_stream: 0,
//!     });
//!
//!     let db = Database::open(
//!         DatabaseConfig::standalone("node", std::path::Path::new("./helio-data")),
//!         AssemblyBundle::for_model(model),
//!     )?;
//!
//!     let mut txn = db.begin(TxnKind::ReadWrite)?;
//!     let id = txn.create(1, PropertyBlock::new(vec![
//!         PropertyValue::string("The Great Gatsby"),
//!         PropertyValue::string("F. Scott Fitzgerald"),
//!     ]))?;
//!     let version = txn.commit()?;
//!
//!     let mut read = db.begin(TxnKind::Read)?;
//!     let book = read.get(id)?.expect("committed above");
//!     assert!(version >= 1);
//!     assert_eq!(book.get(0).unwrap().as_str().as_deref(), Some("The Great Gatsby"));
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! | Layer | Crate | Contents |
//! |-------|-------|----------|
//! | Core | `helio-core` | ids, values, descriptors, errors, allocators, interned strings |
//! | Storage | `helio-storage` | version chains, partitioned store, indexes, GC |
//! | Concurrency | `helio-concurrency` | OCC validation, transaction manager |
//! | Durability | `helio-durability` | log streams, WAL segments, snapshots, recovery |
//! | Wire | `helio-wire` | chunk framing, message ids, reassembly |
//! | RPC | `helio-rpc` | server, client, service registry |
//! | Replication | `helio-replication` | roles, witness, election, log shipping |
//! | Engine | `helio-engine` | the database, admin services, background tasks |
//!
//! The [`Database`] struct is the embedding entry point; the `helio-server`
//! binary wraps it with the network endpoints, and the `helio` binary is
//! the administration CLI.

pub use helio_concurrency as concurrency;
pub use helio_durability as durability;
pub use helio_storage as storage;
pub use helio_wire as wire;

pub use helio_core::config;
pub use helio_core::error;
pub use helio_core::model;
pub use helio_core::{
    BlobRef, Error, InternedStr, ModelDescriptor, ObjectId, PropertyBlock, PropertyValue, Result,
    TxnKind, Version,
};
pub use helio_engine::{AssemblyBundle, Database, DatabaseConfig, NodeState, Txn};
pub use helio_replication::{GlobalWriteRole, LocalWriteRole, NodeRoles};
pub use helio_rpc::{ClientConfig, RequestKind, RpcClient};
