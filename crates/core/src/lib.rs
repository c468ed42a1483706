//! Core types for HelioDB
//!
//! This crate carries everything the upper layers share:
//! - Object identifiers, commit versions, transaction kinds
//! - The typed object model (class/property/index descriptors)
//! - Property values and packed property blocks
//! - The unified error taxonomy
//! - Allocation primitives (slab pool, extent heap, id allocator)
//! - The process-wide interned string table and blob store
//! - Persistence and cluster configuration models

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alloc;
pub mod blob;
pub mod config;
pub mod context;
pub mod error;
pub mod intern;
pub mod model;
pub mod stripe;
pub mod types;
pub mod value;

pub use blob::BlobRef;
pub use context::{EngineContext, TraceLevel};
pub use error::{Error, Result};
pub use intern::{InternedStr, StringTable, EMPTY_HANDLE, NULL_HANDLE};
pub use model::{
    ClassDescriptor, IndexDescriptor, IndexKey, IndexKind, InverseRefDescriptor, KeyRange,
    ModelDescriptor, PropertyDescriptor, PropertyKind,
};
pub use types::{ClassId, IndexId, ObjectId, PropertyId, TxnId, TxnKind, Version, WriteOp};
pub use value::{PropertyBlock, PropertyValue};
