//! Multiversion object store for HelioDB
//!
//! - Per-class partitioned map from object id to a version chain
//! - Version chains kept strictly descending by commit version
//! - Transactionally maintained hash, sorted, and inverse-reference indexes
//! - A background garbage collector bounded by the minimum live read version

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chain;
pub mod gc;
pub mod index;
pub mod store;

pub use chain::{StoredVersion, VersionChain};
pub use gc::{GarbageCollector, GcStats};
pub use index::{IndexSet, InverseRefIndex};
pub use store::{ClassPartition, ObjectStore};
