//! Optimistic concurrency control for HelioDB
//!
//! - `TransactionContext`: write set plus read fingerprint tracking
//! - Commit-time validation against the current store and indexes
//! - `TransactionManager`: version assignment, striped per-class commit
//!   locks, publication, and the durability hand-off
//! - A live-transaction registry feeding the garbage collector's minimum
//!   read version

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod manager;
pub mod registry;
pub mod sink;
pub mod transaction;
pub mod validation;

pub use manager::TransactionManager;
pub use registry::LiveTransactions;
pub use sink::{CommitSink, LocalDurabilitySink, NullSink};
pub use transaction::{PendingWrite, ReadFingerprint, TransactionContext, TxnStatus};
