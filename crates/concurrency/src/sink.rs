//! The durability hand-off at commit.
//!
//! The transaction manager does not know whether a deployment logs to one
//! stream, eight, or also ships records to replicas. It hands the commit
//! record to a `CommitSink` and treats a successful return as "durable per
//! the active policy". The engine composes the sink: local WAL only, or
//! WAL plus synchronous replication.

use helio_core::error::Result;
use helio_core::types::ClassId;
use helio_durability::{LogRecord, StreamSet};
use std::sync::Arc;

/// Receives the log record of a committing transaction. `append` returns
/// once the record is durable under the configured policy; an error aborts
/// the transaction before anything becomes visible.
pub trait CommitSink: Send + Sync {
    /// Persist one commit record.
    fn append(&self, record: &LogRecord) -> Result<()>;
}

/// Discards records. Pure in-memory deployments and tests.
pub struct NullSink;

impl CommitSink for NullSink {
    fn append(&self, _record: &LogRecord) -> Result<()> {
        Ok(())
    }
}

/// Appends to the local log streams, routing classes to their configured
/// stream.
pub struct LocalDurabilitySink {
    streams: Arc<StreamSet>,
    stream_of: Arc<dyn Fn(ClassId) -> u8 + Send + Sync>,
}

impl LocalDurabilitySink {
    /// Build a sink over `streams`; `stream_of` maps a class to its
    /// configured stream index.
    pub fn new(streams: Arc<StreamSet>, stream_of: Arc<dyn Fn(ClassId) -> u8 + Send + Sync>) -> Self {
        LocalDurabilitySink { streams, stream_of }
    }
}

impl CommitSink for LocalDurabilitySink {
    fn append(&self, record: &LogRecord) -> Result<()> {
        self.streams.append(record, |class| (self.stream_of)(class))
    }
}
