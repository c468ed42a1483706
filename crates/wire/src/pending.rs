//! Pending-request tracking.
//!
//! The sender of a request registers a responder under the request's
//! message id; the receive task completes it when the response arrives.
//! Entries are sharded per core so registration and completion at peak
//! rates never contend on one map.

use bytes::Bytes;
use helio_core::error::{CommunicationKind, Error, Result};
use helio_core::stripe::Striped;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;

type Shard = Mutex<FxHashMap<u64, oneshot::Sender<Result<Bytes>>>>;

/// Per-core sharded map from message id to response channel.
pub struct PendingRequests {
    shards: Striped<Shard>,
}

impl PendingRequests {
    /// An empty table with one shard per core.
    pub fn new() -> Self {
        PendingRequests {
            shards: Striped::per_core(|| Mutex::new(FxHashMap::default())),
        }
    }

    fn shard(&self, message_id: u64) -> &Shard {
        // Message ids carry their originating core in the high bits, so
        // routing by id keeps each core working its own shard.
        let core = (message_id >> crate::message_id::COUNTER_BITS) & 0x1fff;
        self.shards.at(core as usize)
    }

    /// Register a request; the returned receiver resolves with the
    /// response payload or the failure that ended it.
    pub fn register(&self, message_id: u64) -> oneshot::Receiver<Result<Bytes>> {
        let (tx, rx) = oneshot::channel();
        self.shard(message_id).lock().insert(message_id, tx);
        rx
    }

    /// Complete a request with its response payload. Returns false when
    /// the id is unknown (already timed out, or never ours); the caller
    /// treats that as a protocol violation.
    pub fn complete(&self, message_id: u64, payload: Bytes) -> bool {
        match self.shard(message_id).lock().remove(&message_id) {
            Some(tx) => {
                let _ = tx.send(Ok(payload));
                true
            }
            None => false,
        }
    }

    /// Drop a request that timed out; its receiver resolves with
    /// `Communication::Timeout`.
    pub fn timeout(&self, message_id: u64) {
        if let Some(tx) = self.shard(message_id).lock().remove(&message_id) {
            let _ = tx.send(Err(Error::Communication(CommunicationKind::Timeout)));
        }
    }

    /// Fail every outstanding request, e.g. when the connection dies.
    pub fn fail_all(&self, error: Error) {
        for shard in self.shards.iter() {
            for (_, tx) in shard.lock().drain() {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    /// Outstanding request count.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}
