//! Live-transaction registry.
//!
//! Tracks the read version of every transaction still running so the
//! garbage collector knows the floor below which no snapshot reads.

use dashmap::DashMap;
use helio_core::types::{TxnId, Version};
use std::sync::atomic::{AtomicU64, Ordering};

/// Registry of running transactions.
pub struct LiveTransactions {
    read_versions: DashMap<TxnId, Version>,
    /// Fallback floor when nothing runs: the latest committed version.
    committed_floor: AtomicU64,
}

impl LiveTransactions {
    /// An empty registry.
    pub fn new() -> Self {
        LiveTransactions {
            read_versions: DashMap::new(),
            committed_floor: AtomicU64::new(0),
        }
    }

    /// Register a transaction at begin.
    pub fn register(&self, txn_id: TxnId, read_version: Version) {
        self.read_versions.insert(txn_id, read_version);
    }

    /// Remove a transaction after commit or abort.
    pub fn unregister(&self, txn_id: TxnId) {
        self.read_versions.remove(&txn_id);
    }

    /// Keep the idle floor in step with the committed version.
    pub fn advance_floor(&self, committed: Version) {
        self.committed_floor.fetch_max(committed, Ordering::Relaxed);
    }

    /// The minimum read version across live transactions, or the committed
    /// floor when none run. GC may free anything strictly below versions
    /// still needed at this floor.
    pub fn min_read_version(&self) -> Version {
        self.read_versions
            .iter()
            .map(|kv| *kv.value())
            .min()
            .unwrap_or_else(|| self.committed_floor.load(Ordering::Relaxed))
    }

    /// Number of live transactions.
    pub fn len(&self) -> usize {
        self.read_versions.len()
    }

    /// Whether nothing is running.
    pub fn is_empty(&self) -> bool {
        self.read_versions.is_empty()
    }
}

impl Default for LiveTransactions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_tracks_the_oldest_live_transaction() {
        let live = LiveTransactions::new();
        live.advance_floor(50);
        assert_eq!(live.min_read_version(), 50);

        live.register(1, 20);
        live.register(2, 30);
        assert_eq!(live.min_read_version(), 20);

        live.unregister(1);
        assert_eq!(live.min_read_version(), 30);

        live.unregister(2);
        assert_eq!(live.min_read_version(), 50);
    }
}
