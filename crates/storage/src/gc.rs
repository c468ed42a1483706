//! Garbage collection of obsolete versions.
//!
//! A background task computes the minimum read version across live
//! transactions and sweeps one class partition at a time, so pause per
//! critical section stays bounded and transactions are never blocked.
//! Freed property blocks drop their interned-string and blob references on
//! the way out.

use crate::index::IndexSet;
use crate::store::ObjectStore;
use helio_core::types::Version;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// Counters from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Object versions freed.
    pub versions_freed: usize,
    /// Whole objects (dead tombstone chains) removed.
    pub objects_removed: usize,
    /// Index entries freed.
    pub index_entries_freed: usize,
}

/// The background version collector.
pub struct GarbageCollector {
    store: Arc<ObjectStore>,
    indexes: Arc<IndexSet>,
    min_read_version: Arc<dyn Fn() -> Version + Send + Sync>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl GarbageCollector {
    /// Build a collector. `min_read_version` reports the floor below which
    /// no live transaction reads; the transaction manager provides it.
    pub fn new(
        store: Arc<ObjectStore>,
        indexes: Arc<IndexSet>,
        min_read_version: Arc<dyn Fn() -> Version + Send + Sync>,
        interval: Duration,
    ) -> Self {
        GarbageCollector {
            store,
            indexes,
            min_read_version,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// One full sweep at floor `min_read`, partitioned by class.
    pub fn sweep(store: &ObjectStore, indexes: &IndexSet, min_read: Version) -> GcStats {
        let mut stats = GcStats::default();
        for partition in store.partitions() {
            let (freed, removed) = partition.sweep(min_read);
            stats.versions_freed += freed;
            stats.objects_removed += removed;
        }
        stats.index_entries_freed = indexes.sweep(min_read);
        stats
    }

    /// Start the background thread.
    pub fn start(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let indexes = Arc::clone(&self.indexes);
        let min_read_version = Arc::clone(&self.min_read_version);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;

        thread::Builder::new()
            .name("helio-gc".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    // Sleep in short slices so shutdown stays prompt.
                    let mut slept = Duration::ZERO;
                    while slept < interval && !shutdown.load(Ordering::Relaxed) {
                        let slice = Duration::from_millis(50).min(interval - slept);
                        thread::sleep(slice);
                        slept += slice;
                    }
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let floor = min_read_version();
                    let stats = Self::sweep(&store, &indexes, floor);
                    if stats != GcStats::default() {
                        debug!(
                            floor,
                            versions = stats.versions_freed,
                            objects = stats.objects_removed,
                            index_entries = stats.index_entries_freed,
                            "gc sweep"
                        );
                    }
                }
            })
            .expect("spawn gc thread")
    }

    /// Ask the background thread to stop after its current slice.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::StoredVersion;
    use helio_core::model::{ClassDescriptor, ModelDescriptor, PropertyDescriptor, PropertyKind};
    use helio_core::value::{PropertyBlock, PropertyValue};

    fn model() -> ModelDescriptor {
        let mut m = ModelDescriptor::empty();
        m.classes.push(ClassDescriptor {
            id: 1,
            name: "Item".to_string(),
            properties: vec![PropertyDescriptor {
                id: 0,
                name: "N".to_string(),
                kind: PropertyKind::I64,
            }],
            log_stream: 0,
        });
        m
    }

    fn block(n: i64) -> PropertyBlock {
        PropertyBlock::new(vec![PropertyValue::I64(n)])
    }

    #[test]
    fn sweep_frees_superseded_versions_only() {
        let model = model();
        let store = ObjectStore::for_model(&model);
        let indexes = IndexSet::for_model(&model);
        let p = store.partition(1).unwrap();
        let id = p.allocate_id();
        p.publish(id, StoredVersion::live(1, block(1)));
        p.publish(id, StoredVersion::live(4, block(2)));
        p.publish(id, StoredVersion::live(8, block(3)));

        // A reader at 5 still needs version 4; only version 1 is freeable.
        let stats = GarbageCollector::sweep(&store, &indexes, 5);
        assert_eq!(stats.versions_freed, 1);
        assert_eq!(stats.objects_removed, 0);
        assert_eq!(store.read(id, 5).unwrap().unwrap().commit_version, 4);
        assert_eq!(store.read(id, 8).unwrap().unwrap().commit_version, 8);
    }

    #[test]
    fn background_collector_runs_and_stops() {
        let model = model();
        let store = Arc::new(ObjectStore::for_model(&model));
        let indexes = Arc::new(IndexSet::for_model(&model));
        let p = store.partition(1).unwrap();
        let id = p.allocate_id();
        p.publish(id, StoredVersion::live(1, block(1)));
        p.publish(id, StoredVersion::tombstone(2));

        let gc = GarbageCollector::new(
            Arc::clone(&store),
            Arc::clone(&indexes),
            Arc::new(|| 100),
            Duration::from_millis(10),
        );
        let handle = gc.start();
        // Wait for at least one sweep to land.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while store.object_count() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        gc.shutdown();
        handle.join().unwrap();
        assert_eq!(store.object_count(), 0);
    }
}
