//! The per-class partitioned object store.
//!
//! Each class gets its own sharded map from object sequence to version
//! chain, so traffic against different classes never contends and the
//! class id embedded in an object id routes a lookup without touching
//! shared state. Publication replaces a chain head inside a single shard
//! critical section: a concurrent reader sees either the old head or the
//! new one, never an intermediate.

use crate::chain::{StoredVersion, VersionChain};
use dashmap::DashMap;
use helio_core::error::{Error, NotFoundKind, Result};
use helio_core::model::ModelDescriptor;
use helio_core::types::{ClassId, ObjectId, Version};
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<FxHasher>>;

/// Storage for a single class.
pub struct ClassPartition {
    class_id: ClassId,
    chains: FxDashMap<u64, VersionChain>,
    next_sequence: AtomicU64,
}

impl ClassPartition {
    fn new(class_id: ClassId) -> Self {
        ClassPartition {
            class_id,
            chains: FxDashMap::with_hasher(BuildHasherDefault::default()),
            next_sequence: AtomicU64::new(1),
        }
    }

    /// The owning class.
    pub fn class_id(&self) -> ClassId {
        self.class_id
    }

    /// Issue a fresh object id for this class.
    pub fn allocate_id(&self) -> ObjectId {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        ObjectId::new(self.class_id, sequence)
    }

    /// Keep fresh ids ahead of a replayed or replicated id.
    pub fn observe_id(&self, id: ObjectId) {
        let floor = id.sequence() + 1;
        self.next_sequence.fetch_max(floor, Ordering::Relaxed);
    }

    /// Newest version visible at `read_version`, tombstones filtered.
    pub fn read(&self, id: ObjectId, read_version: Version) -> Option<StoredVersion> {
        let chain = self.chains.get(&id.sequence())?;
        let version = chain.visible_at(read_version)?;
        if version.tombstone {
            None
        } else {
            Some(version.clone())
        }
    }

    /// Commit version and tombstone flag of the current head, if any.
    /// OCC validation compares this against the read fingerprint.
    pub fn head_meta(&self, id: ObjectId) -> Option<(Version, bool)> {
        let chain = self.chains.get(&id.sequence())?;
        chain.head().map(|h| (h.commit_version, h.tombstone))
    }

    /// Commit version and tombstone flag of the version visible at
    /// `read_version`. Unlike [`ClassPartition::read`] this reports
    /// tombstones, which the read fingerprint needs to record faithfully.
    pub fn visible_meta(&self, id: ObjectId, read_version: Version) -> Option<(Version, bool)> {
        let chain = self.chains.get(&id.sequence())?;
        chain
            .visible_at(read_version)
            .map(|v| (v.commit_version, v.tombstone))
    }

    /// The current head's property block when the head is live. Index
    /// maintenance derives superseded keys from this under the commit lock.
    pub fn head_block(&self, id: ObjectId) -> Option<helio_core::value::PropertyBlock> {
        let chain = self.chains.get(&id.sequence())?;
        let head = chain.head()?;
        if head.tombstone {
            None
        } else {
            head.block.clone()
        }
    }

    /// Publish a new head for `id`. Caller holds the class commit lock.
    pub fn publish(&self, id: ObjectId, version: StoredVersion) {
        self.chains
            .entry(id.sequence())
            .and_modify(|chain| chain.push(version.clone()))
            .or_insert_with(|| VersionChain::new(version));
    }

    /// Number of objects with at least one retained version.
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    /// Whether the partition holds nothing.
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Run `f` over every (sequence, chain) pair. Used by snapshots and GC.
    pub fn for_each(&self, mut f: impl FnMut(u64, &VersionChain)) {
        for entry in self.chains.iter() {
            f(*entry.key(), entry.value());
        }
    }

    /// Prune unreachable versions and drop dead chains. Returns
    /// (versions freed, objects removed).
    pub fn sweep(&self, min_read_version: Version) -> (usize, usize) {
        let mut versions_freed = 0;
        for mut entry in self.chains.iter_mut() {
            versions_freed += entry.value_mut().prune(min_read_version);
        }
        let before = self.chains.len();
        self.chains
            .retain(|_, chain| !chain.is_dead(min_read_version));
        (versions_freed, before - self.chains.len())
    }
}

/// The whole object store: one partition per class in the model. The
/// partition map itself is sharded so a model update can add classes while
/// transactions run.
pub struct ObjectStore {
    partitions: FxDashMap<ClassId, Arc<ClassPartition>>,
}

impl ObjectStore {
    /// Build partitions for every class in `model`.
    pub fn for_model(model: &ModelDescriptor) -> Self {
        let store = ObjectStore {
            partitions: FxDashMap::with_hasher(BuildHasherDefault::default()),
        };
        store.adopt_model(model);
        store
    }

    /// The partition for `class`.
    pub fn partition(&self, class: ClassId) -> Result<Arc<ClassPartition>> {
        self.partitions
            .get(&class)
            .map(|p| Arc::clone(&p))
            .ok_or(Error::NotFound(NotFoundKind::Class(class)))
    }

    /// Route by the class embedded in `id`.
    pub fn partition_for(&self, id: ObjectId) -> Result<Arc<ClassPartition>> {
        self.partition(id.class_id())
    }

    /// Newest visible version of `id` at `read_version`.
    pub fn read(&self, id: ObjectId, read_version: Version) -> Result<Option<StoredVersion>> {
        Ok(self.partition_for(id)?.read(id, read_version))
    }

    /// Snapshot of all partitions, for sweeps and snapshots.
    pub fn partitions(&self) -> Vec<Arc<ClassPartition>> {
        self.partitions.iter().map(|p| Arc::clone(p.value())).collect()
    }

    /// Add partitions for classes introduced by a model update; existing
    /// partitions are kept as-is.
    pub fn adopt_model(&self, model: &ModelDescriptor) {
        for class in &model.classes {
            self.partitions
                .entry(class.id)
                .or_insert_with(|| Arc::new(ClassPartition::new(class.id)));
        }
    }

    /// Total live objects across all classes. Diagnostics only.
    pub fn object_count(&self) -> usize {
        self.partitions.iter().map(|p| p.len()).sum()
    }
}
