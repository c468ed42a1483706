//! Transactionally maintained secondary indexes.
//!
//! Index entries are versioned the same way object versions are: an entry
//! records the commit version that inserted it and, once superseded, the
//! commit version that removed it. A reader at snapshot version `v` sees
//! exactly the entries with `inserted <= v < removed`. Entry mutation
//! happens only under the class commit lock, so per-key entry lists never
//! race.

mod hash;
mod inverse;
mod sorted;

pub use hash::HashIndex;
pub use inverse::InverseRefIndex;
pub use sorted::SortedIndex;

use dashmap::DashMap;
use helio_core::error::{Error, NotFoundKind, Result};
use helio_core::model::{IndexKey, IndexKind, KeyRange, ModelDescriptor};
use helio_core::types::{ClassId, IndexId, ObjectId, PropertyId, Version};
use helio_core::value::PropertyBlock;

/// A versioned binding of a key to one object.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    /// The bound object.
    pub object_id: ObjectId,
    /// Commit version that inserted the entry.
    pub inserted: Version,
    /// Commit version that removed it; 0 while live.
    pub removed: Version,
}

impl IndexEntry {
    fn new(object_id: ObjectId, inserted: Version) -> Self {
        IndexEntry {
            object_id,
            inserted,
            removed: 0,
        }
    }

    /// Whether a snapshot at `at` sees this entry.
    pub fn visible_at(&self, at: Version) -> bool {
        self.inserted <= at && (self.removed == 0 || self.removed > at)
    }

    /// Whether GC at floor `min_read` may drop this entry.
    pub fn reclaimable(&self, min_read: Version) -> bool {
        self.removed != 0 && self.removed <= min_read
    }
}

/// Every index of the current model, routed by index id. The maps are
/// sharded so a model update can add declarations while readers run.
pub struct IndexSet {
    hash: DashMap<IndexId, HashIndex>,
    sorted: DashMap<IndexId, SortedIndex>,
    inverse: DashMap<(ClassId, PropertyId), InverseRefIndex>,
}

impl IndexSet {
    /// Build empty indexes for every declaration in `model`.
    pub fn for_model(model: &ModelDescriptor) -> Self {
        let set = IndexSet {
            hash: DashMap::new(),
            sorted: DashMap::new(),
            inverse: DashMap::new(),
        };
        set.adopt_model(model);
        set
    }

    /// Add structures for declarations introduced by a model update.
    pub fn adopt_model(&self, model: &ModelDescriptor) {
        for index in &model.indexes {
            match index.kind {
                IndexKind::Hash => {
                    self.hash.entry(index.id).or_insert_with(HashIndex::new);
                }
                IndexKind::Sorted => {
                    self.sorted.entry(index.id).or_insert_with(SortedIndex::new);
                }
            }
        }
        for inv in &model.inverse_refs {
            self.inverse
                .entry((inv.referring_class, inv.property))
                .or_insert_with(InverseRefIndex::new);
        }
    }

    /// Apply the index side effects of one object write. `old_block` is the
    /// superseded visible block (if the object existed), `new_block` the
    /// block being published (`None` for a delete). Runs under the class
    /// commit lock.
    pub fn apply_write(
        &self,
        model: &ModelDescriptor,
        class_id: ClassId,
        object_id: ObjectId,
        old_block: Option<&PropertyBlock>,
        new_block: Option<&PropertyBlock>,
        commit_version: Version,
    ) -> Result<()> {
        for index in model.indexes_for_class(class_id) {
            let old_key = old_block
                .map(|b| model.extract_key(index, b))
                .transpose()?;
            let new_key = new_block
                .map(|b| model.extract_key(index, b))
                .transpose()?;
            if old_key == new_key {
                continue;
            }
            match index.kind {
                IndexKind::Hash => {
                    let idx = self.hash.get(&index.id).expect("index built from model");
                    if let Some(key) = old_key {
                        idx.remove(&key, object_id, commit_version);
                    }
                    if let Some(key) = new_key {
                        idx.insert(key, object_id, commit_version);
                    }
                }
                IndexKind::Sorted => {
                    let idx = self.sorted.get(&index.id).expect("index built from model");
                    if let Some(key) = old_key {
                        idx.remove(&key, object_id, commit_version);
                    }
                    if let Some(key) = new_key {
                        idx.insert(key, object_id, commit_version);
                    }
                }
            }
        }
        let class = model.class(class_id)?;
        for inv in model.inverse_refs_from(class_id) {
            let position = match class.property_position(inv.property) {
                Some(p) => p,
                None => continue,
            };
            let old_target = old_block
                .and_then(|b| b.get(position))
                .and_then(|v| v.as_ref_id())
                .filter(|id| !id.is_null());
            let new_target = new_block
                .and_then(|b| b.get(position))
                .and_then(|v| v.as_ref_id())
                .filter(|id| !id.is_null());
            if old_target == new_target {
                continue;
            }
            let idx = self
                .inverse
                .get(&(inv.referring_class, inv.property))
                .expect("inverse index built from model");
            if let Some(target) = old_target {
                idx.remove_edge(target, object_id, commit_version);
            }
            if let Some(target) = new_target {
                idx.add_edge(target, object_id, commit_version);
            }
        }
        Ok(())
    }

    /// Point lookup in a hash index at snapshot `at`.
    pub fn lookup_hash(&self, index_id: IndexId, key: &IndexKey, at: Version) -> Result<Vec<ObjectId>> {
        self.hash
            .get(&index_id)
            .map(|i| i.get_visible(key, at))
            .ok_or(Error::NotFound(NotFoundKind::Index(index_id)))
    }

    /// Range scan in a sorted index at snapshot `at`, ascending by key.
    pub fn scan_sorted(
        &self,
        index_id: IndexId,
        range: &KeyRange,
        at: Version,
    ) -> Result<Vec<(IndexKey, ObjectId)>> {
        self.sorted
            .get(&index_id)
            .map(|i| i.scan(range, at))
            .ok_or(Error::NotFound(NotFoundKind::Index(index_id)))
    }

    /// Whether any entry in `range` was inserted after `version`. Phantom
    /// validation runs this under the commit lock.
    pub fn any_inserted_after(
        &self,
        index_id: IndexId,
        range: &KeyRange,
        version: Version,
    ) -> Result<bool> {
        if let Some(idx) = self.sorted.get(&index_id) {
            return Ok(idx.any_inserted_after(range, version));
        }
        if let Some(idx) = self.hash.get(&index_id) {
            return Ok(idx.any_inserted_after(range, version));
        }
        Err(Error::NotFound(NotFoundKind::Index(index_id)))
    }

    /// Whether inserting `key` into a unique index would collide with an
    /// entry visible right now, other than the writing object itself.
    pub fn unique_collision(
        &self,
        index_id: IndexId,
        key: &IndexKey,
        current_version: Version,
        exclude: ObjectId,
    ) -> Result<bool> {
        let visible = if let Some(idx) = self.hash.get(&index_id) {
            idx.get_visible(key, current_version)
        } else if let Some(idx) = self.sorted.get(&index_id) {
            idx.scan(&KeyRange::point(key.clone()), current_version)
                .into_iter()
                .map(|(_, id)| id)
                .collect()
        } else {
            return Err(Error::NotFound(NotFoundKind::Index(index_id)));
        };
        Ok(visible.into_iter().any(|id| id != exclude))
    }

    /// Objects whose declared reference property points at `target`, as of
    /// snapshot `at`.
    pub fn referrers(
        &self,
        referring_class: ClassId,
        property: PropertyId,
        target: ObjectId,
        at: Version,
    ) -> Vec<ObjectId> {
        self.inverse
            .get(&(referring_class, property))
            .map(|i| i.referrers_at(target, at))
            .unwrap_or_default()
    }

    /// Drop entries no snapshot can reach. Returns entries freed.
    pub fn sweep(&self, min_read: Version) -> usize {
        let mut freed = 0;
        for idx in self.hash.iter() {
            freed += idx.sweep(min_read);
        }
        for idx in self.sorted.iter() {
            freed += idx.sweep(min_read);
        }
        for idx in self.inverse.iter() {
            freed += idx.sweep(min_read);
        }
        freed
    }
}
