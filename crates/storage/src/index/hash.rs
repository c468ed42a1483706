//! Hash index: point lookups, optional uniqueness.

use super::IndexEntry;
use dashmap::DashMap;
use helio_core::model::{IndexKey, KeyRange};
use helio_core::types::{ObjectId, Version};
use smallvec::SmallVec;
use std::hash::BuildHasherDefault;

type Entries = SmallVec<[IndexEntry; 2]>;
type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;

/// Sharded hash index over encoded keys.
pub struct HashIndex {
    map: FxDashMap<IndexKey, Entries>,
}

impl HashIndex {
    /// An empty index.
    pub fn new() -> Self {
        HashIndex {
            map: FxDashMap::with_hasher(BuildHasherDefault::default()),
        }
    }

    /// Bind `key` to `object_id` at `version`.
    pub fn insert(&self, key: IndexKey, object_id: ObjectId, version: Version) {
        self.map
            .entry(key)
            .or_default()
            .push(IndexEntry::new(object_id, version));
    }

    /// Mark the live binding of (`key`, `object_id`) removed at `version`.
    pub fn remove(&self, key: &IndexKey, object_id: ObjectId, version: Version) {
        if let Some(mut entries) = self.map.get_mut(key) {
            if let Some(entry) = entries
                .iter_mut()
                .find(|e| e.object_id == object_id && e.removed == 0)
            {
                entry.removed = version;
            }
        }
    }

    /// Object ids bound to `key` and visible at `at`.
    pub fn get_visible(&self, key: &IndexKey, at: Version) -> Vec<ObjectId> {
        match self.map.get(key) {
            Some(entries) => entries
                .iter()
                .filter(|e| e.visible_at(at))
                .map(|e| e.object_id)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Whether any binding inside `range` was inserted after `version`.
    /// Hash scans are always point ranges, but a range check keeps phantom
    /// validation uniform across index kinds.
    pub fn any_inserted_after(&self, range: &KeyRange, version: Version) -> bool {
        match (&range.start, &range.end) {
            (Some(start), Some(end)) if start == end => match self.map.get(start) {
                Some(entries) => entries.iter().any(|e| e.inserted > version),
                None => false,
            },
            _ => self.map.iter().any(|kv| {
                range.contains(kv.key()) && kv.value().iter().any(|e| e.inserted > version)
            }),
        }
    }

    /// Drop reclaimable entries; empty keys are removed. Returns entries
    /// freed.
    pub fn sweep(&self, min_read: Version) -> usize {
        let mut freed = 0;
        self.map.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| !e.reclaimable(min_read));
            freed += before - entries.len();
            !entries.is_empty()
        });
        freed
    }

    /// Number of distinct keys. Diagnostics only.
    pub fn key_count(&self) -> usize {
        self.map.len()
    }
}

impl Default for HashIndex {
    fn default() -> Self {
        Self::new()
    }
}
