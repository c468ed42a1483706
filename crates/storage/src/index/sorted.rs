//! Sorted index: snapshot-stable range scans.

use super::IndexEntry;
use helio_core::model::{IndexKey, KeyRange};
use helio_core::types::{ObjectId, Version};
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::ops::Bound;

type Entries = SmallVec<[IndexEntry; 2]>;

/// Ordered index over encoded keys. Scans collect the visible slice under
/// a read lock, so a cursor is stable under its snapshot no matter what
/// commits afterwards.
pub struct SortedIndex {
    tree: RwLock<BTreeMap<IndexKey, Entries>>,
}

fn bounds(range: &KeyRange) -> (Bound<IndexKey>, Bound<IndexKey>) {
    let start = match &range.start {
        Some(k) => Bound::Included(k.clone()),
        None => Bound::Unbounded,
    };
    let end = match &range.end {
        Some(k) if range.end_inclusive => Bound::Included(k.clone()),
        Some(k) => Bound::Excluded(k.clone()),
        None => Bound::Unbounded,
    };
    (start, end)
}

impl SortedIndex {
    /// An empty index.
    pub fn new() -> Self {
        SortedIndex {
            tree: RwLock::new(BTreeMap::new()),
        }
    }

    /// Bind `key` to `object_id` at `version`.
    pub fn insert(&self, key: IndexKey, object_id: ObjectId, version: Version) {
        self.tree
            .write()
            .entry(key)
            .or_default()
            .push(IndexEntry::new(object_id, version));
    }

    /// Mark the live binding of (`key`, `object_id`) removed at `version`.
    pub fn remove(&self, key: &IndexKey, object_id: ObjectId, version: Version) {
        if let Some(entries) = self.tree.write().get_mut(key) {
            if let Some(entry) = entries
                .iter_mut()
                .find(|e| e.object_id == object_id && e.removed == 0)
            {
                entry.removed = version;
            }
        }
    }

    /// Entries in `range` visible at `at`, ascending by key.
    pub fn scan(&self, range: &KeyRange, at: Version) -> Vec<(IndexKey, ObjectId)> {
        let tree = self.tree.read();
        let mut out = Vec::new();
        for (key, entries) in tree.range(bounds(range)) {
            for entry in entries.iter().filter(|e| e.visible_at(at)) {
                out.push((key.clone(), entry.object_id));
            }
        }
        out
    }

    /// Whether any binding inside `range` was inserted after `version`.
    pub fn any_inserted_after(&self, range: &KeyRange, version: Version) -> bool {
        let tree = self.tree.read();
        tree.range(bounds(range))
            .any(|(_, entries)| entries.iter().any(|e| e.inserted > version))
    }

    /// Drop reclaimable entries; empty keys are removed. Returns entries
    /// freed.
    pub fn sweep(&self, min_read: Version) -> usize {
        let mut tree = self.tree.write();
        let mut freed = 0;
        tree.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| !e.reclaimable(min_read));
            freed += before - entries.len();
            !entries.is_empty()
        });
        freed
    }

    /// Number of distinct keys. Diagnostics only.
    pub fn key_count(&self) -> usize {
        self.tree.read().len()
    }
}

impl Default for SortedIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helio_core::value::PropertyValue;

    fn key(s: &str) -> IndexKey {
        IndexKey::single(&PropertyValue::string(s)).unwrap()
    }

    fn oid(seq: u64) -> ObjectId {
        ObjectId::new(1, seq)
    }

    fn populated() -> SortedIndex {
        let idx = SortedIndex::new();
        idx.insert(key("alpha"), oid(1), 1);
        idx.insert(key("beta"), oid(2), 2);
        idx.insert(key("gamma"), oid(3), 3);
        idx
    }

    #[test]
    fn scan_is_ordered_and_version_bounded() {
        let idx = populated();
        let all = idx.scan(&KeyRange::all(), 10);
        assert_eq!(
            all.iter().map(|(_, id)| *id).collect::<Vec<_>>(),
            vec![oid(1), oid(2), oid(3)]
        );
        // A snapshot before "gamma" committed does not see it.
        let early = idx.scan(&KeyRange::all(), 2);
        assert_eq!(early.len(), 2);
    }

    #[test]
    fn range_bounds_are_respected() {
        let idx = populated();
        let range = KeyRange::half_open(key("alpha"), key("gamma"));
        let hits = idx.scan(&range, 10);
        assert_eq!(
            hits.iter().map(|(_, id)| *id).collect::<Vec<_>>(),
            vec![oid(1), oid(2)]
        );
    }

    #[test]
    fn removed_entries_leave_older_snapshots_intact() {
        let idx = populated();
        idx.remove(&key("beta"), oid(2), 5);
        assert_eq!(idx.scan(&KeyRange::all(), 4).len(), 3);
        assert_eq!(idx.scan(&KeyRange::all(), 5).len(), 2);
    }

    #[test]
    fn phantom_check_is_range_scoped() {
        let idx = populated();
        let narrow = KeyRange::half_open(key("a"), key("b"));
        assert!(!idx.any_inserted_after(&narrow, 1), "only alpha@1 in range");
        let wide = KeyRange::all();
        assert!(idx.any_inserted_after(&wide, 2), "gamma@3 is later");
        assert!(!idx.any_inserted_after(&wide, 3));
    }

    #[test]
    fn sweep_drops_only_unreachable_entries() {
        let idx = populated();
        idx.remove(&key("alpha"), oid(1), 4);
        assert_eq!(idx.sweep(3), 0, "a snapshot at 3 still sees the entry");
        assert_eq!(idx.sweep(4), 1);
        assert_eq!(idx.key_count(), 2);
    }
}
