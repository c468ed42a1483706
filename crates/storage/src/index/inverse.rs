//! Inverse-reference index.
//!
//! For a declared (referring class, reference property, referenced class)
//! triple, this index answers "which objects point at X" as of a snapshot
//! version, without walking any version chains. Every committed write that
//! changes the reference atomically removes the old back-edge and inserts
//! the new one.

use dashmap::DashMap;
use helio_core::types::{ObjectId, Version};
use smallvec::SmallVec;
use std::hash::BuildHasherDefault;

/// One back-edge: `referrer` pointed at the keyed target over
/// [`inserted`, `removed`).
#[derive(Debug, Clone)]
struct BackEdge {
    referrer: ObjectId,
    inserted: Version,
    removed: Version,
}

type Edges = SmallVec<[BackEdge; 4]>;
type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;

/// Back-edges for one inverse-reference declaration, keyed by target.
pub struct InverseRefIndex {
    map: FxDashMap<ObjectId, Edges>,
}

impl InverseRefIndex {
    /// An empty index.
    pub fn new() -> Self {
        InverseRefIndex {
            map: FxDashMap::with_hasher(BuildHasherDefault::default()),
        }
    }

    /// Record that `referrer` points at `target` from `version` on.
    pub fn add_edge(&self, target: ObjectId, referrer: ObjectId, version: Version) {
        self.map.entry(target).or_default().push(BackEdge {
            referrer,
            inserted: version,
            removed: 0,
        });
    }

    /// Record that `referrer` stopped pointing at `target` at `version`.
    pub fn remove_edge(&self, target: ObjectId, referrer: ObjectId, version: Version) {
        if let Some(mut edges) = self.map.get_mut(&target) {
            if let Some(edge) = edges
                .iter_mut()
                .find(|e| e.referrer == referrer && e.removed == 0)
            {
                edge.removed = version;
            }
        }
    }

    /// All referrers of `target` visible at snapshot `at`.
    pub fn referrers_at(&self, target: ObjectId, at: Version) -> Vec<ObjectId> {
        match self.map.get(&target) {
            Some(edges) => edges
                .iter()
                .filter(|e| e.inserted <= at && (e.removed == 0 || e.removed > at))
                .map(|e| e.referrer)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Drop edges no snapshot can reach. Returns edges freed.
    pub fn sweep(&self, min_read: Version) -> usize {
        let mut freed = 0;
        self.map.retain(|_, edges| {
            let before = edges.len();
            edges.retain(|e| !(e.removed != 0 && e.removed <= min_read));
            freed += before - edges.len();
            !edges.is_empty()
        });
        freed
    }
}

impl Default for InverseRefIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(class: u16, seq: u64) -> ObjectId {
        ObjectId::new(class, seq)
    }

    #[test]
    fn referrers_are_snapshot_scoped() {
        let idx = InverseRefIndex::new();
        let author = oid(2, 1);
        idx.add_edge(author, oid(1, 10), 3);
        idx.add_edge(author, oid(1, 11), 5);

        assert!(idx.referrers_at(author, 2).is_empty());
        assert_eq!(idx.referrers_at(author, 3), vec![oid(1, 10)]);
        assert_eq!(idx.referrers_at(author, 5).len(), 2);
    }

    #[test]
    fn retargeting_moves_the_back_edge() {
        let idx = InverseRefIndex::new();
        let old_author = oid(2, 1);
        let new_author = oid(2, 2);
        let book = oid(1, 10);
        idx.add_edge(old_author, book, 1);
        // The write that retargets the reference commits at version 4.
        idx.remove_edge(old_author, book, 4);
        idx.add_edge(new_author, book, 4);

        assert_eq!(idx.referrers_at(old_author, 3), vec![book]);
        assert!(idx.referrers_at(old_author, 4).is_empty());
        assert_eq!(idx.referrers_at(new_author, 4), vec![book]);
    }

    #[test]
    fn sweep_respects_the_read_floor() {
        let idx = InverseRefIndex::new();
        let target = oid(2, 1);
        idx.add_edge(target, oid(1, 10), 1);
        idx.remove_edge(target, oid(1, 10), 6);
        assert_eq!(idx.sweep(5), 0);
        assert_eq!(idx.sweep(6), 1);
        assert!(idx.referrers_at(target, 100).is_empty());
    }
}
