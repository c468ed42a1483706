//! Per-object version chains.
//!
//! A chain holds every retained version of one object, newest first, so a
//! snapshot read scans forward to the first version at or below its read
//! version. Versions are immutable once published; a delete publishes a
//! tombstone version rather than mutating anything.
//!
//! Chain invariants:
//! - commit versions strictly descend front to back
//! - the front is the current head
//! - a tombstone carries no property block

use helio_core::value::PropertyBlock;
use helio_core::types::Version;
use std::collections::VecDeque;

/// One committed version of an object.
#[derive(Debug, Clone)]
pub struct StoredVersion {
    /// Version of the committing transaction.
    pub commit_version: Version,
    /// Whether this version deletes the object.
    pub tombstone: bool,
    /// Property block; `None` exactly when `tombstone`.
    pub block: Option<PropertyBlock>,
}

impl StoredVersion {
    /// A live version.
    pub fn live(commit_version: Version, block: PropertyBlock) -> Self {
        StoredVersion {
            commit_version,
            tombstone: false,
            block: Some(block),
        }
    }

    /// A deletion marker.
    pub fn tombstone(commit_version: Version) -> Self {
        StoredVersion {
            commit_version,
            tombstone: true,
            block: None,
        }
    }
}

/// The retained versions of one object, newest first.
#[derive(Debug, Clone, Default)]
pub struct VersionChain {
    versions: VecDeque<StoredVersion>,
}

impl VersionChain {
    /// A chain with a single version.
    pub fn new(version: StoredVersion) -> Self {
        let mut versions = VecDeque::with_capacity(2);
        versions.push_front(version);
        VersionChain { versions }
    }

    /// Prepend a new head. The caller must hold the class commit lock; the
    /// new version must be newer than the current head.
    pub fn push(&mut self, version: StoredVersion) {
        debug_assert!(
            self.versions
                .front()
                .map(|head| version.commit_version > head.commit_version)
                .unwrap_or(true),
            "version chain must stay strictly descending"
        );
        self.versions.push_front(version);
    }

    /// The current head.
    pub fn head(&self) -> Option<&StoredVersion> {
        self.versions.front()
    }

    /// Newest version visible at `read_version`, tombstones included.
    /// Callers translating to object visibility filter tombstones.
    pub fn visible_at(&self, read_version: Version) -> Option<&StoredVersion> {
        self.versions
            .iter()
            .find(|v| v.commit_version <= read_version)
    }

    /// Number of retained versions.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Whether the chain retains nothing.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Drop versions no snapshot can reach: everything older than the
    /// newest version at or below `min_read_version`. Returns the number of
    /// versions freed.
    pub fn prune(&mut self, min_read_version: Version) -> usize {
        let keep_through = match self
            .versions
            .iter()
            .position(|v| v.commit_version <= min_read_version)
        {
            Some(i) => i,
            None => return 0,
        };
        let removed = self.versions.len() - keep_through - 1;
        self.versions.truncate(keep_through + 1);
        removed
    }

    /// Whether the whole chain is reclaimable: the head is a tombstone no
    /// live snapshot can still see past.
    pub fn is_dead(&self, min_read_version: Version) -> bool {
        match self.versions.front() {
            Some(head) => head.tombstone && head.commit_version <= min_read_version,
            None => true,
        }
    }

    /// Iterate newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = &StoredVersion> {
        self.versions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helio_core::value::{PropertyBlock, PropertyValue};

    fn block(n: i64) -> PropertyBlock {
        PropertyBlock::new(vec![PropertyValue::I64(n)])
    }

    fn chain(versions: &[(Version, bool)]) -> VersionChain {
        let mut it = versions.iter();
        let first = it.next().unwrap();
        let mut c = VersionChain::new(make(first));
        for v in it {
            c.push(make(v));
        }
        c
    }

    fn make((v, dead): &(Version, bool)) -> StoredVersion {
        if *dead {
            StoredVersion::tombstone(*v)
        } else {
            StoredVersion::live(*v, block(*v as i64))
        }
    }

    #[test]
    fn visibility_picks_newest_at_or_below() {
        let c = chain(&[(1, false), (5, false), (9, false)]);
        assert_eq!(c.visible_at(9).unwrap().commit_version, 9);
        assert_eq!(c.visible_at(7).unwrap().commit_version, 5);
        assert_eq!(c.visible_at(5).unwrap().commit_version, 5);
        assert_eq!(c.visible_at(1).unwrap().commit_version, 1);
        assert!(c.visible_at(0).is_none());
    }

    #[test]
    fn tombstone_is_returned_for_caller_filtering() {
        let c = chain(&[(1, false), (5, true)]);
        let at5 = c.visible_at(5).unwrap();
        assert!(at5.tombstone);
        assert!(at5.block.is_none());
        assert!(!c.visible_at(4).unwrap().tombstone);
    }

    #[test]
    fn prune_keeps_newest_reachable_version() {
        let mut c = chain(&[(1, false), (5, false), (9, false)]);
        // min read version 6: version 5 is still reachable, version 1 not.
        assert_eq!(c.prune(6), 1);
        assert_eq!(c.len(), 2);
        assert_eq!(c.visible_at(6).unwrap().commit_version, 5);
        // Nothing older than the floor remains to prune.
        assert_eq!(c.prune(6), 0);
    }

    #[test]
    fn prune_with_floor_below_everything_is_a_noop() {
        let mut c = chain(&[(5, false), (9, false)]);
        assert_eq!(c.prune(3), 0);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn dead_chain_detection() {
        let c = chain(&[(1, false), (5, true)]);
        assert!(!c.is_dead(4));
        assert!(c.is_dead(5));
        let live = chain(&[(5, false)]);
        assert!(!live.is_dead(100));
    }

    proptest::proptest! {
        #[test]
        fn chain_stays_strictly_descending(mut versions in proptest::collection::vec(1u64..1000, 1..20)) {
            versions.sort_unstable();
            versions.dedup();
            let mut c = VersionChain::new(StoredVersion::live(versions[0], block(0)));
            for v in &versions[1..] {
                c.push(StoredVersion::live(*v, block(*v as i64)));
            }
            let collected: Vec<Version> = c.iter().map(|v| v.commit_version).collect();
            let mut expected = versions.clone();
            expected.reverse();
            proptest::prop_assert_eq!(collected, expected);
        }
    }
}
