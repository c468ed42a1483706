//! Reference-counted out-of-line blob storage.
//!
//! Large byte arrays live in the extent heap; the inline property block
//! carries only a handle and the commit version of the writing transaction.

use crate::alloc::{ExtentHeap, HeapAlloc, IdAllocator};
use crate::context::EngineContext;
use crate::types::Version;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct BlobSlot {
    refs: AtomicU32,
    data: HeapAlloc,
    commit_version: Version,
}

/// The process-wide blob store. Owned by [`EngineContext`].
pub struct BlobStore {
    heap: Arc<ExtentHeap>,
    slots: RwLock<FxHashMap<u64, Arc<BlobSlot>>>,
    ids: IdAllocator,
}

impl BlobStore {
    /// An empty store with its own heap.
    pub fn new() -> Self {
        BlobStore {
            heap: ExtentHeap::new(),
            slots: RwLock::new(FxHashMap::default()),
            ids: IdAllocator::starting_at(1),
        }
    }

    fn insert(&self, data: &[u8], commit_version: Version) -> u64 {
        let id = self.ids.allocate();
        let slot = Arc::new(BlobSlot {
            refs: AtomicU32::new(1),
            data: self.heap.allocate(data),
            commit_version,
        });
        self.slots.write().insert(id, slot);
        id
    }

    fn acquire(&self, id: u64) {
        if let Some(slot) = self.slots.read().get(&id) {
            slot.refs.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn release(&self, id: u64) {
        let dead = {
            let slots = self.slots.read();
            match slots.get(&id) {
                Some(slot) => slot.refs.fetch_sub(1, Ordering::AcqRel) == 1,
                None => false,
            }
        };
        if dead {
            self.slots.write().remove(&id);
            self.ids.free(id);
        }
    }

    fn read(&self, id: u64) -> Option<Vec<u8>> {
        let slots = self.slots.read();
        slots.get(&id).map(|s| s.data.read())
    }

    fn commit_version(&self, id: u64) -> Option<Version> {
        self.slots.read().get(&id).map(|s| s.commit_version)
    }

    /// Live blob count. Diagnostics only.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Whether no blobs are live.
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

impl Default for BlobStore {
    fn default() -> Self {
        Self::new()
    }
}

/// An owned reference to an out-of-line blob.
#[derive(Debug)]
pub struct BlobRef {
    id: u64,
}

impl BlobRef {
    /// Store `data` under a fresh handle.
    pub fn new(data: &[u8], commit_version: Version) -> Self {
        BlobRef {
            id: EngineContext::global().blobs().insert(data, commit_version),
        }
    }

    /// The stable handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Copy the blob contents out.
    pub fn bytes(&self) -> Vec<u8> {
        EngineContext::global().blobs().read(self.id).unwrap_or_default()
    }

    /// Commit version of the writing transaction.
    pub fn commit_version(&self) -> Version {
        EngineContext::global()
            .blobs()
            .commit_version(self.id)
            .unwrap_or(0)
    }
}

impl Clone for BlobRef {
    fn clone(&self) -> Self {
        EngineContext::global().blobs().acquire(self.id);
        BlobRef { id: self.id }
    }
}

impl Drop for BlobRef {
    fn drop(&mut self) {
        EngineContext::global().blobs().release(self.id);
    }
}

impl PartialEq for BlobRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id || self.bytes() == other.bytes()
    }
}

impl Eq for BlobRef {}

// Blobs cross the WAL and the wire by value; the handle is process-local.
impl serde::Serialize for BlobRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (self.commit_version(), self.bytes()).serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for BlobRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (commit_version, bytes): (Version, Vec<u8>) = serde::Deserialize::deserialize(deserializer)?;
        Ok(BlobRef::new(&bytes, commit_version))
    }
}
