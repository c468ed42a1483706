//! Reference-counted interned string table.
//!
//! String properties store a handle into this process-wide table instead of
//! owning their bytes. Handle 0 is the null string and handle 1 the empty
//! string; both are permanently live. Slot ids are stable for the table's
//! lifetime.
//!
//! Handle allocation is striped per core: each stripe keeps a free list and
//! drains its surplus into a shared pool past a threshold, so one hot core
//! cannot starve the others. A released slot (refcount reaching zero) goes
//! back to the releasing thread's stripe.

use crate::context::EngineContext;
use crate::stripe::Striped;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Handle of the null string.
pub const NULL_HANDLE: u32 = 0;

/// Handle of the empty string.
pub const EMPTY_HANDLE: u32 = 1;

/// Slots per chunk. Chunks are appended, never moved, so a handle indexes
/// the same slot forever.
const CHUNK_SLOTS: usize = 4096;

/// A stripe free list drains down to half when it grows past this.
const FREE_LIST_SURPLUS: usize = 256;

struct Slot {
    refs: AtomicU32,
    value: RwLock<Option<Arc<str>>>,
}

impl Slot {
    fn empty() -> Self {
        Slot {
            refs: AtomicU32::new(0),
            value: RwLock::new(None),
        }
    }
}

struct Chunk {
    slots: Vec<Slot>,
}

impl Chunk {
    fn new() -> Self {
        Chunk {
            slots: (0..CHUNK_SLOTS).map(|_| Slot::empty()).collect(),
        }
    }
}

/// The process-wide string table. Owned by [`EngineContext`].
pub struct StringTable {
    chunks: RwLock<Vec<Arc<Chunk>>>,
    free: Striped<Mutex<Vec<u32>>>,
    shared_free: Mutex<Vec<u32>>,
    next_unused: Mutex<u32>,
}

impl StringTable {
    /// An empty table with the two reserved handles live.
    pub fn new() -> Self {
        let table = StringTable {
            chunks: RwLock::new(vec![Arc::new(Chunk::new())]),
            free: Striped::per_core(|| Mutex::new(Vec::new())),
            shared_free: Mutex::new(Vec::new()),
            next_unused: Mutex::new(2),
        };
        // Pin the reserved handles so release() can never recycle them.
        {
            let chunks = table.chunks.read();
            let null = &chunks[0].slots[NULL_HANDLE as usize];
            null.refs.store(1, Ordering::Relaxed);
            let empty = &chunks[0].slots[EMPTY_HANDLE as usize];
            empty.refs.store(1, Ordering::Relaxed);
            *empty.value.write() = Some(Arc::from(""));
        }
        table
    }

    fn slot(&self, handle: u32) -> Arc<Chunk> {
        let chunks = self.chunks.read();
        Arc::clone(&chunks[handle as usize / CHUNK_SLOTS])
    }

    fn take_free_slot(&self) -> u32 {
        if let Some(h) = self.free.local().lock().pop() {
            return h;
        }
        if let Some(h) = self.shared_free.lock().pop() {
            return h;
        }
        let mut next = self.next_unused.lock();
        let handle = *next;
        *next += 1;
        let needed_chunk = handle as usize / CHUNK_SLOTS;
        let mut chunks = self.chunks.write();
        while chunks.len() <= needed_chunk {
            chunks.push(Arc::new(Chunk::new()));
        }
        handle
    }

    /// Intern a string: acquire a slot, store the value, refcount 1.
    /// The empty string always resolves to [`EMPTY_HANDLE`].
    pub fn insert(&self, s: &str) -> u32 {
        if s.is_empty() {
            self.acquire(EMPTY_HANDLE);
            return EMPTY_HANDLE;
        }
        let handle = self.take_free_slot();
        let chunk = self.slot(handle);
        let slot = &chunk.slots[handle as usize % CHUNK_SLOTS];
        *slot.value.write() = Some(Arc::from(s));
        slot.refs.store(1, Ordering::Release);
        handle
    }

    /// Increment a live handle's refcount.
    pub fn acquire(&self, handle: u32) {
        if handle == NULL_HANDLE {
            return;
        }
        let chunk = self.slot(handle);
        let prev = chunk.slots[handle as usize % CHUNK_SLOTS]
            .refs
            .fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "acquire of a dead string handle");
    }

    /// Decrement a handle's refcount; on reaching zero the slot returns to
    /// the calling thread's free list, with surplus migrated to the shared
    /// pool.
    pub fn release(&self, handle: u32) {
        if handle == NULL_HANDLE || handle == EMPTY_HANDLE {
            return;
        }
        let chunk = self.slot(handle);
        let slot = &chunk.slots[handle as usize % CHUNK_SLOTS];
        if slot.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            *slot.value.write() = None;
            let mut local = self.free.local().lock();
            local.push(handle);
            if local.len() > FREE_LIST_SURPLUS {
                let drain_from = local.len() / 2;
                let mut shared = self.shared_free.lock();
                shared.extend(local.drain(drain_from..));
            }
        }
    }

    /// Read the contents of a live handle. Null and dead handles yield
    /// `None`.
    pub fn get(&self, handle: u32) -> Option<Arc<str>> {
        if handle == NULL_HANDLE {
            return None;
        }
        let chunk = self.slot(handle);
        let value = chunk.slots[handle as usize % CHUNK_SLOTS].value.read().clone();
        value
    }

    /// Current refcount; test and diagnostics use only.
    pub fn refcount(&self, handle: u32) -> u32 {
        let chunk = self.slot(handle);
        chunk.slots[handle as usize % CHUNK_SLOTS]
            .refs
            .load(Ordering::Relaxed)
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

/// An owned reference to an interned string. Cloning bumps the refcount;
/// dropping releases it.
#[derive(Debug)]
pub struct InternedStr {
    handle: u32,
}

impl InternedStr {
    /// Intern `s` into the global table.
    pub fn new(s: &str) -> Self {
        InternedStr {
            handle: EngineContext::global().strings().insert(s),
        }
    }

    /// The stable slot handle.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// The string contents.
    pub fn as_arc(&self) -> Arc<str> {
        EngineContext::global()
            .strings()
            .get(self.handle)
            .unwrap_or_else(|| Arc::from(""))
    }
}

impl Clone for InternedStr {
    fn clone(&self) -> Self {
        EngineContext::global().strings().acquire(self.handle);
        InternedStr { handle: self.handle }
    }
}

impl Drop for InternedStr {
    fn drop(&mut self) {
        EngineContext::global().strings().release(self.handle);
    }
}

impl PartialEq for InternedStr {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle || self.as_arc() == other.as_arc()
    }
}

impl Eq for InternedStr {}

impl std::fmt::Display for InternedStr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_arc())
    }
}

impl serde::Serialize for InternedStr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_arc())
    }
}

impl<'de> serde::Deserialize<'de> for InternedStr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(InternedStr::new(&s))
    }
}
