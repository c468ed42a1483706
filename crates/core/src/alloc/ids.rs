//! Compact free-list-backed integer id allocator.

use parking_lot::Mutex;

/// Issues dense `u64` ids, recycling freed ones before growing the range.
#[derive(Debug)]
pub struct IdAllocator {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    start: u64,
    next: u64,
    free: Vec<u64>,
}

impl IdAllocator {
    /// Start issuing at `first`.
    pub fn starting_at(first: u64) -> Self {
        IdAllocator {
            inner: Mutex::new(Inner {
                start: first,
                next: first,
                free: Vec::new(),
            }),
        }
    }

    /// Take an id, preferring recycled ones.
    pub fn allocate(&self) -> u64 {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.free.pop() {
            return id;
        }
        let id = inner.next;
        inner.next += 1;
        id
    }

    /// Return an id for reuse. The caller must not hand back an id twice.
    pub fn free(&self, id: u64) {
        let mut inner = self.inner.lock();
        debug_assert!(id < inner.next, "freeing an id that was never issued");
        inner.free.push(id);
    }

    /// Advance the fresh-id floor past `id` (used after recovery so new ids
    /// never collide with replayed ones).
    pub fn reserve_through(&self, id: u64) {
        let mut inner = self.inner.lock();
        if inner.next <= id {
            inner.next = id + 1;
        }
    }

    /// Ids issued and never freed.
    pub fn live_count(&self) -> u64 {
        let inner = self.inner.lock();
        (inner.next - inner.start) - inner.free.len() as u64
    }
}
