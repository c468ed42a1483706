//! Size-class slab pool.
//!
//! Requests up to 8 KiB round up to the next size class and are served from
//! a per-core free list. Empty lists refill in 1 MiB batches so the
//! underlying allocator is hit rarely and in bulk. A stripe that accumulates
//! surplus buffers drains half of them to a shared pool, keeping one idle
//! core's memory available to the others.

use crate::stripe::Striped;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// The size-class table. Requests above the last class go to the extent
/// heap instead.
pub const SIZE_CLASSES: [usize; 14] = [
    16, 32, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 2048, 4096, 8192,
];

/// Refill granularity per class.
const REFILL_BYTES: usize = 1 << 20;

/// A stripe free list drains down to half when it grows past this many
/// buffers.
const STRIPE_SURPLUS: usize = 512;

/// Index of the smallest class that fits `len`, or `None` above 8 KiB.
pub fn class_for(len: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&c| c >= len)
}

struct ClassPool {
    class_bytes: usize,
    local: Striped<Mutex<Vec<Box<[u8]>>>>,
    shared: Mutex<Vec<Box<[u8]>>>,
}

impl ClassPool {
    fn new(class_bytes: usize) -> Self {
        ClassPool {
            class_bytes,
            local: Striped::per_core(|| Mutex::new(Vec::new())),
            shared: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Box<[u8]> {
        if let Some(buf) = self.local.local().lock().pop() {
            return buf;
        }
        {
            let mut shared = self.shared.lock();
            if let Some(buf) = shared.pop() {
                return buf;
            }
        }
        // Bulk refill: carve a 1 MiB batch into class-size buffers, keep
        // one, park the rest on the local stripe.
        let count = (REFILL_BYTES / self.class_bytes).max(1);
        let mut local = self.local.local().lock();
        for _ in 0..count - 1 {
            local.push(vec![0u8; self.class_bytes].into_boxed_slice());
        }
        vec![0u8; self.class_bytes].into_boxed_slice()
    }

    fn put(&self, buf: Box<[u8]>) {
        let mut local = self.local.local().lock();
        local.push(buf);
        if local.len() > STRIPE_SURPLUS {
            let keep = local.len() / 2;
            let mut shared = self.shared.lock();
            shared.extend(local.drain(keep..));
        }
    }
}

/// The slab pool: one [`ClassPool`] per size class.
pub struct SlabPool {
    classes: Vec<ClassPool>,
}

impl SlabPool {
    /// An empty pool; memory is acquired lazily on first allocation.
    pub fn new() -> Arc<Self> {
        Arc::new(SlabPool {
            classes: SIZE_CLASSES.iter().map(|&c| ClassPool::new(c)).collect(),
        })
    }

    /// Allocate a buffer of at least `len` bytes.
    ///
    /// Returns `None` for requests above the largest size class; those
    /// belong to the extent heap.
    pub fn allocate(self: &Arc<Self>, len: usize) -> Option<SlabBuf> {
        let class = class_for(len)?;
        let buf = self.classes[class].take();
        Some(SlabBuf {
            pool: Arc::clone(self),
            class,
            len,
            buf: Some(buf),
        })
    }

    /// Total buffers parked across all free lists. Diagnostics only.
    pub fn idle_buffers(&self) -> usize {
        self.classes
            .iter()
            .map(|c| {
                c.local.iter().map(|l| l.lock().len()).sum::<usize>() + c.shared.lock().len()
            })
            .sum()
    }
}

/// An owned slab buffer. Returns to its class free list on drop.
pub struct SlabBuf {
    pool: Arc<SlabPool>,
    class: usize,
    len: usize,
    buf: Option<Box<[u8]>>,
}

impl SlabBuf {
    /// Requested length (the backing buffer may be larger).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the requested length was zero.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The backing size class in bytes.
    pub fn capacity(&self) -> usize {
        SIZE_CLASSES[self.class]
    }
}

impl Deref for SlabBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.buf.as_ref().unwrap()[..self.len]
    }
}

impl DerefMut for SlabBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf.as_mut().unwrap()[..self.len]
    }
}

impl Drop for SlabBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.classes[self.class].put(buf);
        }
    }
}
