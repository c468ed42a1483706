//! Per-core striping primitives.
//!
//! Worker threads are not pinned to cores; instead hot state is striped by a
//! per-thread index assigned round-robin at first use. Each stripe is
//! cache-line aligned so neighbours never share a line.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Pads its contents to a cache line.
#[derive(Debug, Default)]
#[repr(align(64))]
pub struct CacheAligned<T>(pub T);

static NEXT_THREAD_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_SLOT: usize = NEXT_THREAD_SLOT.fetch_add(1, Ordering::Relaxed);
}

/// Index of the calling thread's stripe slot. Stable for the thread's
/// lifetime.
pub fn thread_slot() -> usize {
    THREAD_SLOT.with(|s| *s)
}

/// Default stripe count: one per available core.
pub fn default_stripes() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// A fixed array of cache-line-aligned stripes, indexed by the calling
/// thread.
#[derive(Debug)]
pub struct Striped<T> {
    stripes: Box<[CacheAligned<T>]>,
}

impl<T> Striped<T> {
    /// Build `n` stripes from a constructor.
    pub fn new(n: usize, mut init: impl FnMut() -> T) -> Self {
        let stripes: Vec<CacheAligned<T>> = (0..n.max(1)).map(|_| CacheAligned(init())).collect();
        Striped {
            stripes: stripes.into_boxed_slice(),
        }
    }

    /// Build with one stripe per available core.
    pub fn per_core(init: impl FnMut() -> T) -> Self {
        Self::new(default_stripes(), init)
    }

    /// The stripe owned by the calling thread.
    #[inline]
    pub fn local(&self) -> &T {
        &self.stripes[thread_slot() % self.stripes.len()].0
    }

    /// The stripe at a fixed index (modulo the stripe count).
    #[inline]
    pub fn at(&self, index: usize) -> &T {
        &self.stripes[index % self.stripes.len()].0
    }

    /// Number of stripes.
    #[inline]
    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    /// Always false; a striped set has at least one stripe.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterate over all stripes.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.stripes.iter().map(|s| &s.0)
    }
}

/// A counter striped across cores. Increments touch only the local stripe;
/// reads sum all stripes.
#[derive(Debug)]
pub struct StripedCounter {
    stripes: Striped<AtomicU64>,
}

impl StripedCounter {
    /// A zeroed counter with one stripe per core.
    pub fn new() -> Self {
        StripedCounter {
            stripes: Striped::per_core(AtomicU64::default),
        }
    }

    /// Add to the calling thread's stripe.
    #[inline]
    pub fn add(&self, n: u64) {
        self.stripes.local().fetch_add(n, Ordering::Relaxed);
    }

    /// Sum across all stripes. Not a linearizable snapshot.
    pub fn sum(&self) -> u64 {
        self.stripes.iter().map(|s| s.load(Ordering::Relaxed)).sum()
    }
}

impl Default for StripedCounter {
    fn default() -> Self {
        Self::new()
    }
}
