//! Allocation primitives.
//!
//! - [`SlabPool`]: fixed size-class buffer pool for requests up to 8 KiB,
//!   striped per core and refilled in 1 MiB batches
//! - [`ExtentHeap`]: first-fit, address-ordered extent allocator with
//!   coalescing, for requests above the largest slab class
//! - [`IdAllocator`]: compact free-list-backed integer id allocator

pub mod heap;
pub mod ids;
pub mod slab;

pub use heap::{ExtentHeap, HeapAlloc};
pub use ids::IdAllocator;
pub use slab::{SlabBuf, SlabPool, SIZE_CLASSES};
