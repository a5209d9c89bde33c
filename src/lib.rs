//! kzalloc: a concurrent memory allocator built as three cache tiers.
//!
//! - Thread-local caches (fast path, no locks)
//! - Central cache (per-size-class spin locks, brokers spans to threads)
//! - Sharded page heap (span coalescing, hot/cold page lifecycle, OS interface)
//!
//! # Usage
//!
//! ```ignore
//! let p = kzalloc::allocate(64);
//! assert!(!p.is_null());
//! unsafe { kzalloc::deallocate_sized(p, 64) };
//! ```

pub mod size_class;
pub mod platform;
pub mod sync;
pub mod object_pool;
pub mod span;
pub mod pagemap;
pub mod page_heap;
pub mod central_cache;
pub mod thread_cache;
pub mod allocator;

/// Page size used by the allocator (8 KiB).
pub const PAGE_SHIFT: usize = 13;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

// Re-export the facade at crate root for convenience
pub use allocator::{
    allocate, deallocate, deallocate_sized, reallocate, reallocate_unsized,
};
