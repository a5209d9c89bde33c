//! Facade: routes requests between the cache tiers and owns the process
//! globals.
//!
//! Small requests (≤ 256 KiB) go through the calling thread's cache; large
//! ones go straight to the page heap. The thread cache is created lazily
//! from a bootstrap pool and flushed back to the central cache by a TLS
//! guard on thread exit; while TLS is unavailable during teardown, requests
//! fall through to the central cache directly.

use crate::central_cache::CentralCache;
use crate::object_pool::ObjectPool;
use crate::page_heap::PageHeap;
use crate::pagemap::PageMap;
use crate::size_class::{self, MAX_BYTES};
use crate::span::FreeObject;
use crate::thread_cache::ThreadCache;
use crate::PAGE_SHIFT;
use core::cell::Cell;
use core::ptr;
use std::sync::OnceLock;

// =============================================================================
// Global state
// =============================================================================

static PAGE_MAP: PageMap = PageMap::new();

struct Globals {
    central: CentralCache,
    page_heap: PageHeap,
}

static GLOBALS: OnceLock<Globals> = OnceLock::new();

fn globals() -> &'static Globals {
    GLOBALS.get_or_init(|| {
        size_class::ensure_init();
        Globals {
            central: CentralCache::new(),
            page_heap: PageHeap::new(&PAGE_MAP),
        }
    })
}

// =============================================================================
// Thread-local cache plumbing
// =============================================================================

// Thread cache records must not come from the allocator they implement.
static TC_POOL: ObjectPool<ThreadCache> = ObjectPool::new();

/// Owns the thread's cache pointer; the `Drop` impl is the thread-exit hook
/// that drains the cache back into the central tier.
struct ThreadCacheHandle {
    cache: Cell<*mut ThreadCache>,
}

impl ThreadCacheHandle {
    fn get(&self) -> *mut ThreadCache {
        let mut tc = self.cache.get();
        if tc.is_null() {
            tc = TC_POOL.create(ThreadCache::new());
            self.cache.set(tc);
        }
        tc
    }
}

impl Drop for ThreadCacheHandle {
    fn drop(&mut self) {
        let tc = self.cache.get();
        if tc.is_null() {
            return;
        }
        self.cache.set(ptr::null_mut());
        let g = globals();
        // SAFETY: the record was created by this thread's handle and nothing
        // else can reach it.
        unsafe {
            (*tc).flush(&g.central, &g.page_heap, &PAGE_MAP);
            TC_POOL.destroy(tc);
        }
    }
}

thread_local! {
    static THREAD_CACHE: ThreadCacheHandle = const {
        ThreadCacheHandle {
            cache: Cell::new(ptr::null_mut()),
        }
    };
}

/// Run `f` against this thread's cache. None when TLS is gone (thread
/// startup/teardown) or the cache record cannot be created.
#[inline]
fn with_thread_cache<R>(f: impl FnOnce(&mut ThreadCache) -> R) -> Option<R> {
    THREAD_CACHE
        .try_with(|handle| {
            let tc = handle.get();
            if tc.is_null() {
                return None;
            }
            // SAFETY: the record belongs to this thread alone, and nothing
            // in the allocator re-enters the thread cache while `f` runs.
            Some(f(unsafe { &mut *tc }))
        })
        .ok()
        .flatten()
}

// =============================================================================
// Public API
// =============================================================================

/// Allocate `size` bytes, 8-byte aligned. Returns null for `size == 0` and
/// on out-of-memory.
pub fn allocate(size: usize) -> *mut u8 {
    if size == 0 {
        return ptr::null_mut();
    }
    let g = globals();

    if size > MAX_BYTES {
        return allocate_large(size, g);
    }

    if let Some(p) =
        with_thread_cache(|tc| unsafe { tc.allocate(size, &g.central, &g.page_heap, &PAGE_MAP) })
    {
        return p;
    }
    alloc_from_central(size, g)
}

/// Free a pointer returned by [`allocate`]/[`reallocate`], resolving its
/// size through the page map. No-op for null.
///
/// # Safety
/// `ptr` must be null or a pointer from this allocator that has not been
/// freed since.
pub unsafe fn deallocate(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let g = globals();

    let span = PAGE_MAP.get((ptr as usize >> PAGE_SHIFT) as u64);
    if span.is_null() {
        debug_assert!(false, "deallocate of a pointer this allocator never issued");
        return;
    }

    let size = unsafe { (*span).obj_size };
    if size > MAX_BYTES {
        // SAFETY: large spans carry no sliced objects; the user pointer was
        // the whole span.
        unsafe { g.page_heap.release_span(span) };
    } else {
        unsafe { deallocate_small(ptr, size, g) };
    }
}

/// Free with a caller-supplied size, skipping the page-map lookup on the
/// small path.
///
/// # Safety
/// As [`deallocate`]; additionally `size` must be the size requested at
/// allocation (or the size last passed to a growing [`reallocate`]), so it
/// maps to the same size class.
pub unsafe fn deallocate_sized(ptr: *mut u8, size: usize) {
    if ptr.is_null() {
        return;
    }
    if size > MAX_BYTES {
        // Large spans are released through the map anyway.
        unsafe { deallocate(ptr) };
        return;
    }
    let g = globals();
    unsafe { deallocate_small(ptr, size, g) };
}

/// Resize `ptr` from `old_size` to `new_size` bytes. Stays in place when
/// the size class does not grow; otherwise allocates, copies, and frees.
/// Null `ptr` behaves like [`allocate`]; `new_size == 0` frees and returns
/// null.
///
/// # Safety
/// `ptr` must be null or a live pointer from this allocator allocated with
/// `old_size`.
pub unsafe fn reallocate(ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
        return allocate(new_size);
    }
    if new_size == 0 {
        unsafe { deallocate_sized(ptr, old_size) };
        return ptr::null_mut();
    }

    let old_aligned = size_class::round_up(old_size);
    let new_aligned = size_class::round_up(new_size);

    // Same storage class, or a shrink: keep the block. Shrinks stay put to
    // avoid copy churn; the block still belongs to its original class.
    if new_aligned <= old_aligned {
        return ptr;
    }

    let fresh = allocate(new_size);
    if !fresh.is_null() {
        unsafe {
            ptr::copy_nonoverlapping(ptr, fresh, old_size.min(new_size));
            deallocate_sized(ptr, old_size);
        }
    }
    fresh
}

/// [`reallocate`] without a caller-supplied old size: the page map supplies
/// it.
///
/// # Safety
/// `ptr` must be null or a live pointer from this allocator.
pub unsafe fn reallocate_unsized(ptr: *mut u8, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
        return allocate(new_size);
    }
    if new_size == 0 {
        unsafe { deallocate(ptr) };
        return ptr::null_mut();
    }

    let span = PAGE_MAP.get((ptr as usize >> PAGE_SHIFT) as u64);
    if span.is_null() {
        debug_assert!(false, "reallocate of a pointer this allocator never issued");
        return ptr::null_mut();
    }
    // The recorded size is the aligned one; copying whole aligned blocks is
    // safe on the grow path.
    let old_size = unsafe { (*span).obj_size };
    unsafe { reallocate(ptr, old_size, new_size) }
}

// =============================================================================
// Routing helpers
// =============================================================================

fn allocate_large(size: usize, g: &Globals) -> *mut u8 {
    let aligned = size_class::round_up_to_page(size);
    let span = g.page_heap.new_span(aligned >> PAGE_SHIFT);
    if span.is_null() {
        return ptr::null_mut();
    }
    unsafe {
        (*span).obj_size = aligned;
        (*span).start_addr()
    }
}

unsafe fn deallocate_small(ptr: *mut u8, size: usize, g: &'static Globals) {
    let handled = with_thread_cache(|tc| unsafe {
        tc.deallocate(ptr, size, &g.central, &g.page_heap, &PAGE_MAP)
    });
    if handled.is_none() {
        unsafe { dealloc_to_central(ptr, size, g) };
    }
}

/// TLS-unavailable fallback: fetch a single object under the bucket lock.
#[cold]
fn alloc_from_central(size: usize, g: &Globals) -> *mut u8 {
    let class = size_class::index(size);
    let (head, _tail, got) = g.central.fetch_range(class, 1, &g.page_heap, &PAGE_MAP);
    if got == 0 {
        return ptr::null_mut();
    }
    head as *mut u8
}

/// TLS-unavailable fallback for frees.
#[cold]
unsafe fn dealloc_to_central(ptr: *mut u8, size: usize, g: &Globals) {
    let class = size_class::index(size);
    let obj = ptr as *mut FreeObject;
    unsafe {
        (*obj).next = ptr::null_mut();
        g.central.release_list(obj, class, &g.page_heap, &PAGE_MAP);
    }
}
