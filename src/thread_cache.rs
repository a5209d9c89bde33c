//! Thread cache: per-thread, per-size-class free lists. The fast path
//! touches no locks at all.
//!
//! Refills from the central cache follow a slow-start policy: the batch
//! size doubles on every miss until it reaches the class's ceiling, so a
//! thread that touches a class once does not hoard a full batch. The same
//! watermark trims lists that only ever receive frees.

use crate::central_cache::CentralCache;
use crate::page_heap::PageHeap;
use crate::pagemap::PageMap;
use crate::size_class::{self, MAX_CLASSES};
use crate::span::FreeObject;
use core::ptr;

/// Singly-linked object list with O(1) range splices at both ends.
struct FreeList {
    head: *mut FreeObject,
    tail: *mut FreeObject,
    len: usize,
    /// Next refill batch; doubles per miss up to `slow_start_max`.
    slow_start: usize,
    /// Ceiling for the batch size (`num_move_size` of the class).
    slow_start_max: usize,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
            slow_start: 1,
            slow_start_max: 0,
        }
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[inline]
    unsafe fn push(&mut self, obj: *mut FreeObject) {
        unsafe { (*obj).next = self.head };
        if self.head.is_null() {
            self.tail = obj;
        }
        self.head = obj;
        self.len += 1;
    }

    #[inline]
    unsafe fn pop(&mut self) -> *mut FreeObject {
        let obj = self.head;
        debug_assert!(!obj.is_null());
        self.head = unsafe { (*obj).next };
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        self.len -= 1;
        obj
    }

    /// Splice a linked run of `n` objects onto the front.
    unsafe fn push_range(&mut self, head: *mut FreeObject, tail: *mut FreeObject, n: usize) {
        debug_assert!(!head.is_null() && !tail.is_null());
        unsafe { (*tail).next = self.head };
        if self.head.is_null() {
            self.tail = tail;
        }
        self.head = head;
        self.len += n;
    }

    /// Detach the first `n` objects as a null-terminated run.
    unsafe fn pop_range(&mut self, n: usize) -> (*mut FreeObject, *mut FreeObject) {
        debug_assert!(n >= 1 && n <= self.len);
        let head = self.head;
        let mut tail = head;
        for _ in 0..n - 1 {
            tail = unsafe { (*tail).next };
        }
        unsafe {
            self.head = (*tail).next;
            (*tail).next = ptr::null_mut();
        }
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        self.len -= n;
        (head, tail)
    }
}

/// Per-thread cache. Owned by exactly one thread, so no field needs
/// synchronization; the central cache is the only shared boundary.
pub struct ThreadCache {
    lists: [FreeList; MAX_CLASSES],
}

impl ThreadCache {
    pub fn new() -> Self {
        size_class::ensure_init();
        let mut lists = [const { FreeList::new() }; MAX_CLASSES];
        for (class, list) in lists.iter_mut().enumerate() {
            list.slow_start_max = size_class::num_move_size(class);
        }
        Self { lists }
    }

    /// Allocate one object of at most `MAX_BYTES` bytes. Null only on OS
    /// out-of-memory.
    ///
    /// # Safety
    /// Must be called from the thread that owns this cache.
    pub unsafe fn allocate(
        &mut self,
        size: usize,
        central: &CentralCache,
        page_heap: &PageHeap,
        pagemap: &PageMap,
    ) -> *mut u8 {
        let class = size_class::index(size);
        let list = &mut self.lists[class];
        if !list.is_empty() {
            return unsafe { list.pop() as *mut u8 };
        }
        unsafe { self.fetch_from_central(class, central, page_heap, pagemap) }
    }

    /// Return one object of the given (class-consistent) size.
    ///
    /// # Safety
    /// Must be called from the owning thread; `ptr` must be an object of
    /// `size`'s class fetched through this allocator.
    pub unsafe fn deallocate(
        &mut self,
        ptr: *mut u8,
        size: usize,
        central: &CentralCache,
        page_heap: &PageHeap,
        pagemap: &PageMap,
    ) {
        debug_assert!(!ptr.is_null());
        let class = size_class::index(size);
        let list = &mut self.lists[class];
        unsafe { list.push(ptr as *mut FreeObject) };

        // A list hoarding more than one warm batch past its slow-start
        // level is probably a burst that ended; give a batch back.
        if list.len >= list.slow_start + list.slow_start_max {
            unsafe { self.list_too_long(class, central, page_heap, pagemap) };
        }
    }

    #[cold]
    unsafe fn fetch_from_central(
        &mut self,
        class: usize,
        central: &CentralCache,
        page_heap: &PageHeap,
        pagemap: &PageMap,
    ) -> *mut u8 {
        let list = &mut self.lists[class];
        let batch = list.slow_start.min(list.slow_start_max);
        list.slow_start = (list.slow_start << 1).min(list.slow_start_max);

        let (head, tail, got) = central.fetch_range(class, batch, page_heap, pagemap);
        if got == 0 {
            return ptr::null_mut();
        }

        // First object goes to the caller, the rest stay local.
        if got > 1 {
            unsafe { self.lists[class].push_range((*head).next, tail, got - 1) };
        }
        head as *mut u8
    }

    unsafe fn list_too_long(
        &mut self,
        class: usize,
        central: &CentralCache,
        page_heap: &PageHeap,
        pagemap: &PageMap,
    ) {
        let list = &mut self.lists[class];
        let n = list.slow_start_max;
        let (head, _tail) = unsafe { list.pop_range(n) };
        unsafe { central.release_list(head, class, page_heap, pagemap) };
    }

    /// Hand every cached object back to the central cache. Called by the
    /// TLS guard on thread exit.
    ///
    /// # Safety
    /// Must be called from the owning thread, with no further use of the
    /// cache afterwards.
    pub unsafe fn flush(
        &mut self,
        central: &CentralCache,
        page_heap: &PageHeap,
        pagemap: &PageMap,
    ) {
        for class in 0..MAX_CLASSES {
            let list = &mut self.lists[class];
            if list.is_empty() {
                continue;
            }
            let head = list.head;
            list.head = ptr::null_mut();
            list.tail = ptr::null_mut();
            list.len = 0;
            unsafe { central.release_list(head, class, page_heap, pagemap) };
        }
    }
}
