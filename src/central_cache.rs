//! Central cache: per-size-class buckets of sliced spans, brokering runs of
//! objects between thread caches and the page heap.
//!
//! Each bucket has its own spin lock and is cache-line aligned so unrelated
//! classes never share a line. The bucket lock is dropped across every call
//! into the page heap.

use crate::page_heap::PageHeap;
use crate::pagemap::PageMap;
use crate::size_class::{self, MAX_BYTES, MAX_CLASSES};
use crate::span::{FreeObject, Span, SpanList};
use crate::sync::SpinMutex;
use crate::PAGE_SHIFT;
use core::ptr;

/// Hint the object after `obj` into cache; both walks below touch objects
/// strictly in link order.
#[inline]
fn prefetch_next(obj: *mut FreeObject) {
    #[cfg(target_arch = "x86_64")]
    if !obj.is_null() {
        // SAFETY: `obj` is a live free object; prefetching any address is
        // side-effect free.
        unsafe {
            use core::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
            _mm_prefetch::<_MM_HINT_T0>((*obj).next as *const i8);
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = obj;
}

#[repr(align(64))]
struct Bucket {
    spans: SpinMutex<SpanList>,
}

pub struct CentralCache {
    buckets: [Bucket; MAX_CLASSES],
}

impl CentralCache {
    pub fn new() -> Self {
        size_class::ensure_init();
        Self {
            buckets: core::array::from_fn(|_| Bucket {
                spans: SpinMutex::new(SpanList::new()),
            }),
        }
    }

    /// Detach up to `n` objects of class `class` as a null-terminated chain.
    /// Returns `(head, tail, count)`; count is 0 only when the OS refused
    /// memory.
    pub fn fetch_range(
        &self,
        class: usize,
        n: usize,
        page_heap: &PageHeap,
        pagemap: &PageMap,
    ) -> (*mut FreeObject, *mut FreeObject, usize) {
        debug_assert!(n >= 1);
        let bucket = &self.buckets[class];
        let mut spans = bucket.spans.lock();

        let mut span = Self::find_stocked(&spans);
        if span.is_null() {
            // Refill without holding the bucket: the page heap takes its
            // shard mutex and may touch the OS.
            drop(spans);
            let fresh = Self::provision_span(class, page_heap, pagemap);
            if fresh.is_null() {
                return (ptr::null_mut(), ptr::null_mut(), 0);
            }
            spans = bucket.spans.lock();
            unsafe { spans.push_front(fresh) };
            span = fresh;
        }

        unsafe {
            let head = (*span).free_list;
            debug_assert!(!head.is_null());
            let mut tail = head;
            let mut got = 1usize;
            // Objects may have been returned out of order; the chain walk
            // is unavoidable.
            while got < n && !(*tail).next.is_null() {
                prefetch_next((*tail).next);
                tail = (*tail).next;
                got += 1;
            }
            (*span).free_list = (*tail).next;
            (*tail).next = ptr::null_mut();
            (*span).use_count += got;
            (head, tail, got)
        }
    }

    /// Return a chain of class-`class` objects to their owning spans. Spans
    /// whose last object comes home go back to the page heap.
    ///
    /// # Safety
    /// Every object in the chain must have been fetched from this cache
    /// with class `class` and must not be referenced again.
    pub unsafe fn release_list(
        &self,
        head: *mut FreeObject,
        class: usize,
        page_heap: &PageHeap,
        pagemap: &PageMap,
    ) {
        let bucket = &self.buckets[class];
        let mut spans = bucket.spans.lock();

        let mut cur = head;
        while !cur.is_null() {
            unsafe {
                let next = (*cur).next;
                if !next.is_null() {
                    prefetch_next(next);
                }

                let span = pagemap.get((cur as usize >> PAGE_SHIFT) as u64);
                debug_assert!(!span.is_null(), "released object has no span");
                (*cur).next = (*span).free_list;
                (*span).free_list = cur;
                (*span).use_count -= 1;

                if (*span).use_count == 0 {
                    spans.erase(span);
                    (*span).free_list = ptr::null_mut();
                    drop(spans);
                    page_heap.release_span(span);
                    spans = bucket.spans.lock();
                }

                cur = next;
            }
        }
    }

    fn find_stocked(spans: &SpanList) -> *mut Span {
        let mut cur = spans.first();
        while !cur.is_null() {
            unsafe {
                if !(*cur).free_list.is_null() {
                    return cur;
                }
                cur = spans.next_of(cur);
            }
        }
        ptr::null_mut()
    }

    /// Pull a fresh span from the page heap and slice it into class-sized
    /// objects. Every page is registered so release can route each object
    /// home by address alone.
    fn provision_span(class: usize, page_heap: &PageHeap, pagemap: &PageMap) -> *mut Span {
        let aligned = size_class::class_size(class);
        let span = page_heap.new_span(pages_for_batch(aligned));
        if span.is_null() {
            return ptr::null_mut();
        }

        unsafe {
            (*span).obj_size = aligned;
            for i in 0..(*span).n {
                pagemap.set((*span).page_id + i as u64, span);
            }

            let start = (*span).start_addr();
            // Stop a full object short of the end; a partial tail object
            // would overrun the span.
            let last = start.add((*span).bytes() - aligned);
            (*span).free_list = start as *mut FreeObject;
            let mut tail = start as *mut FreeObject;
            let mut cur = start.add(aligned);
            while cur <= last {
                (*tail).next = cur as *mut FreeObject;
                tail = cur as *mut FreeObject;
                cur = cur.add(aligned);
            }
            (*tail).next = ptr::null_mut();
        }
        span
    }

    #[cfg(test)]
    fn span_count(&self, class: usize) -> usize {
        let spans = self.buckets[class].spans.lock();
        let mut count = 0;
        let mut cur = spans.first();
        while !cur.is_null() {
            count += 1;
            cur = unsafe { spans.next_of(cur) };
        }
        count
    }
}

/// Pages to request when provisioning a span for objects of `aligned`
/// bytes: enough for a warmed-up transfer batch, at least one page.
fn pages_for_batch(aligned: usize) -> usize {
    let batch = (MAX_BYTES / aligned).clamp(1, 512);
    ((batch * aligned) >> PAGE_SHIFT).max(1)
}
