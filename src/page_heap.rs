//! Sharded page heap: owns every page range, splits and coalesces spans,
//! and manages the hot/cold physical-memory lifecycle.
//!
//! Each shard is an independent arena with its own mutex, span pool, and
//! free lists; a span is pinned to the shard that created it for its whole
//! lifetime, so coalescing never crosses a shard boundary and release never
//! takes a foreign lock.

use crate::object_pool::ObjectPool;
use crate::pagemap::PageMap;
use crate::platform;
use crate::span::{self, Span, SpanList};
use crate::PAGE_SHIFT;
use core::mem;
use core::ptr;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Spans with fewer pages than this live in the directly indexed lists;
/// larger spans go to the size-ordered maps. One slot is wasted so a page
/// count indexes its list without adjustment.
pub const NPAGES: usize = 129;

/// Smallest per-shard reclaim watermark: 4096 pages = 32 MiB.
const MIN_SHARD_THRESHOLD_PAGES: usize = 4096;

/// Hard cap on the process-wide hot-page cache used for the default
/// watermark: 4 GiB.
const MAX_CACHE_BYTES: u64 = 4 * 1024 * 1024 * 1024;

const THRESHOLD_ENV: &str = "KZALLOC_SHARD_THRESHOLD_PAGES";

enum LargeProbe {
    /// No span at or above the requested size.
    Miss,
    /// A ghost entry was erased; re-run the whole probe sequence.
    Retry,
    Got(*mut Span),
}

struct ShardState {
    /// Fully committed free spans of 1..NPAGES pages, indexed by page count.
    hot_small: [SpanList; NPAGES],
    /// Fully committed free spans of NPAGES pages and up, keyed by page
    /// count for best-fit lookup.
    hot_large: BTreeMap<usize, SpanList>,
    /// Decommitted counterparts. Cold pages are not counted against the
    /// reclaim watermark.
    cold_small: [SpanList; NPAGES],
    cold_large: BTreeMap<usize, SpanList>,
    /// Span records for this shard; bootstrap storage, never the host heap.
    span_pool: ObjectPool<Span>,
    /// Sum of `n` over all hot free spans.
    total_free_hot_pages: usize,
    /// Watermark above which hot spans are decommitted.
    release_threshold_pages: usize,
    shard_id: u8,
}

// SAFETY: raw span pointers are only dereferenced under the shard mutex.
unsafe impl Send for ShardState {}

impl ShardState {
    fn new(shard_id: u8, release_threshold_pages: usize) -> Self {
        Self {
            hot_small: core::array::from_fn(|_| SpanList::new()),
            hot_large: BTreeMap::new(),
            cold_small: core::array::from_fn(|_| SpanList::new()),
            cold_large: BTreeMap::new(),
            span_pool: ObjectPool::new(),
            total_free_hot_pages: 0,
            release_threshold_pages,
            shard_id,
        }
    }

    /// Pop a span from the first list keyed at or above `k`.
    fn probe_large(map: &mut BTreeMap<usize, SpanList>, k: usize) -> LargeProbe {
        let key = match map.range(k..).next() {
            Some((&key, _)) => key,
            None => return LargeProbe::Miss,
        };
        if let Some(list) = map.get_mut(&key) {
            let span = list.pop_front();
            if span.is_null() {
                // Coalescing stole the last member and left the key behind.
                map.remove(&key);
                return LargeProbe::Retry;
            }
            return LargeProbe::Got(span);
        }
        LargeProbe::Miss
    }

    /// Trim `span` down to `k` pages, requeue the remainder with the
    /// source's hot/cold state, and hand the low part out.
    unsafe fn split_and_issue(
        &mut self,
        span: *mut Span,
        k: usize,
        from_cold: bool,
        pagemap: &PageMap,
    ) -> *mut Span {
        unsafe {
            debug_assert!((*span).n >= k);
            if (*span).n > k {
                let rem = self
                    .span_pool
                    .create(Span::new((*span).page_id + k as u64, (*span).n - k));
                assert!(!rem.is_null(), "out of memory: span record");
                (*rem).is_cold = from_cold;
                (*rem).shard_id = self.shard_id;
                (*span).n = k;

                pagemap.set((*rem).page_id, rem);
                pagemap.set((*rem).page_id + (*rem).n as u64 - 1, rem);
                self.insert_free(rem, from_cold);
            }

            (*span).is_in_use = true;
            (*span).is_cold = false;
            pagemap.set((*span).page_id, span);
            pagemap.set((*span).page_id + k as u64 - 1, span);
            span
        }
    }

    /// File a free span under its size, crediting the hot-page counter for
    /// hot spans.
    unsafe fn insert_free(&mut self, span: *mut Span, cold: bool) {
        unsafe {
            let n = (*span).n;
            let (small, large) = if cold {
                (&mut self.cold_small, &mut self.cold_large)
            } else {
                (&mut self.hot_small, &mut self.hot_large)
            };
            if n < NPAGES {
                small[n].push_front(span);
            } else {
                large.entry(n).or_insert_with(SpanList::new).push_front(span);
            }
            if !cold {
                self.total_free_hot_pages += n;
            }
        }
    }

    unsafe fn new_span(&mut self, k: usize, pagemap: &PageMap) -> *mut Span {
        loop {
            // Hot tier: exact size, then the smallest splittable span.
            if k < NPAGES {
                for i in k..NPAGES {
                    if !self.hot_small[i].is_empty() {
                        let span = self.hot_small[i].pop_front();
                        self.total_free_hot_pages -= unsafe { (*span).n };
                        return unsafe { self.split_and_issue(span, k, false, pagemap) };
                    }
                }
            }
            match Self::probe_large(&mut self.hot_large, k) {
                LargeProbe::Got(span) => {
                    self.total_free_hot_pages -= unsafe { (*span).n };
                    return unsafe { self.split_and_issue(span, k, false, pagemap) };
                }
                LargeProbe::Retry => continue,
                LargeProbe::Miss => {}
            }

            // Cold tier: reusing a decommitted range beats mapping fresh
            // pages; the kernel refaults it on first touch.
            if k < NPAGES {
                for i in k..NPAGES {
                    if !self.cold_small[i].is_empty() {
                        let span = self.cold_small[i].pop_front();
                        return unsafe { self.split_and_issue(span, k, true, pagemap) };
                    }
                }
            }
            match Self::probe_large(&mut self.cold_large, k) {
                LargeProbe::Got(span) => {
                    return unsafe { self.split_and_issue(span, k, true, pagemap) }
                }
                LargeProbe::Retry => continue,
                LargeProbe::Miss => {}
            }

            // OS fallback. Large requests map exactly; small requests pull a
            // whole batch, bank it hot, and retry.
            if k >= NPAGES {
                let ptr = platform::alloc_pages(k);
                if ptr.is_null() {
                    return ptr::null_mut();
                }
                let span = self.span_pool.create(Span::new((ptr as u64) >> PAGE_SHIFT, k));
                assert!(!span.is_null(), "out of memory: span record");
                unsafe {
                    (*span).is_in_use = true;
                    (*span).shard_id = self.shard_id;
                    pagemap.set((*span).page_id, span);
                    pagemap.set((*span).page_id + k as u64 - 1, span);
                }
                log::debug!(
                    "shard {}: mapped {} pages from the OS for a large span",
                    self.shard_id,
                    k
                );
                return span;
            }

            let batch = NPAGES - 1;
            let ptr = platform::alloc_pages(batch);
            if ptr.is_null() {
                return ptr::null_mut();
            }
            let span = self
                .span_pool
                .create(Span::new((ptr as u64) >> PAGE_SHIFT, batch));
            assert!(!span.is_null(), "out of memory: span record");
            unsafe {
                (*span).shard_id = self.shard_id;
                pagemap.set((*span).page_id, span);
                pagemap.set((*span).page_id + batch as u64 - 1, span);
                self.insert_free(span, false);
            }
            log::debug!(
                "shard {}: mapped a {}-page batch from the OS",
                self.shard_id,
                batch
            );
        }
    }

    unsafe fn release_span(&mut self, span: *mut Span, pagemap: &PageMap) {
        unsafe {
            debug_assert_eq!((*span).shard_id, self.shard_id);
            debug_assert_eq!((*span).use_count, 0);

            // Coalesce left: the page below our base is the top edge of any
            // lower neighbor, which keeps its edges registered while free.
            while (*span).page_id > 0 {
                let left = pagemap.get((*span).page_id - 1);
                if left.is_null() || (*left).is_in_use || (*left).shard_id != self.shard_id {
                    break;
                }
                span::detach(left);
                if !(*left).is_cold {
                    self.total_free_hot_pages -= (*left).n;
                }
                (*span).page_id = (*left).page_id;
                (*span).n += (*left).n;
                self.span_pool.destroy(left);
            }

            // Coalesce right.
            loop {
                let right = pagemap.get((*span).page_id + (*span).n as u64);
                if right.is_null() || (*right).is_in_use || (*right).shard_id != self.shard_id {
                    break;
                }
                span::detach(right);
                if !(*right).is_cold {
                    self.total_free_hot_pages -= (*right).n;
                }
                (*span).n += (*right).n;
                self.span_pool.destroy(right);
            }

            // The merged span may absorb cold parts; it re-enters as hot and
            // the next reclaim sweep will cool it again if it sits unused.
            (*span).is_in_use = false;
            (*span).is_cold = false;
            (*span).free_list = ptr::null_mut();

            // Free spans keep only their edges in the map; that is all the
            // neighbor probes above ever read.
            pagemap.set((*span).page_id, span);
            pagemap.set((*span).page_id + (*span).n as u64 - 1, span);

            self.insert_free(span, false);

            if self.total_free_hot_pages > self.release_threshold_pages {
                self.reclaim();
            }
        }
    }

    /// Decommit hot spans until the watermark is met: large spans first
    /// (biggest keys first), then small spans from high page counts down,
    /// stopping early so the hottest small runs survive.
    unsafe fn reclaim(&mut self) {
        let before = self.total_free_hot_pages;

        while self.total_free_hot_pages > self.release_threshold_pages {
            let key = match self.hot_large.iter().next_back() {
                Some((&key, _)) => key,
                None => break,
            };
            let span = match self.hot_large.get_mut(&key) {
                Some(list) => list.pop_front(),
                None => break,
            };
            if span.is_null() {
                self.hot_large.remove(&key);
                continue;
            }
            unsafe { self.make_cold(span) };
        }

        if self.total_free_hot_pages > self.release_threshold_pages {
            for i in (1..NPAGES).rev() {
                loop {
                    if self.total_free_hot_pages <= self.release_threshold_pages {
                        break;
                    }
                    let span = self.hot_small[i].pop_front();
                    if span.is_null() {
                        break;
                    }
                    unsafe { self.make_cold(span) };
                }
                if self.total_free_hot_pages <= self.release_threshold_pages {
                    break;
                }
            }
        }

        log::debug!(
            "shard {}: reclaim moved {} hot pages cold ({} still hot, threshold {})",
            self.shard_id,
            before - self.total_free_hot_pages,
            self.total_free_hot_pages,
            self.release_threshold_pages
        );
    }

    unsafe fn make_cold(&mut self, span: *mut Span) {
        unsafe {
            self.total_free_hot_pages -= (*span).n;
            (*span).is_cold = true;
            platform::decommit((*span).start_addr(), (*span).bytes());
            // Map entries stay put so neighbors still find this span when
            // they coalesce.
            let n = (*span).n;
            if n < NPAGES {
                self.cold_small[n].push_front(span);
            } else {
                self.cold_large
                    .entry(n)
                    .or_insert_with(SpanList::new)
                    .push_front(span);
            }
        }
    }
}

/// One independently locked arena of the page heap.
#[repr(align(64))]
pub struct PageHeapShard {
    state: Mutex<ShardState>,
}

impl PageHeapShard {
    pub fn new(shard_id: u8, release_threshold_pages: usize) -> Self {
        Self {
            state: Mutex::new(ShardState::new(shard_id, release_threshold_pages)),
        }
    }

    /// Carve out a span of exactly `k` pages. Null only when the OS refuses
    /// memory. The result is hot, in use, and edge-registered in `pagemap`.
    pub fn new_span(&self, k: usize, pagemap: &PageMap) -> *mut Span {
        debug_assert!(k > 0);
        let mut st = self.state.lock();
        unsafe { st.new_span(k, pagemap) }
    }

    /// Return a span to this shard, merging it with free neighbors and
    /// reclaiming physical memory past the watermark.
    ///
    /// # Safety
    /// `span` must have been issued by this shard and have no objects or
    /// user references outstanding.
    pub unsafe fn release_span(&self, span: *mut Span, pagemap: &PageMap) {
        let mut st = self.state.lock();
        unsafe { st.release_span(span, pagemap) };
    }

    /// Sum of pages across hot free spans.
    pub fn free_hot_pages(&self) -> usize {
        self.state.lock().total_free_hot_pages
    }

    #[cfg(test)]
    fn snapshot_free(&self) -> Vec<(u64, usize, bool)> {
        let st = self.state.lock();
        let mut out = Vec::new();
        let mut scan = |list: &SpanList| {
            let mut cur = list.first();
            while !cur.is_null() {
                unsafe {
                    out.push(((*cur).page_id, (*cur).n, (*cur).is_cold));
                    cur = list.next_of(cur);
                }
            }
        };
        for list in st.hot_small.iter().chain(st.cold_small.iter()) {
            scan(list);
        }
        for list in st.hot_large.values().chain(st.cold_large.values()) {
            scan(list);
        }
        out
    }

    #[cfg(test)]
    fn hot_large_keys(&self) -> Vec<usize> {
        self.state.lock().hot_large.keys().copied().collect()
    }
}

/// Routing front for the shard array. Constructed once, lives for the
/// process.
pub struct PageHeap {
    shards: *mut PageHeapShard,
    shard_count: usize,
    shard_mask: usize,
    pagemap: &'static PageMap,
}

// SAFETY: the shard array is immutable after construction; all mutable
// state sits behind each shard's mutex.
unsafe impl Send for PageHeap {}
unsafe impl Sync for PageHeap {}

impl PageHeap {
    pub fn new(pagemap: &'static PageMap) -> Self {
        let cores = num_cpus::get().max(1);
        let target = if cores >= 32 { cores * 4 } else { cores * 2 };
        // Span records address their shard with a u8.
        let shard_count = target.next_power_of_two().min(256);

        let bytes = mem::size_of::<PageHeapShard>() * shard_count;
        let pages = (bytes + (1 << PAGE_SHIFT) - 1) >> PAGE_SHIFT;
        let raw = platform::alloc_pages(pages);
        assert!(!raw.is_null(), "out of memory: page heap shard array");
        let shards = raw as *mut PageHeapShard;

        let threshold = shard_threshold_pages(shard_count);
        for i in 0..shard_count {
            // SAFETY: `raw` covers `shard_count` aligned shard slots; each is
            // written exactly once before the heap is shared.
            unsafe { ptr::write(shards.add(i), PageHeapShard::new(i as u8, threshold)) };
        }

        log::info!(
            "page heap: {} shards for {} cores, per-shard reclaim threshold {} pages",
            shard_count,
            cores,
            threshold
        );

        Self {
            shards,
            shard_count,
            shard_mask: shard_count - 1,
            pagemap,
        }
    }

    /// The calling thread's home shard, hashed once per thread.
    fn shard_index(&self) -> usize {
        use std::hash::{Hash, Hasher};
        thread_local! {
            static TID_HASH: u64 = {
                let mut h = std::collections::hash_map::DefaultHasher::new();
                std::thread::current().id().hash(&mut h);
                h.finish()
            };
        }
        let hash = TID_HASH.try_with(|h| *h).unwrap_or(0);
        hash as usize & self.shard_mask
    }

    fn shard(&self, index: usize) -> &PageHeapShard {
        debug_assert!(index < self.shard_count);
        // SAFETY: index is masked/asserted into the constructed array.
        unsafe { &*self.shards.add(index) }
    }

    /// Allocate a `k`-page span from the calling thread's shard.
    pub fn new_span(&self, k: usize) -> *mut Span {
        self.shard(self.shard_index()).new_span(k, self.pagemap)
    }

    /// Return a span to the shard that owns it.
    ///
    /// # Safety
    /// `span` must be a live span issued by this heap with nothing
    /// outstanding in it.
    pub unsafe fn release_span(&self, span: *mut Span) {
        if span.is_null() {
            return;
        }
        let index = unsafe { (*span).shard_id } as usize;
        unsafe { self.shard(index).release_span(span, self.pagemap) };
    }
}

/// Per-shard reclaim watermark: the environment override if present,
/// otherwise a quarter of physical RAM capped at 4 GiB, spread over the
/// shards, floored at 32 MiB so small machines still batch their releases.
fn shard_threshold_pages(shard_count: usize) -> usize {
    if let Ok(value) = std::env::var(THRESHOLD_ENV) {
        if let Ok(pages) = value.trim().parse::<usize>() {
            if pages > 0 {
                log::info!("{}={} overrides the reclaim threshold", THRESHOLD_ENV, pages);
                return pages;
            }
        }
        log::warn!("{}: ignoring unparsable value {:?}", THRESHOLD_ENV, value);
    }

    let cache_bytes = (platform::physical_memory_bytes() as u64 / 4).min(MAX_CACHE_BYTES);
    let total_pages = (cache_bytes >> PAGE_SHIFT) as usize;
    (total_pages / shard_count).max(MIN_SHARD_THRESHOLD_PAGES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;

    const BIG_THRESHOLD: usize = usize::MAX / 2;

    fn test_env(threshold: usize) -> (&'static PageMap, &'static PageHeapShard) {
        // Shards never drop in production; leaking keeps the test topology
        // identical.
        let pm = Box::leak(Box::new(PageMap::new()));
        let shard = Box::leak(Box::new(PageHeapShard::new(0, threshold)));
        (pm, shard)
    }

    #[test]
    fn test_small_span_from_fallback_batch() {
        let (pm, shard) = test_env(BIG_THRESHOLD);
        let span = shard.new_span(4, pm);
        assert!(!span.is_null());
        unsafe {
            assert_eq!((*span).n, 4);
            assert!((*span).is_in_use);
            assert!(!(*span).is_cold);
            // Edges of the issued range resolve through the map.
            assert_eq!(pm.get((*span).page_id), span);
            assert_eq!(pm.get((*span).page_id + 3), span);
        }
        // One 128-page OS batch minus the 4 issued.
        assert_eq!(shard.free_hot_pages(), NPAGES - 1 - 4);
        unsafe { shard.release_span(span, pm) };
        assert_eq!(shard.free_hot_pages(), NPAGES - 1);
    }

    #[test]
    fn test_release_merges_back_to_batch() {
        let (pm, shard) = test_env(BIG_THRESHOLD);
        let a = shard.new_span(8, pm);
        let b = shard.new_span(8, pm);
        unsafe {
            // Both came from one batch, so they are adjacent.
            assert_eq!((*a).page_id + 8, (*b).page_id);
            shard.release_span(a, pm);
            shard.release_span(b, pm);
        }
        let free = shard.snapshot_free();
        assert_eq!(free.len(), 1, "everything should coalesce: {:?}", free);
        assert_eq!(free[0].1, NPAGES - 1);
    }

    #[test]
    fn test_exact_hot_reuse() {
        let (pm, shard) = test_env(BIG_THRESHOLD);
        let a = shard.new_span(5, pm);
        let id = unsafe { (*a).page_id };
        unsafe { shard.release_span(a, pm) };
        // The freed 5-page run merged back; a fresh request splits from the
        // same base again.
        let b = shard.new_span(5, pm);
        assert_eq!(unsafe { (*b).page_id }, id);
        unsafe { shard.release_span(b, pm) };
    }

    #[test]
    fn test_large_span_direct_map() {
        let (pm, shard) = test_env(BIG_THRESHOLD);
        let span = shard.new_span(200, pm);
        assert!(!span.is_null());
        unsafe {
            assert_eq!((*span).n, 200);
            assert_eq!(pm.get((*span).page_id), span);
            assert_eq!(pm.get((*span).page_id + 199), span);
        }
        // Direct large maps do not prefill the free lists.
        assert_eq!(shard.free_hot_pages(), 0);
        unsafe { shard.release_span(span, pm) };
        assert_eq!(shard.free_hot_pages(), 200);
    }

    #[test]
    fn test_small_request_splits_free_large_span() {
        let (pm, shard) = test_env(BIG_THRESHOLD);
        let big = shard.new_span(300, pm);
        let base = unsafe { (*big).page_id };
        unsafe { shard.release_span(big, pm) };

        // The banked 300-page span serves a small request instead of a new
        // OS mapping.
        let small = shard.new_span(10, pm);
        assert_eq!(unsafe { (*small).page_id }, base);
        assert_eq!(shard.free_hot_pages(), 290);
        unsafe { shard.release_span(small, pm) };
        assert_eq!(shard.free_hot_pages(), 300);
    }

    #[test]
    fn test_ghost_entry_is_erased() {
        let (pm, shard) = test_env(BIG_THRESHOLD);
        let big = shard.new_span(200, pm);
        unsafe { shard.release_span(big, pm) };
        assert_eq!(shard.hot_large_keys(), vec![200]);

        // Splitting the 200 leaves an empty list behind at key 200 and a
        // remainder at 150.
        let small = shard.new_span(50, pm);
        assert_eq!(shard.hot_large_keys(), vec![150, 200]);

        // A request above 150 lands on the empty key 200, erases it, and
        // falls through to the OS.
        let other = shard.new_span(160, pm);
        assert!(!other.is_null());
        assert_eq!(unsafe { (*other).n }, 160);
        assert_eq!(shard.hot_large_keys(), vec![150]);

        unsafe {
            shard.release_span(small, pm);
            shard.release_span(other, pm);
        }
    }

    #[test]
    fn test_three_way_merge_and_reclaim() {
        // Watermark between 128 and 192: partial merges stay hot, the full
        // run triggers a reclaim sweep.
        let (pm, shard) = test_env(150);
        let parent = shard.new_span(192, pm);
        unsafe { shard.release_span(parent, pm) };
        // 192 hot > 150: the release already cooled it. Pull it back out.
        assert_eq!(shard.free_hot_pages(), 0);
        let a = shard.new_span(64, pm);
        let b = shard.new_span(64, pm);
        let c = shard.new_span(64, pm);
        unsafe {
            assert_eq!((*a).page_id + 64, (*b).page_id);
            assert_eq!((*b).page_id + 64, (*c).page_id);

            shard.release_span(b, pm);
            assert_eq!(shard.free_hot_pages(), 64);

            shard.release_span(a, pm);
            // a merged with b.
            assert_eq!(shard.free_hot_pages(), 128);
            let free = shard.snapshot_free();
            assert!(free.iter().any(|&(_, n, cold)| n == 128 && !cold));

            // c completes the run: 192 > 150 pages, so the merged span is
            // decommitted and parked cold.
            shard.release_span(c, pm);
        }
        assert_eq!(shard.free_hot_pages(), 0);
        let free = shard.snapshot_free();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].1, 192);
        assert!(free[0].2, "merged span should be cold after reclaim");
    }

    #[test]
    fn test_cold_span_is_reused_hot() {
        let (pm, shard) = test_env(100);
        let big = shard.new_span(192, pm);
        let base = unsafe { (*big).page_id };
        unsafe { shard.release_span(big, pm) };
        // Cooled by the release sweep.
        assert_eq!(shard.free_hot_pages(), 0);

        let again = shard.new_span(192, pm);
        assert_eq!(unsafe { (*again).page_id }, base);
        assert!(unsafe { !(*again).is_cold });
        unsafe {
            // Memory must be writable after the decommit round trip.
            let p = (*again).start_addr();
            *p = 0x5A;
            *p.add(192 * PAGE_SIZE - 1) = 0xA5;
            shard.release_span(again, pm);
        }
    }

    #[test]
    fn test_reclaim_prefers_large_then_high_counts() {
        let (pm, shard) = test_env(BIG_THRESHOLD);
        // One large free span plus small free spans fenced by live guard
        // spans so they cannot merge with each other.
        let l = shard.new_span(200, pm);
        let _g0 = shard.new_span(1, pm);
        let s1 = shard.new_span(40, pm);
        let _g1 = shard.new_span(1, pm);
        let s2 = shard.new_span(2, pm);
        let _g2 = shard.new_span(1, pm);
        unsafe {
            shard.release_span(l, pm);
            shard.release_span(s1, pm);
            shard.release_span(s2, pm);
        }
        // 200 large + 40 + 2 + the leftover of the 128-page batch.
        let batch_rest = NPAGES - 1 - 45;
        assert_eq!(shard.free_hot_pages(), 200 + 40 + 2 + batch_rest);

        // Sweep with a watermark that the large span alone cannot satisfy.
        {
            let mut st = shard.state.lock();
            st.release_threshold_pages = 60;
            unsafe { st.reclaim() };
        }
        let free = shard.snapshot_free();
        // Large went cold first, then the highest small count (the batch
        // remainder), and the sweep stopped before the small hot runs.
        assert!(free.iter().any(|&(_, n, cold)| n == 200 && cold));
        assert!(free
            .iter()
            .any(|&(_, n, cold)| n == batch_rest && cold));
        assert!(free.iter().any(|&(_, n, cold)| n == 40 && !cold));
        assert!(free.iter().any(|&(_, n, cold)| n == 2 && !cold));
        assert_eq!(shard.free_hot_pages(), 42);
    }

    #[test]
    fn test_randomized_churn_leaves_no_adjacent_free_spans() {
        // Large spans only: they enter the free structures exclusively
        // through release_span, so every adjacency must have been merged.
        // (Small requests bank fresh OS batches directly, which is allowed
        // to sit next to an older free span until a release touches it.)
        let (pm, shard) = test_env(BIG_THRESHOLD);
        // Deterministic xorshift so failures reproduce.
        let mut state = 0x9E3779B97F4A7C15u64;
        let mut rand = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let mut live: Vec<*mut Span> = Vec::new();
        for _ in 0..300 {
            if live.is_empty() || rand() % 3 != 0 {
                let k = NPAGES + (rand() % 200) as usize;
                let span = shard.new_span(k, pm);
                assert!(!span.is_null());
                live.push(span);
            } else {
                let idx = (rand() as usize) % live.len();
                let span = live.swap_remove(idx);
                unsafe { shard.release_span(span, pm) };
            }
        }
        for span in live {
            unsafe { shard.release_span(span, pm) };
        }

        let mut free = shard.snapshot_free();
        free.sort_by_key(|&(id, _, _)| id);
        for pair in free.windows(2) {
            let (id_a, n_a, _) = pair[0];
            let (id_b, _, _) = pair[1];
            assert!(
                id_a + n_a as u64 != id_b,
                "adjacent free spans left unmerged: {:?}",
                pair
            );
        }
    }

    #[test]
    fn test_threshold_floor() {
        assert!(shard_threshold_pages(1) >= MIN_SHARD_THRESHOLD_PAGES);
        assert!(shard_threshold_pages(1 << 14) >= MIN_SHARD_THRESHOLD_PAGES);
    }

    #[test]
    fn test_heap_routes_release_to_owner_shard() {
        static PM: PageMap = PageMap::new();
        let heap = Box::leak(Box::new(PageHeap::new(&PM)));
        let span = heap.new_span(3);
        assert!(!span.is_null());
        let shard_id = unsafe { (*span).shard_id } as usize;
        assert!(shard_id < heap.shard_count);
        unsafe { heap.release_span(span) };
        // The owning shard got its pages back.
        assert_eq!(heap.shard(shard_id).free_hot_pages(), NPAGES - 1);
    }
}
