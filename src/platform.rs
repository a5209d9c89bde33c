//! OS page interface: the allocator's only way in and out of virtual memory.
//!
//! All requests are in whole allocator pages (8 KiB). The kernel hands out
//! 4 KiB-aligned mappings, so `alloc_pages` over-allocates by one page and
//! trims the unaligned head and tail with `munmap` to guarantee alignment.

use crate::{PAGE_SHIFT, PAGE_SIZE};
use core::ptr;

/// Requests at or above this size first try a huge-page mapping (Linux huge
/// pages are typically 2 MiB).
pub const HUGE_PAGE_THRESHOLD: usize = 2 * 1024 * 1024;

const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Map `k` allocator pages of zeroed, `PAGE_SIZE`-aligned memory.
/// Returns null when the OS refuses the mapping.
pub fn alloc_pages(k: usize) -> *mut u8 {
    let size = k << PAGE_SHIFT;

    unsafe {
        #[cfg(target_os = "linux")]
        if size >= HUGE_PAGE_THRESHOLD {
            let ptr = libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB | libc::MAP_POPULATE,
                -1,
                0,
            );
            if ptr != libc::MAP_FAILED {
                return ptr as *mut u8;
            }
            // No huge pages configured; fall through to the normal path.
        }

        // Over-allocate one page so an aligned 8 KiB run always fits.
        let raw_size = size + PAGE_SIZE;
        let raw = libc::mmap(
            ptr::null_mut(),
            raw_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if raw == libc::MAP_FAILED {
            return ptr::null_mut();
        }

        let raw_addr = raw as usize;
        let aligned = (raw_addr + PAGE_MASK) & !PAGE_MASK;

        let prefix = aligned - raw_addr;
        if prefix > 0 {
            libc::munmap(raw_addr as *mut libc::c_void, prefix);
        }
        let suffix = raw_size - size - prefix;
        if suffix > 0 {
            libc::munmap((aligned + size) as *mut libc::c_void, suffix);
        }

        aligned as *mut u8
    }
}

/// Unmap `k` allocator pages starting at `ptr`.
///
/// # Safety
/// `ptr` must be the start of a live mapping of at least `k` pages obtained
/// from [`alloc_pages`], with no live references into the range.
pub unsafe fn free_pages(ptr: *mut u8, k: usize) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        libc::munmap(ptr as *mut libc::c_void, k << PAGE_SHIFT);
    }
}

/// Tell the OS the range's physical backing is reclaimable. The virtual
/// range stays mapped and refaults zero-filled, so the hint is idempotent.
///
/// # Safety
/// `[ptr, ptr + bytes)` must lie inside a live mapping and hold no data the
/// caller still needs.
pub unsafe fn decommit(ptr: *mut u8, bytes: usize) {
    unsafe {
        libc::madvise(ptr as *mut libc::c_void, bytes, libc::MADV_DONTNEED);
    }
}

/// Total physical RAM in bytes, queried once at heap construction.
pub fn physical_memory_bytes() -> usize {
    unsafe {
        let pages = libc::sysconf(libc::_SC_PHYS_PAGES);
        let page_size = libc::sysconf(libc::_SC_PAGE_SIZE);
        if pages > 0 && page_size > 0 {
            return (pages as u64).saturating_mul(page_size as u64).min(usize::MAX as u64)
                as usize;
        }
    }
    // Query failed; assume 8 GiB rather than disabling the cache watermark.
    (8u64 * 1024 * 1024 * 1024).min(usize::MAX as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_page_aligned() {
        for k in [1usize, 2, 5, 128] {
            let p = alloc_pages(k);
            assert!(!p.is_null());
            assert_eq!(p as usize & (PAGE_SIZE - 1), 0, "unaligned for k={}", k);
            unsafe { free_pages(p, k) };
        }
    }

    #[test]
    fn test_alloc_is_zeroed_and_writable() {
        let p = alloc_pages(2);
        assert!(!p.is_null());
        unsafe {
            for i in 0..(2 * PAGE_SIZE) {
                assert_eq!(*p.add(i), 0);
            }
            *p = 0xAB;
            *p.add(2 * PAGE_SIZE - 1) = 0xCD;
            assert_eq!(*p, 0xAB);
            free_pages(p, 2);
        }
    }

    #[test]
    fn test_decommit_keeps_range_valid() {
        let p = alloc_pages(4);
        assert!(!p.is_null());
        unsafe {
            *p.add(100) = 7;
            decommit(p, 4 * PAGE_SIZE);
            // Refaults zero-filled.
            assert_eq!(*p.add(100), 0);
            *p.add(100) = 9;
            assert_eq!(*p.add(100), 9);
            free_pages(p, 4);
        }
    }

    #[test]
    fn test_physical_memory_query() {
        assert!(physical_memory_bytes() >= 64 * 1024 * 1024);
    }
}
