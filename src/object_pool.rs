//! Slab pool for fixed-size metadata records (spans, list sentinels, thread
//! caches).
//!
//! Metadata allocation must never re-enter the allocator, so blocks come
//! straight from the OS: 128 KiB at a time, carved by bump pointer, with
//! freed records recycled through a LIFO list threaded through their first
//! word.

use crate::platform;
use crate::sync::SpinMutex;
use crate::PAGE_SHIFT;
use core::marker::PhantomData;
use core::mem;
use core::ptr;

/// Bytes fetched from the OS per refill.
const BLOCK_BYTES: usize = 128 * 1024;
const BLOCK_PAGES: usize = BLOCK_BYTES >> PAGE_SHIFT;

struct PoolState {
    /// Bump cursor into the current block.
    cursor: *mut u8,
    /// Bytes left in the current block.
    bytes_left: usize,
    /// Recycled records, linked through their first word.
    free_list: *mut u8,
    /// Chain of blocks for release on teardown; first word of each block
    /// holds the next block's address.
    block_list: *mut u8,
}

// SAFETY: the raw pointers are only dereferenced under the pool's lock.
unsafe impl Send for PoolState {}

pub struct ObjectPool<T> {
    state: SpinMutex<PoolState>,
    _marker: PhantomData<T>,
}

// SAFETY: the pool hands out raw storage for `T`; every shared field sits
// behind the pool's lock, and the contents of issued records are the
// caller's responsibility.
unsafe impl<T> Send for ObjectPool<T> {}
unsafe impl<T> Sync for ObjectPool<T> {}

impl<T> ObjectPool<T> {
    pub const fn new() -> Self {
        Self {
            state: SpinMutex::new(PoolState {
                cursor: ptr::null_mut(),
                bytes_left: 0,
                free_list: ptr::null_mut(),
                block_list: ptr::null_mut(),
            }),
            _marker: PhantomData,
        }
    }

    /// Reserve storage for one record without constructing it.
    /// Null when the OS refuses a refill block.
    pub fn alloc_record(&self) -> *mut T {
        // Records double as free-list nodes, so they must hold a pointer and
        // start pointer-aligned within the block.
        debug_assert!(mem::size_of::<T>() >= mem::size_of::<*mut u8>());
        debug_assert!(mem::align_of::<T>() <= mem::size_of::<*mut u8>());
        let rec_size = mem::size_of::<T>();

        let mut st = self.state.lock();

        if !st.free_list.is_null() {
            let obj = st.free_list;
            // SAFETY: every free-list node was a live record; its first word
            // stores the next node.
            st.free_list = unsafe { *(obj as *mut *mut u8) };
            return obj as *mut T;
        }

        if st.bytes_left < rec_size {
            // The block's tail may be wasted; a partial record is useless.
            let block = platform::alloc_pages(BLOCK_PAGES);
            if block.is_null() {
                return ptr::null_mut();
            }
            // SAFETY: the block is fresh and at least a word long.
            unsafe { *(block as *mut *mut u8) = st.block_list };
            st.block_list = block;
            st.cursor = unsafe { block.add(mem::size_of::<*mut u8>()) };
            st.bytes_left = BLOCK_BYTES - mem::size_of::<*mut u8>();
        }

        let obj = st.cursor;
        st.cursor = unsafe { st.cursor.add(rec_size) };
        st.bytes_left -= rec_size;
        obj as *mut T
    }

    /// Recycle a record's storage. The value must already be dead.
    ///
    /// # Safety
    /// `obj` must have come from this pool's `alloc_record` and must not be
    /// referenced again until re-issued.
    pub unsafe fn free_record(&self, obj: *mut T) {
        let mut st = self.state.lock();
        // SAFETY: caller guarantees exclusive ownership of the record.
        unsafe { *(obj as *mut *mut u8) = st.free_list };
        st.free_list = obj as *mut u8;
    }

    /// Allocate and construct a record. Null on out-of-memory.
    pub fn create(&self, value: T) -> *mut T {
        let obj = self.alloc_record();
        if !obj.is_null() {
            // SAFETY: freshly reserved, properly aligned storage.
            unsafe { ptr::write(obj, value) };
        }
        obj
    }

    /// Drop a record in place and recycle its storage.
    ///
    /// # Safety
    /// `obj` must be a live record from this pool with no other references.
    pub unsafe fn destroy(&self, obj: *mut T) {
        if obj.is_null() {
            return;
        }
        unsafe {
            ptr::drop_in_place(obj);
            self.free_record(obj);
        }
    }
}

impl<T> Drop for ObjectPool<T> {
    fn drop(&mut self) {
        let st = self.state.lock();
        let mut block = st.block_list;
        while !block.is_null() {
            // SAFETY: block chain links were written at refill time.
            let next = unsafe { *(block as *mut *mut u8) };
            unsafe { platform::free_pages(block, BLOCK_PAGES) };
            block = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Rec {
        a: u64,
        b: u64,
    }

    #[test]
    fn test_create_and_read_back() {
        let pool: ObjectPool<Rec> = ObjectPool::new();
        let p = pool.create(Rec { a: 1, b: 2 });
        assert!(!p.is_null());
        unsafe {
            assert_eq!(*p, Rec { a: 1, b: 2 });
            pool.destroy(p);
        }
    }

    #[test]
    fn test_records_are_distinct() {
        let pool: ObjectPool<Rec> = ObjectPool::new();
        let ptrs: Vec<*mut Rec> = (0..1000)
            .map(|i| pool.create(Rec { a: i, b: i * 2 }))
            .collect();
        for (i, &p) in ptrs.iter().enumerate() {
            unsafe { assert_eq!((*p).a, i as u64) };
        }
        for &p in &ptrs {
            unsafe { pool.destroy(p) };
        }
    }

    #[test]
    fn test_recycle_is_lifo() {
        let pool: ObjectPool<Rec> = ObjectPool::new();
        let a = pool.create(Rec { a: 1, b: 1 });
        let b = pool.create(Rec { a: 2, b: 2 });
        unsafe {
            pool.destroy(a);
            pool.destroy(b);
        }
        // Most recently freed comes back first.
        assert_eq!(pool.create(Rec { a: 3, b: 3 }), b);
        assert_eq!(pool.create(Rec { a: 4, b: 4 }), a);
    }

    #[test]
    fn test_block_refill() {
        // Force the pool past one 128 KiB block.
        let pool: ObjectPool<[u64; 16]> = ObjectPool::new();
        let count = BLOCK_BYTES / mem::size_of::<[u64; 16]>() + 10;
        let ptrs: Vec<_> = (0..count).map(|_| pool.create([7u64; 16])).collect();
        assert!(ptrs.iter().all(|p| !p.is_null()));
        for &p in &ptrs {
            unsafe { pool.destroy(p) };
        }
    }
}
