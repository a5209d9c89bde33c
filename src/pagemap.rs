//! Radix tree mapping page ids back to their owning spans.
//!
//! Reads are lock-free: each level is a plain atomic load, and a missing
//! node means "no span". Writers ensure intermediate nodes exist under a
//! growth mutex and publish them with release stores, so a reader that sees
//! a node pointer also sees the node zero-initialized. Node storage comes
//! from the OS (already zeroed), never from the allocator itself.

use crate::platform;
use crate::span::Span;
use crate::{PAGE_SHIFT, PAGE_SIZE};
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use parking_lot::Mutex;

// 64-bit: 48-bit virtual addresses minus the 13-bit page offset leave a
// 35-bit page id, split root(12) / mid(12) / leaf(11).
#[cfg(target_pointer_width = "64")]
const BITS_ROOT: usize = 12;
#[cfg(target_pointer_width = "64")]
const BITS_MID: usize = 12;
#[cfg(target_pointer_width = "64")]
const BITS_LEAF: usize = 11;

// 32-bit: a 19-bit page id, split root(5) / leaf(14).
#[cfg(not(target_pointer_width = "64"))]
const BITS_ROOT: usize = 5;
#[cfg(not(target_pointer_width = "64"))]
const BITS_LEAF: usize = 14;

const LEN_ROOT: usize = 1 << BITS_ROOT;
#[cfg(target_pointer_width = "64")]
const LEN_MID: usize = 1 << BITS_MID;
const LEN_LEAF: usize = 1 << BITS_LEAF;

struct LeafNode {
    spans: [AtomicPtr<Span>; LEN_LEAF],
}

#[cfg(target_pointer_width = "64")]
struct MidNode {
    leaves: [AtomicPtr<LeafNode>; LEN_MID],
}

#[cfg(target_pointer_width = "64")]
type RootEntry = MidNode;
#[cfg(not(target_pointer_width = "64"))]
type RootEntry = LeafNode;

/// Allocate a zero-filled node straight from the OS. Null atomic pointers
/// have an all-zero representation, so the fresh pages need no setup.
fn alloc_node<T>() -> *mut T {
    let pages = (mem::size_of::<T>() + PAGE_SIZE - 1) >> PAGE_SHIFT;
    let node = platform::alloc_pages(pages);
    assert!(!node.is_null(), "out of memory: page map node");
    node as *mut T
}

pub struct PageMap {
    root: [AtomicPtr<RootEntry>; LEN_ROOT],
    grow_lock: Mutex<()>,
}

impl PageMap {
    pub const fn new() -> Self {
        Self {
            root: [const { AtomicPtr::new(ptr::null_mut()) }; LEN_ROOT],
            grow_lock: Mutex::new(()),
        }
    }

    /// Look up the span covering `page_id`. Null when nothing was recorded.
    #[cfg(target_pointer_width = "64")]
    #[inline]
    pub fn get(&self, page_id: u64) -> *mut Span {
        let i_root = (page_id >> (BITS_MID + BITS_LEAF)) as usize;
        if i_root >= LEN_ROOT {
            return ptr::null_mut();
        }
        let mid = self.root[i_root].load(Ordering::Relaxed);
        if mid.is_null() {
            return ptr::null_mut();
        }
        let i_mid = (page_id >> BITS_LEAF) as usize & (LEN_MID - 1);
        // SAFETY: a non-null node pointer was published with release
        // ordering after the node's pages were mapped zero-filled.
        let leaf = unsafe { (*mid).leaves[i_mid].load(Ordering::Relaxed) };
        if leaf.is_null() {
            return ptr::null_mut();
        }
        let i_leaf = page_id as usize & (LEN_LEAF - 1);
        unsafe { (*leaf).spans[i_leaf].load(Ordering::Relaxed) }
    }

    #[cfg(not(target_pointer_width = "64"))]
    #[inline]
    pub fn get(&self, page_id: u64) -> *mut Span {
        let i_root = (page_id >> BITS_LEAF) as usize;
        if i_root >= LEN_ROOT {
            return ptr::null_mut();
        }
        let leaf = self.root[i_root].load(Ordering::Relaxed);
        if leaf.is_null() {
            return ptr::null_mut();
        }
        let i_leaf = page_id as usize & (LEN_LEAF - 1);
        unsafe { (*leaf).spans[i_leaf].load(Ordering::Relaxed) }
    }

    /// Record `span` as the owner of `page_id`. Ids beyond the mapped
    /// address space are ignored.
    #[cfg(target_pointer_width = "64")]
    pub fn set(&self, page_id: u64, span: *mut Span) {
        let i_root = (page_id >> (BITS_MID + BITS_LEAF)) as usize;
        if i_root >= LEN_ROOT {
            return;
        }
        let mid = self.ensure_node(&self.root[i_root]);
        let i_mid = (page_id >> BITS_LEAF) as usize & (LEN_MID - 1);
        // SAFETY: `ensure_node` returned a live node.
        let leaf = unsafe { self.ensure_node(&(*mid).leaves[i_mid]) };
        let i_leaf = page_id as usize & (LEN_LEAF - 1);
        unsafe { (*leaf).spans[i_leaf].store(span, Ordering::Release) };
    }

    #[cfg(not(target_pointer_width = "64"))]
    pub fn set(&self, page_id: u64, span: *mut Span) {
        let i_root = (page_id >> BITS_LEAF) as usize;
        if i_root >= LEN_ROOT {
            return;
        }
        let leaf = self.ensure_node(&self.root[i_root]);
        let i_leaf = page_id as usize & (LEN_LEAF - 1);
        unsafe { (*leaf).spans[i_leaf].store(span, Ordering::Release) };
    }

    /// Double-checked node creation: most calls see the node already
    /// published and never touch the lock.
    fn ensure_node<T>(&self, slot: &AtomicPtr<T>) -> *mut T {
        let node = slot.load(Ordering::Acquire);
        if !node.is_null() {
            return node;
        }
        let _guard = self.grow_lock.lock();
        let node = slot.load(Ordering::Acquire);
        if !node.is_null() {
            return node;
        }
        let fresh = alloc_node::<T>();
        slot.store(fresh, Ordering::Release);
        fresh
    }
}
