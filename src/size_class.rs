//! Size class tables: byte size → class index → aligned allocation size.
//!
//! Sizes up to 256 KiB are bucketed into 264 classes across five alignment
//! tiers; anything larger bypasses the cache tiers entirely. Both tables are
//! filled by a single forward pass on first use, so the hot paths are plain
//! array lookups.

use crate::PAGE_SIZE;
use core::cell::UnsafeCell;
use std::sync::Once;

/// Largest allocation served through the size-class tiers.
pub const MAX_BYTES: usize = 256 * 1024;

/// Number of size classes (16 + 56 + 56 + 112 + 24 across the five tiers).
pub const MAX_CLASSES: usize = 264;

const LOOKUP_LEN: usize = MAX_BYTES + 1;

struct Tables {
    /// Raw byte count → class index, for every size in `1..=MAX_BYTES`.
    size_to_class: [u16; LOOKUP_LEN],
    /// Class index → aligned allocation size.
    class_to_size: [usize; MAX_CLASSES],
}

struct TableCell(UnsafeCell<Tables>);

// SAFETY: the cell is written exactly once under `INIT`; every reader passes
// through `ensure_init`, whose acquire load orders it after that write.
unsafe impl Sync for TableCell {}

static INIT: Once = Once::new();
static TABLES: TableCell = TableCell(UnsafeCell::new(Tables {
    size_to_class: [0; LOOKUP_LEN],
    class_to_size: [0; MAX_CLASSES],
}));

/// Alignment step for the tier that `current` falls in. Only called while
/// building the tables; the hot path never computes alignments.
fn next_block_size(current: usize) -> usize {
    if current < 128 {
        current + 8
    } else if current < 1024 {
        current + 16
    } else if current < 8 * 1024 {
        current + 128
    } else if current < 64 * 1024 {
        current + 512
    } else {
        current + 8 * 1024
    }
}

fn build(t: &mut Tables) {
    let mut class = 0usize;
    let mut block_size = 8usize;
    t.class_to_size[0] = block_size;

    for size in 1..=MAX_BYTES {
        if size > block_size {
            class += 1;
            block_size = next_block_size(block_size);
            if class < MAX_CLASSES {
                t.class_to_size[class] = block_size;
            }
        }
        t.size_to_class[size] = class as u16;
    }
    t.size_to_class[0] = 0;
}

/// Build the tables if this is the first caller. Cheap once initialized
/// (one acquire load), so constructors call it freely.
#[inline]
pub fn ensure_init() {
    if !INIT.is_completed() {
        // SAFETY: `call_once` serializes the single mutation; no reader can
        // observe the cell before `is_completed` turns true.
        INIT.call_once(|| unsafe { build(&mut *TABLES.0.get()) });
    }
}

#[inline]
fn tables() -> &'static Tables {
    ensure_init();
    // SAFETY: initialization completed above and the tables are immutable
    // from then on.
    unsafe { &*TABLES.0.get() }
}

/// Map an allocation size to its class index. `size` must be `<= MAX_BYTES`.
#[inline]
pub fn index(size: usize) -> usize {
    debug_assert!(size <= MAX_BYTES);
    tables().size_to_class[size] as usize
}

/// Aligned allocation size for a class index.
#[inline]
pub fn class_size(index: usize) -> usize {
    debug_assert!(index < MAX_CLASSES);
    tables().class_to_size[index]
}

/// Round a request up to the size actually allocated for it: the class size
/// below `MAX_BYTES`, whole pages above it.
#[inline]
pub fn round_up(size: usize) -> usize {
    if size > MAX_BYTES {
        return round_up_to_page(size);
    }
    class_size(index(size))
}

/// Round a byte count up to a whole number of allocator pages.
#[inline]
pub fn round_up_to_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Slow-start ceiling for a class: how many objects a thread cache may
/// request from the central cache in one batch once fully warmed up.
#[inline]
pub fn num_move_size(index: usize) -> usize {
    let num = MAX_BYTES / class_size(index);
    num.clamp(2, 32768)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_count_is_exact() {
        // The last byte of the range must land in the last class.
        assert_eq!(index(MAX_BYTES), MAX_CLASSES - 1);
        assert_eq!(class_size(MAX_CLASSES - 1), MAX_BYTES);
    }

    #[test]
    fn test_round_up_examples() {
        assert_eq!(round_up(1), 8);
        assert_eq!(round_up(8), 8);
        assert_eq!(round_up(9), 16);
        assert_eq!(round_up(13), 16);
        assert_eq!(round_up(128), 128);
        assert_eq!(round_up(129), 144);
        assert_eq!(round_up(1024), 1024);
        assert_eq!(round_up(1025), 1152);
        assert_eq!(round_up(8 * 1024 + 1), 8 * 1024 + 512);
        assert_eq!(round_up(64 * 1024 + 1), 64 * 1024 + 8 * 1024);
        assert_eq!(round_up(MAX_BYTES), MAX_BYTES);
    }

    #[test]
    fn test_round_up_is_idempotent() {
        for size in 1..=MAX_BYTES {
            let r = round_up(size);
            assert_eq!(round_up(r), r, "round_up not idempotent at {}", size);
        }
    }

    #[test]
    fn test_class_size_round_trip() {
        for cls in 0..MAX_CLASSES {
            let size = class_size(cls);
            assert!(size >= 8);
            assert_eq!(index(size), cls, "round-trip failed for class {}", cls);
        }
    }

    #[test]
    fn test_tier_alignment() {
        for size in 1..=MAX_BYTES {
            let aligned = round_up(size);
            let expect = match aligned {
                0..=128 => 8,
                129..=1024 => 16,
                1025..=8192 => 128,
                8193..=65536 => 512,
                _ => 8192,
            };
            assert_eq!(aligned % expect, 0, "size {} -> {}", size, aligned);
            assert!(aligned >= size);
        }
    }

    #[test]
    fn test_index_monotonic() {
        let mut prev = index(1);
        for size in 2..=MAX_BYTES {
            let cls = index(size);
            assert!(cls >= prev);
            assert!(cls - prev <= 1);
            prev = cls;
        }
    }

    #[test]
    fn test_large_round_up_is_page_granular() {
        assert_eq!(round_up(MAX_BYTES + 1), MAX_BYTES + PAGE_SIZE);
        assert_eq!(round_up(1 << 20), 1 << 20);
        assert_eq!(round_up((1 << 20) + 1), (1 << 20) + PAGE_SIZE);
    }

    #[test]
    fn test_num_move_size_clamps() {
        // Smallest class moves the most, capped at 32768.
        assert_eq!(num_move_size(index(8)), MAX_BYTES / 8);
        // Largest class still moves at least 2.
        assert_eq!(num_move_size(MAX_CLASSES - 1), 2);
        for cls in 0..MAX_CLASSES {
            let n = num_move_size(cls);
            assert!((2..=32768).contains(&n));
        }
    }
}
