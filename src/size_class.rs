//! Size class table and lookup functions.
//!
//! Every power-of-two interval `(2^k, 2^(k+1)]` is split into
//! `2^SIZE_CLASS_SUBPOWER` evenly spaced classes, so the rounding waste of a
//! request stays below `size >> SIZE_CLASS_SUBPOWER` (plus pointer rounding).
//! Classes are computed, not tabulated; only the smallest sizes go through a
//! lookup table built from the same formula at compile time.

use crate::config::{MAX_BATCH_BYTES, MAX_BLOCKS_IN_BATCH, PTR_SIZE, SIZE_CLASS_SUBPOWER};

const G: u32 = SIZE_CLASS_SUBPOWER;

/// Number of class indices. Not every index is reachable; the table is sized
/// for any request up to `usize::MAX`.
pub const NUM_SIZE_CLASSES: usize = (usize::BITS as usize + 1) << G;

/// Sizes up to this bound are classified through `SMALL_CLASSES`.
const SMALL_LOOKUP_LEN: usize = 256;
const SMALL_LOOKUP_MAX: usize = (SMALL_LOOKUP_LEN - 1) * PTR_SIZE;

#[inline]
const fn bit_scan_reverse(v: usize) -> u32 {
    usize::BITS - 1 - v.leading_zeros()
}

/// Class index for `size`, computed from the bit pattern of the size.
///
/// Zero is treated as one pointer. `size` must be well below `usize::MAX`.
pub const fn compute_class(size: usize) -> usize {
    let mut size = (size + (PTR_SIZE - 1)) & !(PTR_SIZE - 1);
    if size == 0 {
        size = PTR_SIZE;
    }
    let index = bit_scan_reverse((size - 1) | 1);
    if index < G {
        (index as usize) << G
    } else {
        ((index as usize) << G) + ((size - 1) >> (index - G))
    }
}

/// Block size of `class`: the largest request that maps to it.
pub const fn class_to_size(class: usize) -> usize {
    let small_classes = (G as usize) << G;
    if class < small_classes {
        return 2 << (class >> G);
    }
    let c = class - ((1 << G) - 1);
    let shift = c >> G;
    if shift < G as usize {
        // Index never produced by `compute_class`.
        return 2 << (class >> G);
    }
    ((c & ((1 << G) - 1)) | (1 << G)) << (shift - G as usize)
}

static SMALL_CLASSES: [u16; SMALL_LOOKUP_LEN] = {
    let mut table = [0u16; SMALL_LOOKUP_LEN];
    let mut i = 0;
    while i < SMALL_LOOKUP_LEN {
        table[i] = compute_class(i * PTR_SIZE) as u16;
        i += 1;
    }
    table
};

/// Map a request size to its class. Callers only pass sizes up to
/// `MAX_BLOCK_SIZE`; larger requests never reach the class table.
#[inline]
pub fn size_to_class(size: usize) -> usize {
    if size <= SMALL_LOOKUP_MAX {
        SMALL_CLASSES[size.div_ceil(PTR_SIZE)] as usize
    } else {
        compute_class(size)
    }
}

/// Number of blocks moved between a thread cache and the central cache in one
/// batch. Bounded by both `MAX_BLOCKS_IN_BATCH` and roughly `MAX_BATCH_BYTES`.
#[inline]
pub const fn batch_blocks(class: usize) -> usize {
    let bytes = match (MAX_BATCH_BYTES - 1).checked_shr((class >> G) as u32) {
        Some(b) => b,
        None => 0,
    };
    (bytes & (MAX_BLOCKS_IN_BATCH - 1)) + 1
}

/// First class whose blocks can hold a `FreeBlock` with its batch link.
/// Classes below it hold exactly one pointer and keep their batches in the
/// chunk header instead.
pub const SMALLEST_BATCHED_CLASS: usize = compute_class(2 * PTR_SIZE);

#[inline]
pub const fn is_pointer_class(class: usize) -> bool {
    class < SMALLEST_BATCHED_CLASS
}
