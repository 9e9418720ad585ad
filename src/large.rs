//! Large allocations: requests above `MAX_BLOCK_SIZE`.
//!
//! These are mapped straight from the OS, rounded up to whole chunks and
//! aligned to at least `CHUNK_SIZE`, so a chunk-aligned pointer handed to
//! `free` is always one of them. Where the OS cannot report the size of a
//! mapping, the size is kept in the Patricia trie keyed by address.

use crate::config::CHUNK_SIZE;
use crate::error::AllocError;
use crate::platform;
use crate::ptrie::PatriciaTrie;
use crate::{debug_log, stat_inc};
use core::ptr::NonNull;

pub(crate) static LARGE_SIZES: PatriciaTrie = PatriciaTrie::new();

/// Map `size` bytes (rounded up to a chunk multiple) aligned to `align`.
/// Returns the mapping and its rounded size.
pub fn alloc(size: usize, align: usize) -> Result<(NonNull<u8>, usize), AllocError> {
    let size = size
        .checked_add(CHUNK_SIZE - 1)
        .ok_or(AllocError::OutOfMemory)?
        & !(CHUNK_SIZE - 1);
    let align = align.max(CHUNK_SIZE);
    let ptr = unsafe { platform::alloc_aligned(align, size) };
    let Some(ptr) = NonNull::new(ptr) else {
        debug_log!("large mapping of {} bytes failed", size);
        return Err(AllocError::OutOfMemory);
    };
    if !platform::HAS_REGION_SIZE {
        if let Err(e) = LARGE_SIZES.insert(ptr.as_ptr() as usize, size) {
            unsafe { platform::page_dealloc(ptr.as_ptr(), size) };
            return Err(e);
        }
    }
    stat_inc!(large_allocs);
    Ok((ptr, size))
}

/// Mapped size of the large allocation at `ptr`.
///
/// # Safety
/// `ptr` must be chunk-aligned and non-null.
pub unsafe fn size_of(ptr: *mut u8) -> Option<usize> {
    cfg_if::cfg_if! {
        if #[cfg(all(windows, not(miri)))] {
            match unsafe { platform::region_size(ptr) } {
                0 => None,
                n => Some(n),
            }
        } else {
            LARGE_SIZES.lookup(ptr as usize)
        }
    }
}

/// Forget the large allocation at `ptr` and return its size. The memory is
/// still mapped; release it with `unmap`.
///
/// # Safety
/// `ptr` must be chunk-aligned and non-null.
pub unsafe fn take(ptr: *mut u8) -> Option<usize> {
    cfg_if::cfg_if! {
        if #[cfg(all(windows, not(miri)))] {
            unsafe { size_of(ptr) }
        } else {
            LARGE_SIZES.remove(ptr as usize)
        }
    }
}

/// # Safety
/// `ptr`/`size` must come from `take`, and nothing may use the memory after.
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    stat_inc!(large_frees);
    unsafe { platform::page_dealloc(ptr, size) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_BLOCK_SIZE;

    #[test]
    fn test_rounds_to_chunks() {
        let (ptr, size) = alloc(MAX_BLOCK_SIZE + 1, 1).unwrap();
        assert_eq!(ptr.as_ptr() as usize % CHUNK_SIZE, 0);
        assert_eq!(size % CHUNK_SIZE, 0);
        assert!(size > MAX_BLOCK_SIZE);
        unsafe {
            assert_eq!(size_of(ptr.as_ptr()), Some(size));
            *ptr.as_ptr().add(size - 1) = 7;
            assert_eq!(take(ptr.as_ptr()), Some(size));
            unmap(ptr.as_ptr(), size);
        }
    }

    #[test]
    fn test_large_alignment() {
        let align = 8 * CHUNK_SIZE;
        let (ptr, size) = alloc(3 * CHUNK_SIZE, align).unwrap();
        assert_eq!(ptr.as_ptr() as usize % align, 0);
        assert_eq!(size, 3 * CHUNK_SIZE);
        unsafe {
            let size = take(ptr.as_ptr()).unwrap();
            unmap(ptr.as_ptr(), size);
        }
    }

    #[test]
    fn test_overflowing_size_fails() {
        assert_eq!(alloc(usize::MAX - 10, 1), Err(AllocError::OutOfMemory));
    }
}
