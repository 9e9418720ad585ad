//! Miri-compatible platform shim using std::alloc as backing store.
//!
//! Miri can't execute mmap/VirtualAlloc, so memory comes from the system
//! allocator. Every mapping is cut out of a larger chunk-aligned allocation;
//! the chunk in front of it records the real base and layout size, so
//! `page_dealloc` frees with exactly the layout that was allocated whatever
//! alignment was requested.

extern crate alloc;

use crate::config::CHUNK_SIZE;
use core::alloc::Layout;

pub fn granularity() -> usize {
    4096
}

/// Allocate `size` bytes aligned to `max(align, CHUNK_SIZE)`. The two words
/// below the returned pointer hold the base pointer and the layout size.
unsafe fn alloc_with_prefix(align: usize, size: usize) -> *mut u8 {
    let align = align.max(CHUNK_SIZE);
    let Some(total) = size.checked_add(align) else {
        return core::ptr::null_mut();
    };
    let Ok(layout) = Layout::from_size_align(total, CHUNK_SIZE) else {
        return core::ptr::null_mut();
    };
    let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
    if base.is_null() {
        return base;
    }
    // Strictly above `base`, so at least one chunk of prefix.
    let offset = ((base as usize + 1 + align - 1) & !(align - 1)) - base as usize;
    unsafe {
        let ptr = base.add(offset);
        *(ptr as *mut *mut u8).sub(2) = base;
        *(ptr as *mut usize).sub(1) = total;
        ptr
    }
}

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    unsafe { alloc_with_prefix(CHUNK_SIZE, size) }
}

pub unsafe fn page_dealloc(ptr: *mut u8, _size: usize) {
    unsafe {
        let base = *(ptr as *const *mut u8).sub(2);
        let total = *(ptr as *const usize).sub(1);
        let layout = Layout::from_size_align_unchecked(total, CHUNK_SIZE);
        alloc::alloc::dealloc(base, layout);
    }
}

pub unsafe fn alloc_aligned_slow(align: usize, size: usize) -> *mut u8 {
    unsafe { alloc_with_prefix(align, size) }
}
