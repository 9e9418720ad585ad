//! OS platform abstraction for virtual memory.
//!
//! Wraps the platform virtual memory APIs (mmap on Unix, VirtualAlloc on
//! Windows). Under Miri a `std::alloc` shim stands in for the OS.
//!
//! Chunks and large allocations need alignment far above the page size. The
//! OS is first asked for exactly `size` bytes; if the mapping happens to be
//! misaligned it is released and an aligned range is cut out of a larger one.

cfg_if::cfg_if! {
    if #[cfg(miri)] {
        mod miri;
        use miri as os;
    } else if #[cfg(windows)] {
        mod windows;
        use windows as os;
    } else if #[cfg(unix)] {
        mod unix;
        use unix as os;
    }
}

/// Whether the OS can report the size of a mapping from its address alone.
/// When false, large allocations record their size in the trie.
pub const HAS_REGION_SIZE: bool = cfg!(all(windows, not(miri)));

/// Allocate `size` bytes of zeroed, page-aligned virtual memory.
/// Returns null on failure.
///
/// # Safety
/// The memory must be released with `page_dealloc` and the same `size`.
#[inline]
pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    unsafe { os::page_alloc(size) }
}

/// Release memory obtained from `page_alloc` or `alloc_aligned`.
///
/// # Safety
/// `ptr` and `size` must describe a whole live mapping.
#[inline]
pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    unsafe { os::page_dealloc(ptr, size) }
}

/// Smallest unit the OS hands out (page size, or 64 KiB on Windows).
#[inline]
pub fn granularity() -> usize {
    os::granularity()
}

/// Allocate `size` bytes aligned to `align` (a power of two).
/// `size` must be a multiple of `granularity()`. Returns null on failure.
///
/// # Safety
/// The memory must be released with `page_dealloc(ptr, size)`.
pub unsafe fn alloc_aligned(align: usize, size: usize) -> *mut u8 {
    debug_assert!(align.is_power_of_two());
    let ptr = unsafe { page_alloc(size) };
    if ptr.is_null() || (ptr as usize) & (align - 1) == 0 {
        return ptr;
    }
    unsafe {
        page_dealloc(ptr, size);
        os::alloc_aligned_slow(align, size)
    }
}

/// Size of the mapping that starts at `ptr`, as reported by the OS.
///
/// # Safety
/// `ptr` must be the start of a live mapping from `alloc_aligned`.
#[cfg(all(windows, not(miri)))]
#[inline]
pub unsafe fn region_size(ptr: *mut u8) -> usize {
    unsafe { os::region_size(ptr) }
}

/// Terminate the process immediately, without unwinding.
pub fn abort() -> ! {
    cfg_if::cfg_if! {
        if #[cfg(feature = "std")] {
            std::process::abort()
        } else {
            unsafe extern "C" {
                fn abort() -> !;
            }
            unsafe { abort() }
        }
    }
}
