//! Unix virtual memory implementation using mmap/munmap.

use core::ffi::c_void;
use core::sync::atomic::{AtomicUsize, Ordering};

const PROT_READ: i32 = 0x1;
const PROT_WRITE: i32 = 0x2;
const MAP_PRIVATE: i32 = 0x02;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))]
const MAP_ANONYMOUS: i32 = 0x1000;
#[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd")))]
const MAP_ANONYMOUS: i32 = 0x20;
const MAP_FAILED: *mut c_void = !0usize as *mut c_void;

unsafe extern "C" {
    fn mmap(
        addr: *mut c_void,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> *mut c_void;

    fn munmap(addr: *mut c_void, length: usize) -> i32;

    fn getpagesize() -> i32;
}

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

pub fn granularity() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = match unsafe { getpagesize() } {
        n if n > 0 => n as usize,
        _ => 4096,
    };
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    let ptr = unsafe {
        mmap(
            core::ptr::null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == MAP_FAILED {
        core::ptr::null_mut()
    } else {
        ptr as *mut u8
    }
}

pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    unsafe { munmap(ptr as *mut c_void, size) };
}

/// Map `size + align - page` bytes and unmap the misaligned head and the tail.
pub unsafe fn alloc_aligned_slow(align: usize, size: usize) -> *mut u8 {
    let page = granularity();
    let Some(span) = size.checked_add(align - page) else {
        return core::ptr::null_mut();
    };
    let raw = unsafe { page_alloc(span) };
    if raw.is_null() {
        return raw;
    }
    let head = (align - (raw as usize & (align - 1))) & (align - 1);
    let tail = span - head - size;
    unsafe {
        if head != 0 {
            page_dealloc(raw, head);
        }
        if tail != 0 {
            page_dealloc(raw.add(head + size), tail);
        }
        raw.add(head)
    }
}
