//! C-ABI exports for linking ltalloc into C and C++ programs.
//!
//! Gated behind `features = ["ffi"]`, built as part of the staticlib/cdylib.
//! The `lt*` names are always exported. With `c-abi` the standard C heap
//! functions are exported as well, replacing the libc allocator for the
//! whole process.

use crate::allocator;
use core::ffi::c_void;

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ltmalloc(size: usize) -> *mut c_void {
    allocator::malloc(size).cast()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ltfree(ptr: *mut c_void) {
    unsafe { allocator::free(ptr.cast()) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ltfreeclear(ptr: *mut c_void) {
    unsafe { allocator::free_and_zero(ptr.cast()) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ltrealloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    unsafe { allocator::realloc(ptr.cast(), size).cast() }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ltcalloc(count: usize, size: usize) -> *mut c_void {
    allocator::calloc(count, size).cast()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ltmemalign(align: usize, size: usize) -> *mut c_void {
    allocator::aligned_alloc(align, size).cast()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ltmsize(ptr: *mut c_void) -> usize {
    unsafe { allocator::usable_size(ptr.cast()) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ltsqueeze(pad_bytes: usize) -> usize {
    allocator::squeeze(pad_bytes)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn ltonthreadexit() {
    allocator::on_thread_exit()
}

#[cfg(feature = "c-abi")]
mod c_abi {
    use crate::allocator;
    use crate::config::PTR_SIZE;
    use core::ffi::{c_int, c_void};

    const EINVAL: c_int = 22;
    const ENOMEM: c_int = 12;

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
        allocator::malloc(size).cast()
    }

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn free(ptr: *mut c_void) {
        unsafe { allocator::free(ptr.cast()) }
    }

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
        allocator::calloc(count, size).cast()
    }

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
        unsafe { allocator::realloc(ptr.cast(), size).cast() }
    }

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn aligned_alloc(align: usize, size: usize) -> *mut c_void {
        allocator::aligned_alloc(align, size).cast()
    }

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn memalign(align: usize, size: usize) -> *mut c_void {
        allocator::aligned_alloc(align, size).cast()
    }

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn posix_memalign(out: *mut *mut c_void, align: usize, size: usize) -> c_int {
        if !align.is_power_of_two() || align % PTR_SIZE != 0 {
            return EINVAL;
        }
        match allocator::try_aligned_alloc(align, size) {
            Ok(ptr) => {
                unsafe { *out = ptr.as_ptr().cast() };
                0
            }
            Err(_) => ENOMEM,
        }
    }

    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
        unsafe { allocator::usable_size(ptr.cast()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lt_entry_points() {
        unsafe {
            let p = ltmalloc(40);
            assert!(!p.is_null());
            assert!(ltmsize(p) >= 40);
            let q = ltrealloc(p, 4000);
            assert!(ltmsize(q) >= 4000);
            ltfreeclear(q);

            let z = ltcalloc(4, 25);
            assert_eq!(core::slice::from_raw_parts(z as *const u8, 100), &[0u8; 100][..]);
            ltfree(z);

            let a = ltmemalign(256, 100);
            assert_eq!(a as usize % 256, 0);
            ltfree(a);
            ltfree(core::ptr::null_mut());
            ltonthreadexit();
            let _ = ltsqueeze(0);
        }
    }
}
