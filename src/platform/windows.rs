//! Windows virtual memory implementation using VirtualAlloc/VirtualFree.

use core::ffi::c_void;

const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const MEM_RELEASE: u32 = 0x8000;
const PAGE_READWRITE: u32 = 0x04;

// Windows allocation granularity is 64 KiB.
const ALLOC_GRANULARITY: usize = 65536;

#[repr(C)]
struct MemoryBasicInformation {
    base_address: *mut c_void,
    allocation_base: *mut c_void,
    allocation_protect: u32,
    #[cfg(target_pointer_width = "64")]
    partition_id: u16,
    region_size: usize,
    state: u32,
    protect: u32,
    kind: u32,
}

unsafe extern "system" {
    #[link_name = "VirtualAlloc"]
    fn virtual_alloc(
        lp_address: *mut c_void,
        dw_size: usize,
        fl_allocation_type: u32,
        fl_protect: u32,
    ) -> *mut c_void;

    #[link_name = "VirtualFree"]
    fn virtual_free(lp_address: *mut c_void, dw_size: usize, dw_free_type: u32) -> i32;

    #[link_name = "VirtualQuery"]
    fn virtual_query(
        lp_address: *const c_void,
        lp_buffer: *mut MemoryBasicInformation,
        dw_length: usize,
    ) -> usize;
}

/// Round up to the next multiple of `align` (must be a power of 2).
#[inline]
const fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

pub fn granularity() -> usize {
    ALLOC_GRANULARITY
}

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    let alloc_size = round_up(size, ALLOC_GRANULARITY);
    unsafe {
        virtual_alloc(
            core::ptr::null_mut(),
            alloc_size,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        ) as *mut u8
    }
}

pub unsafe fn page_dealloc(ptr: *mut u8, _size: usize) {
    // MEM_RELEASE requires dwSize = 0 (releases entire allocation)
    unsafe { virtual_free(ptr as *mut c_void, 0, MEM_RELEASE) };
}

/// Reserve an oversized range, release it and commit the aligned part of it.
/// Another thread may grab the range in between, so retry until it sticks.
pub unsafe fn alloc_aligned_slow(align: usize, size: usize) -> *mut u8 {
    let Some(span) = size.checked_add(align - ALLOC_GRANULARITY) else {
        return core::ptr::null_mut();
    };
    loop {
        let probe = unsafe {
            virtual_alloc(core::ptr::null_mut(), span, MEM_RESERVE, PAGE_READWRITE)
        };
        if probe.is_null() {
            return core::ptr::null_mut();
        }
        unsafe { virtual_free(probe, 0, MEM_RELEASE) };
        let aligned = round_up(probe as usize, align) as *mut c_void;
        let ptr = unsafe {
            virtual_alloc(aligned, size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
        };
        if !ptr.is_null() {
            return ptr as *mut u8;
        }
    }
}

pub unsafe fn region_size(ptr: *mut u8) -> usize {
    let mut info = core::mem::MaybeUninit::<MemoryBasicInformation>::uninit();
    let written = unsafe {
        virtual_query(
            ptr as *const c_void,
            info.as_mut_ptr(),
            core::mem::size_of::<MemoryBasicInformation>(),
        )
    };
    if written == 0 {
        return 0;
    }
    unsafe { info.assume_init().region_size }
}
