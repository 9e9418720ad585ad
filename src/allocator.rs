//! Top-level allocator: ties the tiers together and implements GlobalAlloc.
//!
//! All state lives in module-level statics: the central cache, the large
//! allocation trie, and the per-thread caches. `LtAlloc` is zero-sized.
//!
//! Thread cache strategy (fastest to slowest):
//! - `nightly` feature: `#[thread_local]` with const-init (single TLS read, no branches)
//! - `std` feature: `std::thread_local!` with const-init and a flushing destructor
//! - neither: one shared cache behind a spinlock
//!
//! A thread whose cache is already torn down (allocations from other TLS
//! destructors) also falls back to the shared cache.

use crate::central_free_list::CentralCache;
use crate::chunk;
use crate::config::{AUTO_SQUEEZE_INTERVAL, CANARY_SIZE, CHUNK_MASK, CHUNK_SIZE, MAX_BLOCK_SIZE, PTR_SIZE};
use crate::error::AllocError;
use crate::guard;
use crate::large;
use crate::size_class::{self, class_to_size};
use crate::sync::SpinMutex;
use crate::thread_cache::ThreadCache;
use crate::{debug_log, stat_add, stat_inc};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU32, Ordering};

pub(crate) static CENTRAL_CACHE: CentralCache = CentralCache::new();

/// Used when no thread cache is available.
static SHARED_CACHE: SpinMutex<ThreadCache> = SpinMutex::new(ThreadCache::new());

/// Grow-and-copy reallocations since start, drives the automatic squeeze.
static GROW_REALLOCS: AtomicU32 = AtomicU32::new(0);

/// Highest class a chunk header can legitimately hold.
const MAX_CLASS: usize = size_class::compute_class(MAX_BLOCK_SIZE);

cfg_if::cfg_if! {
    if #[cfg(feature = "nightly")] {
        #[derive(Clone, Copy, PartialEq)]
        #[repr(u8)]
        enum TlsState {
            Uninitialized = 0,
            Active = 1,
            Destroyed = 2,
        }

        struct TlsSlot<T> {
            state: TlsState,
            content: T,
        }

        #[inline(always)]
        unsafe fn tc() -> *mut ThreadCache {
            unsafe { core::ptr::addr_of_mut!(TC.content) }
        }

        #[thread_local]
        static mut TC: TlsSlot<ThreadCache> = TlsSlot {
            state: TlsState::Uninitialized,
            content: ThreadCache::new(),
        };

        /// Flush the cache and mark it Destroyed. Later allocations on this
        /// thread go to the shared cache.
        #[cold]
        #[allow(dead_code)] // Only called from the std cleanup guard
        unsafe fn tc_destroy() {
            unsafe {
                if TC.state == TlsState::Active {
                    TC.state = TlsState::Destroyed;
                    (*tc()).flush(&CENTRAL_CACHE);
                }
            }
        }

        #[cold]
        #[inline(never)]
        unsafe fn tc_init() {
            // Active BEFORE registering the guard: if registration allocates,
            // the nested call uses the cache instead of initializing again.
            unsafe { TC.state = TlsState::Active };
            tc_cleanup::register();
        }

        #[cfg(feature = "std")]
        mod tc_cleanup {
            struct Guard;

            impl Drop for Guard {
                fn drop(&mut self) {
                    unsafe { super::tc_destroy() };
                }
            }

            std::thread_local! {
                static GUARD: Guard = const { Guard };
            }

            pub(super) fn register() {
                // If std's TLS is already gone the cache is only flushed by an
                // explicit on_thread_exit().
                let _ = GUARD.try_with(|_| {});
            }
        }

        // Without std there is no destructor hook: threads call on_thread_exit().
        #[cfg(not(feature = "std"))]
        mod tc_cleanup {
            pub(super) fn register() {}
        }

        #[inline(always)]
        unsafe fn alloc_small(class: usize) -> Result<NonNull<u8>, AllocError> {
            if unsafe { TC.state } == TlsState::Active {
                return unsafe { (*tc()).allocate(class, &CENTRAL_CACHE) };
            }
            unsafe { alloc_small_slow(class) }
        }

        #[cold]
        #[inline(never)]
        unsafe fn alloc_small_slow(class: usize) -> Result<NonNull<u8>, AllocError> {
            if unsafe { TC.state } == TlsState::Uninitialized {
                unsafe {
                    tc_init();
                    return (*tc()).allocate(class, &CENTRAL_CACHE);
                }
            }
            unsafe { alloc_shared(class) }
        }

        #[inline(always)]
        unsafe fn dealloc_small(ptr: NonNull<u8>, class: usize) {
            if unsafe { TC.state } == TlsState::Active {
                unsafe { (*tc()).deallocate(ptr, class, &CENTRAL_CACHE) };
                return;
            }
            unsafe { dealloc_small_slow(ptr, class) };
        }

        /// A thread that frees before it ever allocates still gets its own
        /// cache; only a torn-down cache falls back to the shared one.
        #[cold]
        #[inline(never)]
        unsafe fn dealloc_small_slow(ptr: NonNull<u8>, class: usize) {
            if unsafe { TC.state } == TlsState::Uninitialized {
                unsafe {
                    tc_init();
                    (*tc()).deallocate(ptr, class, &CENTRAL_CACHE);
                }
                return;
            }
            unsafe { dealloc_shared(ptr, class) };
        }

        fn flush_current_thread() {
            unsafe {
                if TC.state == TlsState::Active {
                    (*tc()).flush(&CENTRAL_CACHE);
                }
            }
        }
    } else if #[cfg(feature = "std")] {
        struct LocalCache(core::cell::UnsafeCell<ThreadCache>);

        impl Drop for LocalCache {
            fn drop(&mut self) {
                unsafe { self.0.get_mut().flush(&CENTRAL_CACHE) };
            }
        }

        std::thread_local! {
            static TC_CELL: LocalCache = const {
                LocalCache(core::cell::UnsafeCell::new(ThreadCache::new()))
            };
        }

        #[inline(always)]
        unsafe fn alloc_small(class: usize) -> Result<NonNull<u8>, AllocError> {
            match TC_CELL.try_with(|cell| unsafe { (*cell.0.get()).allocate(class, &CENTRAL_CACHE) }) {
                Ok(result) => result,
                Err(_) => unsafe { alloc_shared(class) },
            }
        }

        #[inline(always)]
        unsafe fn dealloc_small(ptr: NonNull<u8>, class: usize) {
            if TC_CELL
                .try_with(|cell| unsafe { (*cell.0.get()).deallocate(ptr, class, &CENTRAL_CACHE) })
                .is_err()
            {
                unsafe { dealloc_shared(ptr, class) };
            }
        }

        fn flush_current_thread() {
            let _ = TC_CELL.try_with(|cell| unsafe { (*cell.0.get()).flush(&CENTRAL_CACHE) });
        }
    } else {
        #[inline(always)]
        unsafe fn alloc_small(class: usize) -> Result<NonNull<u8>, AllocError> {
            unsafe { alloc_shared(class) }
        }

        #[inline(always)]
        unsafe fn dealloc_small(ptr: NonNull<u8>, class: usize) {
            unsafe { dealloc_shared(ptr, class) };
        }

        fn flush_current_thread() {
            unsafe { SHARED_CACHE.lock().flush(&CENTRAL_CACHE) };
        }
    }
}

#[cold]
unsafe fn alloc_shared(class: usize) -> Result<NonNull<u8>, AllocError> {
    unsafe { SHARED_CACHE.lock().allocate(class, &CENTRAL_CACHE) }
}

#[cold]
unsafe fn dealloc_shared(ptr: NonNull<u8>, class: usize) {
    unsafe { SHARED_CACHE.lock().deallocate(ptr, class, &CENTRAL_CACHE) };
}

/// Allocate a block of at least `size` bytes (canary included). Returns the
/// block and its real size.
#[inline]
fn alloc_block(size: usize) -> Result<(NonNull<u8>, usize), AllocError> {
    if size <= MAX_BLOCK_SIZE {
        let class = size_class::size_to_class(size);
        let ptr = unsafe { alloc_small(class)? };
        Ok((ptr, class_to_size(class)))
    } else {
        large::alloc(size, CHUNK_SIZE)
    }
}

/// Real size of the block at `ptr`, canary included.
#[inline]
unsafe fn block_size(ptr: *const u8) -> Option<usize> {
    if ptr as usize & CHUNK_MASK != 0 {
        Some(class_to_size(unsafe { chunk::class_of(ptr) }))
    } else if ptr.is_null() {
        None
    } else {
        unsafe { large::size_of(ptr as *mut u8) }
    }
}

/// Allocate at least `size` bytes, aligned to the pointer size.
pub fn try_malloc(size: usize) -> Result<NonNull<u8>, AllocError> {
    stat_inc!(alloc_count);
    stat_add!(alloc_bytes, size);
    let total = size.checked_add(CANARY_SIZE).ok_or(AllocError::OutOfMemory)?;
    let (ptr, block) = alloc_block(total)?;
    unsafe { guard::arm(ptr.as_ptr(), block) };
    Ok(ptr)
}

/// Allocate at least `size` bytes. Returns null when out of memory.
#[inline]
pub fn malloc(size: usize) -> *mut u8 {
    try_malloc(size).map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// Allocate at least `size` bytes aligned to `align`, which must be a power
/// of two. Any alignment is supported.
pub fn try_aligned_alloc(align: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    if !align.is_power_of_two() {
        return Err(AllocError::InvalidAlignment { align });
    }
    if align <= PTR_SIZE {
        return try_malloc(size);
    }
    if align <= CHUNK_SIZE {
        // Blocks end at a chunk boundary and every class size that is a
        // multiple of `align` keeps its blocks `align`-aligned. Size zero
        // counts as one byte so it never lands in the pointer class.
        let padded = size
            .max(1)
            .checked_add(CANARY_SIZE + align - 1)
            .ok_or(AllocError::OutOfMemory)?
            & !(align - 1);
        return try_malloc(padded - CANARY_SIZE);
    }
    stat_inc!(alloc_count);
    stat_add!(alloc_bytes, size);
    let total = size.checked_add(CANARY_SIZE).ok_or(AllocError::OutOfMemory)?;
    let (ptr, block) = large::alloc(total, align)?;
    unsafe { guard::arm(ptr.as_ptr(), block) };
    Ok(ptr)
}

/// Aligned allocation. Returns null on failure or on a bad alignment.
#[inline]
pub fn aligned_alloc(align: usize, size: usize) -> *mut u8 {
    try_aligned_alloc(align, size).map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// Allocate `count * size` zeroed bytes. Returns null on overflow or when out
/// of memory.
pub fn calloc(count: usize, size: usize) -> *mut u8 {
    let Some(total) = count.checked_mul(size) else {
        return ptr::null_mut();
    };
    let ptr = malloc(total);
    // Large allocations are fresh mappings, already zeroed by the OS.
    if !ptr.is_null() && ptr as usize & CHUNK_MASK != 0 {
        unsafe { ptr::write_bytes(ptr, 0, total) };
    }
    ptr
}

/// Release an allocation. Null is ignored.
///
/// # Safety
/// `ptr` must be null or a live pointer returned by this allocator.
pub unsafe fn free(ptr: *mut u8) {
    if ptr as usize & CHUNK_MASK != 0 {
        stat_inc!(free_count);
        let class = unsafe { chunk::class_of(ptr) };
        if class > MAX_CLASS {
            malformed_free(ptr);
            return;
        }
        if let Err(e) = unsafe { guard::verify(ptr, class_to_size(class)) } {
            guard::corruption(e);
        }
        unsafe { dealloc_small(NonNull::new_unchecked(ptr), class) };
    } else if !ptr.is_null() {
        unsafe { free_large(ptr) };
    }
}

#[cold]
unsafe fn free_large(ptr: *mut u8) {
    stat_inc!(free_count);
    let Some(size) = (unsafe { large::take(ptr) }) else {
        malformed_free(ptr);
        return;
    };
    if let Err(e) = unsafe { guard::verify(ptr, size) } {
        guard::corruption(e);
    }
    unsafe { large::unmap(ptr, size) };
}

/// A pointer that was never handed out. Leaked in release builds.
#[cold]
fn malformed_free(ptr: *mut u8) {
    let err = AllocError::MalformedFreeTarget { addr: ptr as usize };
    debug_log!("{}", err);
    debug_assert!(false, "{}", err);
}

/// Zero the usable part of an allocation, then free it.
///
/// # Safety
/// Same as [`free`].
pub unsafe fn free_and_zero(ptr: *mut u8) {
    unsafe {
        let usable = usable_size(ptr);
        if usable != 0 {
            ptr::write_bytes(ptr, 0, usable);
        }
        free(ptr);
    }
}

/// Number of bytes the caller may use at `ptr`; zero for null.
///
/// # Safety
/// `ptr` must be null or a live pointer returned by this allocator.
pub unsafe fn usable_size(ptr: *const u8) -> usize {
    unsafe { block_size(ptr) }.map_or(0, |size| size - CANARY_SIZE)
}

/// Resize an allocation. Null behaves like `malloc`, a zero size like `free`
/// (returning null). Shrinking, or growing within the usable size, keeps the
/// pointer. On failure null is returned and the old allocation stays valid.
///
/// # Safety
/// `ptr` must be null or a live pointer returned by this allocator.
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    let Some(old) = NonNull::new(ptr) else {
        return malloc(size);
    };
    if size == 0 {
        unsafe { free(ptr) };
        return ptr::null_mut();
    }
    unsafe { try_realloc(old, size, PTR_SIZE) }.map_or(ptr::null_mut(), NonNull::as_ptr)
}

unsafe fn try_realloc(ptr: NonNull<u8>, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
    let usable = unsafe { usable_size(ptr.as_ptr()) };
    if size <= usable {
        return Ok(ptr);
    }
    let new = try_aligned_alloc(align, size)?;
    unsafe {
        ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), usable);
        free(ptr.as_ptr());
    }
    stat_inc!(realloc_moves);
    if AUTO_SQUEEZE_INTERVAL != 0 {
        let n = GROW_REALLOCS.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if n % AUTO_SQUEEZE_INTERVAL == 0 {
            squeeze(0);
        }
    }
    Ok(new)
}

/// Return idle chunks to the OS, keeping up to `pad_bytes` of them for
/// reuse. Returns the number of bytes released.
pub fn squeeze(pad_bytes: usize) -> usize {
    CENTRAL_CACHE.squeeze(pad_bytes)
}

/// Hand the calling thread's cached blocks back to the central cache.
///
/// Runs automatically when a thread exits (with `std` or `nightly` + `std`);
/// call it by hand on platforms without TLS destructors. Calling it more than
/// once is harmless and the thread may keep allocating afterwards.
pub fn on_thread_exit() {
    flush_current_thread();
}

/// Check the overflow canary of a live allocation.
///
/// # Safety
/// `ptr` must be a live pointer returned by this allocator.
#[cfg(feature = "overflow-guard")]
pub unsafe fn check_canary(ptr: *mut u8) -> Result<(), AllocError> {
    match unsafe { block_size(ptr) } {
        Some(size) => unsafe { guard::verify(ptr, size) },
        None => Err(AllocError::MalformedFreeTarget { addr: ptr as usize }),
    }
}

/// ltalloc as a Rust global allocator.
///
/// Register as the global allocator with:
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: ltalloc::LtAlloc = ltalloc::LtAlloc;
/// ```
pub struct LtAlloc;

impl LtAlloc {
    #[inline]
    fn alloc_layout(layout: Layout) -> Result<NonNull<u8>, AllocError> {
        if layout.align() <= PTR_SIZE {
            try_malloc(layout.size())
        } else {
            try_aligned_alloc(layout.align(), layout.size())
        }
    }
}

unsafe impl GlobalAlloc for LtAlloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        Self::alloc_layout(layout).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // The block remembers its own size; a layout shrunk in place by
        // realloc would not match anyway.
        unsafe { free(ptr) };
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() && ptr as usize & CHUNK_MASK != 0 {
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(old) = NonNull::new(ptr) else {
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            return unsafe { self.alloc(new_layout) };
        };
        unsafe { try_realloc(old, new_size, layout.align()) }.map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}

#[cfg(feature = "nightly")]
unsafe impl core::alloc::Allocator for LtAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, core::alloc::AllocError> {
        let ptr = Self::alloc_layout(layout).map_err(|_| core::alloc::AllocError)?;
        let usable = unsafe { usable_size(ptr.as_ptr()) };
        Ok(NonNull::slice_from_raw_parts(ptr, usable))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        unsafe { free(ptr.as_ptr()) }
    }
}
