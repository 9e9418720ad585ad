//! Thread Cache (front-end): per-thread free lists for lock-free allocation.
//!
//! Each size class keeps a free list, a temp list holding one full batch,
//! and a counter. The counter tracks how many more blocks the free list may
//! take before a full batch is set aside: it equals
//! `batch_blocks(class) - len(free_list)` once the class has been used.
//!
//! A free that overflows the free list moves it to the temp list and sends
//! the previous temp list to the central cache. An allocation that finds the
//! free list empty takes the temp list back before going to the central
//! cache. The temp list absorbs alloc/free ping-pong at a batch boundary
//! without touching a lock.

use crate::central_free_list::CentralCache;
use crate::chunk::FreeBlock;
use crate::error::AllocError;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::stat_inc;
use core::ptr::{self, NonNull};

struct ClassCache {
    free_list: *mut FreeBlock,
    temp_list: *mut FreeBlock,
    counter: isize,
}

impl ClassCache {
    const fn new() -> Self {
        Self {
            free_list: ptr::null_mut(),
            temp_list: ptr::null_mut(),
            counter: 0,
        }
    }
}

/// Per-thread cache holding free lists for each size class.
pub struct ThreadCache {
    lists: [ClassCache; NUM_SIZE_CLASSES],
}

// SAFETY: a cache is only used by one thread at a time; the shared fallback
// cache lives behind a SpinMutex.
unsafe impl Send for ThreadCache {}

impl ThreadCache {
    pub const fn new() -> Self {
        Self {
            lists: [const { ClassCache::new() }; NUM_SIZE_CLASSES],
        }
    }

    /// Allocate one block of `class`.
    ///
    /// # Safety
    /// `central` must be the cache every block of this thread cache came from.
    #[inline]
    pub unsafe fn allocate(
        &mut self,
        class: usize,
        central: &CentralCache,
    ) -> Result<NonNull<u8>, AllocError> {
        let list = &mut self.lists[class];
        if let Some(block) = NonNull::new(list.free_list) {
            stat_inc!(thread_cache_hits);
            list.free_list = unsafe { (*block.as_ptr()).next };
            list.counter += 1;
            return Ok(block.cast());
        }
        unsafe { self.refill(class, central) }
    }

    #[cold]
    #[inline(never)]
    unsafe fn refill(&mut self, class: usize, central: &CentralCache) -> Result<NonNull<u8>, AllocError> {
        let list = &mut self.lists[class];
        if let Some(batch) = NonNull::new(list.temp_list) {
            stat_inc!(thread_cache_hits);
            list.free_list = unsafe { (*batch.as_ptr()).next };
            list.temp_list = ptr::null_mut();
            list.counter = 1;
            return Ok(batch.cast());
        }

        stat_inc!(thread_cache_misses);
        let full = size_class::batch_blocks(class) as isize;
        match unsafe { central.fetch(class) } {
            Ok(batch) => {
                list.free_list = unsafe { (*batch.head.as_ptr()).next };
                list.counter = full - batch.count as isize + 1;
                Ok(batch.head.cast())
            }
            Err(e) => {
                list.counter = full;
                Err(e)
            }
        }
    }

    /// Return a block of `class` to this cache.
    ///
    /// # Safety
    /// `ptr` must be a free block of `class` owned by the caller.
    #[inline]
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, class: usize, central: &CentralCache) {
        let list = &mut self.lists[class];
        list.counter -= 1;
        if list.counter < 0 {
            unsafe { self.spill(class, central) };
        }
        let list = &mut self.lists[class];
        let block = ptr.as_ptr() as *mut FreeBlock;
        unsafe { (*block).next = list.free_list };
        list.free_list = block;
    }

    /// The free list holds a full batch: park it on the temp list and send the
    /// previous temp list to the central cache.
    #[cold]
    #[inline(never)]
    unsafe fn spill(&mut self, class: usize, central: &CentralCache) {
        let list = &mut self.lists[class];
        list.counter = size_class::batch_blocks(class) as isize - 1;
        if !list.temp_list.is_null() {
            unsafe { central.release_batch(class, list.temp_list) };
        }
        list.temp_list = list.free_list;
        list.free_list = ptr::null_mut();
    }

    /// Hand every cached block back to the central cache and reset the
    /// counters. The cache stays usable afterwards.
    ///
    /// # Safety
    /// `central` must be the cache the blocks came from.
    pub unsafe fn flush(&mut self, central: &CentralCache) {
        for (class, list) in self.lists.iter_mut().enumerate() {
            if list.free_list.is_null() && list.temp_list.is_null() {
                list.counter = 0;
                continue;
            }
            let head = list.free_list;
            let mut tail = head;
            let mut count = 0;
            if !head.is_null() {
                count = 1;
                unsafe {
                    while !(*tail).next.is_null() {
                        tail = (*tail).next;
                        count += 1;
                    }
                }
            }
            unsafe { central.absorb(class, list.temp_list, head, tail, count) };
            *list = ClassCache::new();
        }
    }

    /// Blocks of `class` currently held, free list and temp list together.
    pub fn cached_blocks(&self, class: usize) -> usize {
        let list = &self.lists[class];
        let mut n = 0;
        for head in [list.free_list, list.temp_list] {
            let mut cur = head;
            while !cur.is_null() {
                n += 1;
                cur = unsafe { (*cur).next };
            }
        }
        n
    }
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}
