//! Central cache: per-size-class shared pools of free blocks.
//!
//! Each class has its own cache-line aligned slot with its own spinlock.
//! Thread caches fetch and return whole batches here. A refill is served, in
//! order, from a prepared batch, from the loose free list, from the chunk
//! currently being carved, and finally from a new chunk. The lock is dropped
//! around the chunk request so no OS call happens under it.

use crate::chunk::{self, ChunkHeader, FreeBlock, PadPool, SmallChunk, SMALL_CHUNK_BATCHES};
use crate::config::{CHUNK_MASK, CHUNK_SIZE};
use crate::error::AllocError;
use crate::size_class::{self, class_to_size, NUM_SIZE_CLASSES};
use crate::stat_inc;
use crate::sync::SpinMutex;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};

/// Blocks handed to a thread cache, linked through `next` and null-terminated.
pub struct Batch {
    pub head: NonNull<FreeBlock>,
    pub count: usize,
}

/// Free blocks of one size class. Only accessed under the slot lock.
pub struct CentralFreeList {
    /// Next uncarved block of the chunk being split.
    pub(crate) carve_next: *mut u8,
    /// Uncarved blocks left at `carve_next`.
    pub(crate) carve_left: usize,
    /// Full batches, linked through `next_batch`. Unused by the pointer class.
    pub(crate) first_batch: *mut FreeBlock,
    /// Pointer class only: chunk whose header array holds the newest batch.
    pub(crate) batch_chunk: *mut SmallChunk,
    /// Blocks not grouped into a batch.
    pub(crate) free_list: *mut FreeBlock,
    pub(crate) free_len: usize,
}

unsafe impl Send for CentralFreeList {}

impl CentralFreeList {
    pub const fn new() -> Self {
        Self {
            carve_next: ptr::null_mut(),
            carve_left: 0,
            first_batch: ptr::null_mut(),
            batch_chunk: ptr::null_mut(),
            free_list: ptr::null_mut(),
            free_len: 0,
        }
    }

    unsafe fn pop_batch(&mut self, class: usize) -> Option<NonNull<FreeBlock>> {
        if !size_class::is_pointer_class(class) {
            let batch = NonNull::new(self.first_batch)?;
            self.first_batch = unsafe { (*batch.as_ptr()).next_batch };
            return Some(batch);
        }
        let mut sc = self.batch_chunk;
        if sc.is_null() {
            return None;
        }
        unsafe {
            if (*sc).num_batches == 0 {
                sc = (*sc).prev;
                if sc.is_null() {
                    return None;
                }
                debug_assert_eq!((*sc).num_batches, SMALL_CHUNK_BATCHES);
                self.batch_chunk = sc;
            }
            (*sc).num_batches -= 1;
            NonNull::new((*sc).batches[(*sc).num_batches])
        }
    }

    pub(crate) unsafe fn push_batch(&mut self, class: usize, batch: *mut FreeBlock) {
        if !size_class::is_pointer_class(class) {
            unsafe { (*batch).next_batch = self.first_batch };
            self.first_batch = batch;
            return;
        }
        unsafe {
            let mut sc = self.batch_chunk;
            debug_assert!(!sc.is_null());
            if (*sc).num_batches == SMALL_CHUNK_BATCHES {
                sc = (*sc).next;
                debug_assert!(!sc.is_null() && (*sc).num_batches == 0);
                self.batch_chunk = sc;
            }
            (*sc).batches[(*sc).num_batches] = batch;
            (*sc).num_batches += 1;
        }
    }

    /// Prepend a null-terminated list of `count` loose blocks ending at `tail`.
    pub(crate) unsafe fn push_loose(&mut self, head: *mut FreeBlock, tail: *mut FreeBlock, count: usize) {
        unsafe { (*tail).next = self.free_list };
        self.free_list = head;
        self.free_len += count;
    }

    /// Take `want` loose blocks, or all of them when at most one extra remains.
    unsafe fn take_loose(&mut self, want: usize) -> Option<Batch> {
        let head = NonNull::new(self.free_list)?;
        if self.free_len <= want + 1 {
            let count = self.free_len;
            self.free_list = ptr::null_mut();
            self.free_len = 0;
            return Some(Batch { head, count });
        }
        unsafe {
            let mut tail = head.as_ptr();
            for _ in 1..want {
                tail = (*tail).next;
            }
            self.free_list = (*tail).next;
            (*tail).next = ptr::null_mut();
        }
        self.free_len -= want;
        Some(Batch { head, count: want })
    }

    /// Reserve up to `want` blocks from the carving chunk. The blocks are
    /// linked by the caller after the lock is released.
    unsafe fn reserve_carve(&mut self, block_size: usize, want: usize) -> Option<(*mut u8, usize)> {
        if self.carve_left == 0 {
            return None;
        }
        let count = want.min(self.carve_left);
        let start = self.carve_next;
        self.carve_left -= count;
        self.carve_next = start.wrapping_add(count * block_size);
        if self.carve_left == 0 {
            // Chunk used up: resume the chunk that was put on hold, if any.
            let held = unsafe { *chunk::tail_link(self.carve_next) };
            self.carve_next = held;
            if !held.is_null() {
                self.carve_left = (CHUNK_SIZE - (held as usize & CHUNK_MASK)) / block_size;
            }
        }
        Some((start, count))
    }

    /// Make `chunk` the carving chunk. A chunk that is still being carved is
    /// put on hold through the tail link of the new one.
    unsafe fn install_carve(&mut self, chunk: *mut u8, carve_next: *mut u8, carve_left: usize) {
        if carve_left == 0 {
            return;
        }
        if self.carve_left != 0 {
            unsafe { *chunk::tail_link(chunk.add(CHUNK_SIZE)) = self.carve_next };
        }
        self.carve_next = carve_next;
        self.carve_left = carve_left;
    }

    /// Insert a fresh pointer-class chunk right after the current batch chunk.
    unsafe fn link_small_chunk(&mut self, sc: *mut SmallChunk) {
        unsafe {
            (*sc).num_batches = 0;
            (*sc).prev = self.batch_chunk;
            let cur = self.batch_chunk;
            if cur.is_null() {
                (*sc).next = ptr::null_mut();
                self.batch_chunk = sc;
            } else {
                (*sc).next = (*cur).next;
                if !(*cur).next.is_null() {
                    (*(*cur).next).prev = sc;
                }
                (*cur).next = sc;
            }
        }
    }
}

/// One size class: the locked free list plus the address range of every chunk
/// the class ever used. The range is read without the lock by squeeze as a
/// cheap pre-check.
#[repr(align(64))]
pub struct CentralSlot {
    pub(crate) list: SpinMutex<CentralFreeList>,
    pub(crate) min_chunk: AtomicUsize,
    pub(crate) max_chunk: AtomicUsize,
}

impl CentralSlot {
    const fn new() -> Self {
        Self {
            list: SpinMutex::new(CentralFreeList::new()),
            min_chunk: AtomicUsize::new(0),
            max_chunk: AtomicUsize::new(0),
        }
    }

    /// Widen the chunk range. Called with the slot lock held.
    fn note_chunk(&self, chunk: usize) {
        let min = self.min_chunk.load(Ordering::Relaxed);
        if min == 0 || chunk < min {
            self.min_chunk.store(chunk, Ordering::Relaxed);
        }
        if chunk > self.max_chunk.load(Ordering::Relaxed) {
            self.max_chunk.store(chunk, Ordering::Relaxed);
        }
    }
}

/// All central free lists plus the pad pool shared between them.
pub struct CentralCache {
    pub(crate) slots: [CentralSlot; NUM_SIZE_CLASSES],
    pub(crate) pad: SpinMutex<PadPool>,
}

impl CentralCache {
    pub const fn new() -> Self {
        Self {
            slots: [const { CentralSlot::new() }; NUM_SIZE_CLASSES],
            pad: SpinMutex::new(PadPool::new()),
        }
    }

    /// Get up to `batch_blocks(class)` blocks (one more when the loose list is
    /// drained) for a thread cache.
    ///
    /// # Safety
    /// `class` must be a class of some size up to `MAX_BLOCK_SIZE`.
    pub unsafe fn fetch(&self, class: usize) -> Result<Batch, AllocError> {
        let slot = &self.slots[class];
        let want = size_class::batch_blocks(class);
        let block_size = class_to_size(class);

        let mut list = slot.list.lock();
        if let Some(head) = unsafe { list.pop_batch(class) } {
            stat_inc!(central_batch_hits);
            return Ok(Batch { head, count: want });
        }
        if let Some(batch) = unsafe { list.take_loose(want) } {
            stat_inc!(central_loose_hits);
            return Ok(batch);
        }
        if let Some((start, count)) = unsafe { list.reserve_carve(block_size, want) } {
            drop(list);
            stat_inc!(chunk_carves);
            let head = unsafe { chunk::link_blocks(start, block_size, count) };
            return Ok(Batch { head, count });
        }
        drop(list);
        unsafe { self.grow(class, want, block_size) }
    }

    /// Start a new chunk for `class` and return its first batch.
    #[cold]
    unsafe fn grow(&self, class: usize, want: usize, block_size: usize) -> Result<Batch, AllocError> {
        let chunk = unsafe { chunk::obtain(&self.pad)? }.as_ptr();
        let total = chunk::blocks_per_chunk(class);
        let take = want.min(total);
        let first = chunk::first_block(chunk, class);
        let head = unsafe {
            (*(chunk as *mut ChunkHeader)).size_class = class as u32;
            chunk::link_blocks(first, block_size, take)
        };

        let slot = &self.slots[class];
        let mut list = slot.list.lock();
        slot.note_chunk(chunk as usize);
        unsafe {
            if size_class::is_pointer_class(class) {
                list.link_small_chunk(chunk as *mut SmallChunk);
            }
            list.install_carve(chunk, first.add(take * block_size), total - take);
        }
        Ok(Batch { head, count: take })
    }

    /// Return one full batch from a thread cache.
    ///
    /// # Safety
    /// `batch` must hold exactly `batch_blocks(class)` blocks of `class`.
    pub unsafe fn release_batch(&self, class: usize, batch: *mut FreeBlock) {
        let mut list = self.slots[class].list.lock();
        unsafe { list.push_batch(class, batch) };
    }

    /// Take back everything a thread cache holds for `class` in one critical
    /// section: an optional full batch and an optional loose list.
    ///
    /// # Safety
    /// `loose` must be null or a list of `count` blocks ending at `tail`.
    pub unsafe fn absorb(
        &self,
        class: usize,
        batch: *mut FreeBlock,
        loose: *mut FreeBlock,
        tail: *mut FreeBlock,
        count: usize,
    ) {
        let mut list = self.slots[class].list.lock();
        unsafe {
            if !batch.is_null() {
                list.push_batch(class, batch);
            }
            if !loose.is_null() {
                list.push_loose(loose, tail, count);
            }
        }
    }
}
