//! Reclaim: return fully idle chunks to the OS.
//!
//! For each class whose chunks span more than one chunk of address space,
//! every free block held by the central cache is detached under the lock.
//! Outside the lock the blocks are counted per chunk; a chunk whose count
//! reaches `blocks_per_chunk` has no live and no cached block left and can go.
//! Batches that only touch surviving chunks are handed back intact; the
//! others are dissolved and their surviving blocks regrouped into full
//! batches plus a loose remainder. Released chunks first top up the pad pool
//! to the requested size, the rest are unmapped.
//!
//! Blocks sitting in thread caches are invisible here, so their chunks stay.
//! The pointer-size class is never squeezed.

use crate::central_free_list::{CentralCache, CentralSlot};
use crate::chunk::{self, FreeBlock};
use crate::config::CHUNK_SIZE;
use crate::platform;
use crate::size_class::{self, NUM_SIZE_CLASSES, SMALLEST_BATCHED_CLASS};
use crate::{debug_log, stat_add, stat_inc};
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::Ordering;

/// Per-chunk counters that fit on the stack; larger spans map a buffer.
const STACK_COUNTERS: usize = 16 * 1024;

/// Free-block counters for one class, indexed by chunk.
struct ChunkCounts<'a> {
    counts: &'a mut [u16],
    min_chunk: usize,
}

impl ChunkCounts<'_> {
    #[inline]
    fn index(&self, block: *mut FreeBlock) -> usize {
        (block as usize - self.min_chunk) / CHUNK_SIZE
    }

    #[inline]
    fn is_idle(&self, block: *mut FreeBlock, total: usize) -> bool {
        self.counts[self.index(block)] as usize == total
    }
}

/// A list of blocks being regrouped into full batches.
struct Regroup {
    batches: *mut FreeBlock,
    batches_tail: *mut FreeBlock,
    loose: *mut FreeBlock,
    loose_tail: *mut FreeBlock,
    loose_len: usize,
    batch_len: usize,
}

impl Regroup {
    fn new(batch_len: usize) -> Self {
        Self {
            batches: ptr::null_mut(),
            batches_tail: ptr::null_mut(),
            loose: ptr::null_mut(),
            loose_tail: ptr::null_mut(),
            loose_len: 0,
            batch_len,
        }
    }

    unsafe fn keep_batch(&mut self, batch: *mut FreeBlock) {
        unsafe { (*batch).next_batch = self.batches };
        if self.batches.is_null() {
            self.batches_tail = batch;
        }
        self.batches = batch;
    }

    unsafe fn push_block(&mut self, block: *mut FreeBlock) {
        unsafe { (*block).next = self.loose };
        if self.loose.is_null() {
            self.loose_tail = block;
        }
        self.loose = block;
        self.loose_len += 1;
        if self.loose_len == self.batch_len {
            let batch = self.loose;
            self.loose = ptr::null_mut();
            self.loose_tail = ptr::null_mut();
            self.loose_len = 0;
            unsafe { self.keep_batch(batch) };
        }
    }
}

impl CentralCache {
    /// Release idle chunks of every class, keeping up to `pad_bytes` of them
    /// in the pad pool. Returns the number of bytes unmapped.
    pub fn squeeze(&self, pad_bytes: usize) -> usize {
        stat_inc!(squeeze_runs);
        let mut released = 0;
        for class in SMALLEST_BATCHED_CLASS..NUM_SIZE_CLASSES {
            let slot = &self.slots[class];
            if !spans_several_chunks(slot) {
                continue;
            }
            released += unsafe { self.squeeze_class(class, pad_bytes) };
        }
        if released != 0 {
            debug_log!("squeeze returned {} bytes to the OS", released);
        }
        released
    }

    unsafe fn squeeze_class(&self, class: usize, pad_bytes: usize) -> usize {
        let slot = &self.slots[class];
        let mut list = slot.list.lock();
        if !spans_several_chunks(slot) {
            return 0;
        }
        let min_chunk = slot.min_chunk.load(Ordering::Relaxed);
        let span = (slot.max_chunk.load(Ordering::Relaxed) - min_chunk) / CHUNK_SIZE + 1;
        let batches = list.first_batch;
        let loose = list.free_list;
        let loose_len = list.free_len;
        list.first_batch = ptr::null_mut();
        list.free_list = ptr::null_mut();
        list.free_len = 0;
        drop(list);

        if batches.is_null() && loose.is_null() {
            return 0;
        }

        let mut stack = MaybeUninit::<[u16; STACK_COUNTERS]>::uninit();
        let heap_bytes = span * core::mem::size_of::<u16>();
        let counts: *mut u16 = if span <= STACK_COUNTERS {
            stack.as_mut_ptr() as *mut u16
        } else {
            unsafe { platform::page_alloc(heap_bytes) as *mut u16 }
        };
        if counts.is_null() {
            // No room to count: put everything back untouched.
            unsafe { self.give_back(class, batches, loose, loose_len) };
            return 0;
        }
        unsafe { ptr::write_bytes(counts, 0, span) };
        let mut counts = ChunkCounts {
            counts: unsafe { core::slice::from_raw_parts_mut(counts, span) },
            min_chunk,
        };

        let total = chunk::blocks_per_chunk(class);
        let mut idle: *mut u8 = ptr::null_mut();
        unsafe {
            let mut batch = batches;
            while !batch.is_null() {
                count_list(&mut counts, batch, total, &mut idle);
                batch = (*batch).next_batch;
            }
            count_list(&mut counts, loose, total, &mut idle);
        }

        if idle.is_null() {
            unsafe { self.give_back(class, batches, loose, loose_len) };
        } else {
            let mut regroup = Regroup::new(size_class::batch_blocks(class));
            unsafe {
                let mut batch = batches;
                while !batch.is_null() {
                    let next_batch = (*batch).next_batch;
                    if batch_touches_idle(&counts, batch, total) {
                        let mut block = batch;
                        while !block.is_null() {
                            let next = (*block).next;
                            if !counts.is_idle(block, total) {
                                regroup.push_block(block);
                            }
                            block = next;
                        }
                    } else {
                        regroup.keep_batch(batch);
                    }
                    batch = next_batch;
                }
                let mut block = loose;
                while !block.is_null() {
                    let next = (*block).next;
                    if !counts.is_idle(block, total) {
                        regroup.push_block(block);
                    }
                    block = next;
                }
                self.give_back_regrouped(class, &regroup);
            }
        }

        if span > STACK_COUNTERS {
            unsafe { platform::page_dealloc(counts.counts.as_mut_ptr() as *mut u8, heap_bytes) };
        }

        unsafe { self.dispose_idle(idle, pad_bytes) }
    }

    unsafe fn give_back(&self, class: usize, batches: *mut FreeBlock, loose: *mut FreeBlock, loose_len: usize) {
        let mut batches_tail = batches;
        let mut loose_tail = loose;
        unsafe {
            if !batches.is_null() {
                while !(*batches_tail).next_batch.is_null() {
                    batches_tail = (*batches_tail).next_batch;
                }
            }
            if !loose.is_null() {
                while !(*loose_tail).next.is_null() {
                    loose_tail = (*loose_tail).next;
                }
            }
            let mut list = self.slots[class].list.lock();
            if !batches.is_null() {
                (*batches_tail).next_batch = list.first_batch;
                list.first_batch = batches;
            }
            if !loose.is_null() {
                list.push_loose(loose, loose_tail, loose_len);
            }
        }
    }

    unsafe fn give_back_regrouped(&self, class: usize, regroup: &Regroup) {
        let mut list = self.slots[class].list.lock();
        unsafe {
            if !regroup.batches.is_null() {
                (*regroup.batches_tail).next_batch = list.first_batch;
                list.first_batch = regroup.batches;
            }
            if !regroup.loose.is_null() {
                list.push_loose(regroup.loose, regroup.loose_tail, regroup.loose_len);
            }
        }
    }

    /// Park idle chunks in the pad pool up to `pad_bytes`, unmap the rest.
    unsafe fn dispose_idle(&self, mut idle: *mut u8, pad_bytes: usize) -> usize {
        if pad_bytes != 0 {
            let mut pad = self.pad.lock();
            while !idle.is_null() && pad.bytes() < pad_bytes {
                let next = unsafe { *(idle as *mut *mut u8) };
                unsafe { pad.push(idle) };
                stat_inc!(chunks_padded);
                idle = next;
            }
        }
        let mut released = 0;
        while !idle.is_null() {
            let next = unsafe { *(idle as *mut *mut u8) };
            unsafe { chunk::release(idle) };
            released += CHUNK_SIZE;
            idle = next;
        }
        stat_add!(chunks_released, released / CHUNK_SIZE);
        released
    }
}

fn spans_several_chunks(slot: &CentralSlot) -> bool {
    let min = slot.min_chunk.load(Ordering::Relaxed);
    let max = slot.max_chunk.load(Ordering::Relaxed);
    min != 0 && max - min > CHUNK_SIZE
}

/// Count the blocks of one list; chunks whose count reaches `total` are
/// pushed onto `idle`, linked through their first word.
unsafe fn count_list(
    counts: &mut ChunkCounts<'_>,
    mut block: *mut FreeBlock,
    total: usize,
    idle: &mut *mut u8,
) {
    while !block.is_null() {
        let i = counts.index(block);
        counts.counts[i] += 1;
        if counts.counts[i] as usize == total {
            let base = chunk::chunk_base(block as *const u8);
            unsafe { *(base as *mut *mut u8) = *idle };
            *idle = base;
        }
        block = unsafe { (*block).next };
    }
}

unsafe fn batch_touches_idle(counts: &ChunkCounts<'_>, mut block: *mut FreeBlock, total: usize) -> bool {
    while !block.is_null() {
        if counts.is_idle(block, total) {
            return true;
        }
        block = unsafe { (*block).next };
    }
    false
}
