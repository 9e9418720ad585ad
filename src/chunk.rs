//! Chunks: `CHUNK_SIZE`-aligned regions split into blocks of one size class.
//!
//! A chunk starts with a cache-line aligned header that records its size
//! class, so the class of any block is found by masking the block address.
//! Blocks are packed against the end of the chunk; the unused slack sits
//! between the header and the first block. Because the header occupies offset
//! zero, no block is ever chunk-aligned, which is how `free` tells small
//! blocks from large allocations.
//!
//! The pointer-size class cannot thread a batch link through its blocks, so
//! its chunks use the larger `SmallChunk` header that stores batch heads out
//! of band and links chunks into a list.

use crate::config::{CHUNK_MASK, CHUNK_SIZE, MAX_BLOCKS_IN_BATCH, PTR_SIZE};
use crate::error::AllocError;
use crate::platform;
use crate::size_class::{self, class_to_size};
use crate::sync::SpinMutex;
use crate::{debug_log, stat_inc};
use core::ptr::{self, NonNull};

/// Header at offset zero of every chunk.
#[repr(C, align(64))]
pub struct ChunkHeader {
    pub size_class: u32,
}

/// Batches of the pointer-size class that fit in one chunk header.
pub const SMALL_CHUNK_BATCHES: usize = CHUNK_SIZE / (PTR_SIZE * MAX_BLOCKS_IN_BATCH);

/// Header of a pointer-size class chunk. Starts with the same `size_class`
/// field as `ChunkHeader`.
#[repr(C, align(64))]
pub struct SmallChunk {
    pub size_class: u32,
    pub prev: *mut SmallChunk,
    pub next: *mut SmallChunk,
    pub num_batches: usize,
    pub batches: [*mut FreeBlock; SMALL_CHUNK_BATCHES],
}

/// A free block, linked in place.
///
/// Pointer-size blocks only have room for `next`; `next_batch` is only
/// touched for classes at or above `SMALLEST_BATCHED_CLASS`.
#[repr(C)]
pub struct FreeBlock {
    pub next: *mut FreeBlock,
    pub next_batch: *mut FreeBlock,
}

#[inline]
pub const fn header_size(class: usize) -> usize {
    if size_class::is_pointer_class(class) {
        core::mem::size_of::<SmallChunk>()
    } else {
        core::mem::size_of::<ChunkHeader>()
    }
}

#[inline]
pub const fn blocks_per_chunk(class: usize) -> usize {
    (CHUNK_SIZE - header_size(class)) / class_to_size(class)
}

#[inline]
pub fn chunk_base(ptr: *const u8) -> *mut u8 {
    (ptr as usize & !CHUNK_MASK) as *mut u8
}

/// Size class of the chunk holding `ptr`.
///
/// # Safety
/// `ptr` must point into a live chunk, i.e. it must not be chunk-aligned.
#[inline]
pub unsafe fn class_of(ptr: *const u8) -> usize {
    debug_assert!(ptr as usize & CHUNK_MASK != 0);
    unsafe { (*(chunk_base(ptr) as *const ChunkHeader)).size_class as usize }
}

/// First block of a chunk of `class`.
#[inline]
pub fn first_block(chunk: *mut u8, class: usize) -> *mut u8 {
    chunk.wrapping_add(CHUNK_SIZE - blocks_per_chunk(class) * class_to_size(class))
}

/// The last word of a chunk. While a chunk is partly carved, this word lives
/// in its last (uncarved) block and may hold the carve position of an older
/// chunk that was put on hold.
#[inline]
pub fn tail_link(chunk_end: *mut u8) -> *mut *mut u8 {
    chunk_end.wrapping_sub(PTR_SIZE) as *mut *mut u8
}

/// Link `count` consecutive blocks starting at `first` into a null-terminated
/// list and return its head.
///
/// # Safety
/// The range must belong to the caller and hold `count` blocks of `block_size`.
pub unsafe fn link_blocks(first: *mut u8, block_size: usize, count: usize) -> NonNull<FreeBlock> {
    debug_assert!(count > 0);
    unsafe {
        let mut block = first;
        for _ in 1..count {
            let next = block.add(block_size);
            (*(block as *mut FreeBlock)).next = next as *mut FreeBlock;
            block = next;
        }
        (*(block as *mut FreeBlock)).next = ptr::null_mut();
        NonNull::new_unchecked(first as *mut FreeBlock)
    }
}

/// Idle chunks retained for reuse instead of being unmapped.
/// Linked through their first word.
pub struct PadPool {
    head: *mut u8,
    bytes: usize,
}

unsafe impl Send for PadPool {}

impl PadPool {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            bytes: 0,
        }
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    fn pop(&mut self) -> Option<*mut u8> {
        if self.head.is_null() {
            return None;
        }
        let chunk = self.head;
        self.head = unsafe { *(chunk as *mut *mut u8) };
        self.bytes -= CHUNK_SIZE;
        Some(chunk)
    }

    /// # Safety
    /// `chunk` must be an idle chunk with no live or listed blocks.
    pub unsafe fn push(&mut self, chunk: *mut u8) {
        unsafe { *(chunk as *mut *mut u8) = self.head };
        self.head = chunk;
        self.bytes += CHUNK_SIZE;
    }
}

/// Get an empty chunk: a padded one if available, otherwise a fresh mapping.
/// Must not be called with a central cache lock held.
///
/// # Safety
/// The returned chunk belongs to the caller, who writes its header.
pub unsafe fn obtain(pad: &SpinMutex<PadPool>) -> Result<NonNull<u8>, AllocError> {
    if let Some(chunk) = pad.lock().pop() {
        stat_inc!(chunks_from_pad);
        // A reused chunk must not carry a stale carve link.
        unsafe { *tail_link(chunk.add(CHUNK_SIZE)) = ptr::null_mut() };
        return NonNull::new(chunk).ok_or(AllocError::OutOfMemory);
    }
    let chunk = unsafe { platform::alloc_aligned(CHUNK_SIZE, CHUNK_SIZE) };
    match NonNull::new(chunk) {
        Some(chunk) => {
            stat_inc!(chunks_from_os);
            Ok(chunk)
        }
        None => {
            debug_log!("chunk mapping of {} bytes failed", CHUNK_SIZE);
            Err(AllocError::OutOfMemory)
        }
    }
}

/// Return a chunk to the OS.
///
/// # Safety
/// `chunk` must be idle and must not be referenced by any list.
pub unsafe fn release(chunk: *mut u8) {
    unsafe { platform::page_dealloc(chunk, CHUNK_SIZE) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::{size_to_class, SMALLEST_BATCHED_CLASS};
    use crate::config::MAX_BLOCK_SIZE;

    #[test]
    fn test_header_layout() {
        assert_eq!(core::mem::size_of::<ChunkHeader>(), 64);
        assert_eq!(core::mem::size_of::<SmallChunk>() % 64, 0);
        assert!(core::mem::size_of::<SmallChunk>() < CHUNK_SIZE / 4);
    }

    #[test]
    fn test_pointer_class_batches_fit() {
        let class = size_to_class(PTR_SIZE);
        let blocks = blocks_per_chunk(class);
        assert!(blocks <= SMALL_CHUNK_BATCHES * MAX_BLOCKS_IN_BATCH);
        assert!(blocks > 0);
    }

    #[test]
    fn test_largest_class_fits_a_chunk() {
        let class = size_to_class(MAX_BLOCK_SIZE);
        assert!(class >= SMALLEST_BATCHED_CLASS);
        assert_eq!(blocks_per_chunk(class), 1);
        let chunk = CHUNK_SIZE as *mut u8;
        assert!(first_block(chunk, class) as usize - CHUNK_SIZE >= header_size(class));
    }

    #[test]
    fn test_blocks_never_chunk_aligned() {
        let mut size = 1;
        while size <= MAX_BLOCK_SIZE {
            let class = size_to_class(size);
            let chunk = CHUNK_SIZE as *mut u8;
            let first = first_block(chunk, class) as usize;
            assert!(first - CHUNK_SIZE >= header_size(class), "class {}", class);
            assert_eq!(
                first + blocks_per_chunk(class) * class_to_size(class),
                2 * CHUNK_SIZE
            );
            size = class_to_size(class) + 1;
        }
    }

    #[test]
    fn test_link_blocks() {
        let mut buf = [0usize; 64];
        let base = buf.as_mut_ptr() as *mut u8;
        unsafe {
            let head = link_blocks(base, 4 * PTR_SIZE, 16);
            let mut count = 0;
            let mut cur = head.as_ptr();
            while !cur.is_null() {
                assert_eq!(cur as usize, base as usize + count * 4 * PTR_SIZE);
                count += 1;
                cur = (*cur).next;
            }
            assert_eq!(count, 16);
        }
    }

    #[test]
    fn test_obtain_and_pad_reuse() {
        let pad = SpinMutex::new(PadPool::new());
        unsafe {
            let chunk = obtain(&pad).unwrap().as_ptr();
            assert_eq!(chunk as usize & CHUNK_MASK, 0);
            *tail_link(chunk.add(CHUNK_SIZE)) = 0x1000 as *mut u8;

            pad.lock().push(chunk);
            assert_eq!(pad.lock().bytes(), CHUNK_SIZE);

            let again = obtain(&pad).unwrap().as_ptr();
            assert_eq!(again, chunk);
            assert_eq!(pad.lock().bytes(), 0);
            assert!((*tail_link(again.add(CHUNK_SIZE))).is_null());
            release(again);
        }
    }
}
