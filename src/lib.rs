#![no_std]
#![cfg_attr(feature = "nightly", feature(thread_local, allocator_api))]

//! ltalloc: a lightweight size-classed allocator with thread caching.
//!
//! Three tiers:
//! - Thread caches (fast path, no locks): a free list and one parked batch
//!   per size class
//! - Central cache (one spinlock per size class): prepared batches, loose
//!   blocks, and the chunk currently being carved
//! - Chunks and large allocations straight from the OS
//!
//! Every block lives in a chunk aligned to its own size, so the size class of
//! any pointer is read from the chunk header without a lookup. Idle chunks go
//! back to the OS through [`squeeze`].
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: ltalloc::LtAlloc = ltalloc::LtAlloc;
//! ```

#[cfg(any(test, feature = "std"))]
extern crate std;

#[macro_use]
mod macros;

pub mod allocator;
pub mod central_free_list;
pub mod chunk;
pub mod config;
pub mod error;
#[cfg(feature = "ffi")]
pub mod ffi;
mod guard;
pub mod large;
pub mod platform;
mod ptrie;
pub mod size_class;
mod squeeze;
#[cfg(feature = "stats")]
pub mod stats;
pub mod sync;
pub mod thread_cache;

pub use allocator::{
    LtAlloc, aligned_alloc, calloc, free, free_and_zero, malloc, on_thread_exit, realloc, squeeze,
    try_aligned_alloc, try_malloc, usable_size,
};
#[cfg(feature = "overflow-guard")]
pub use allocator::check_canary;
pub use error::AllocError;

// Panic handler for staticlib builds (no_std has no default panic handler).
// Only active when panic="abort" (i.e., the `fast` profile), not during normal checks.
#[cfg(all(feature = "ffi", not(test), not(feature = "std"), panic = "abort"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    crate::platform::abort()
}
