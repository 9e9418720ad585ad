//! Allocation statistics counters (feature `stats`).
//!
//! Counters are bumped with `Relaxed` ordering through `stat_inc!` and
//! `stat_add!`. They observe the allocator, they never synchronize it.
//!
//! ```ignore
//! let snap = ltalloc::stats::snapshot();
//! println!("chunks released: {}", snap.chunks_released);
//! ```

use core::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident,)*) => {
        pub(crate) struct Stats {
            $(pub $name: AtomicU64,)*
        }

        impl Stats {
            const fn new() -> Self {
                Self {
                    $($name: AtomicU64::new(0),)*
                }
            }
        }

        /// Point-in-time copy of every counter. Each field is read atomically,
        /// the snapshot as a whole is not.
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        pub struct Snapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        /// Load all counters and return a [`Snapshot`].
        pub fn snapshot() -> Snapshot {
            Snapshot {
                $($name: STATS.$name.load(Ordering::Relaxed),)*
            }
        }
    };
}

counters! {
    /// Calls to `malloc` and friends, including zero-size requests.
    alloc_count,
    /// Calls to `free` with a non-null pointer.
    free_count,
    /// Calls to `realloc` that had to move the block.
    realloc_moves,
    /// Sum of requested sizes.
    alloc_bytes,
    /// Small allocations served without leaving the thread cache.
    thread_cache_hits,
    /// Small allocations that had to refill from the central cache.
    thread_cache_misses,
    /// Refills served by a prepared batch.
    central_batch_hits,
    /// Refills served from the loose free list.
    central_loose_hits,
    /// Refills carved from the chunk currently being split.
    chunk_carves,
    /// Chunks mapped from the OS.
    chunks_from_os,
    /// Chunks reused from the pad pool.
    chunks_from_pad,
    /// Allocations above `MAX_BLOCK_SIZE`.
    large_allocs,
    /// Frees of large allocations.
    large_frees,
    /// Squeeze passes run, automatic or explicit.
    squeeze_runs,
    /// Idle chunks returned to the OS by squeeze.
    chunks_released,
    /// Idle chunks parked in the pad pool by squeeze.
    chunks_padded,
    /// OS pages carved into trie nodes.
    trie_pages,
}

pub(crate) static STATS: Stats = Stats::new();
