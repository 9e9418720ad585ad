//! Allocator error type.
//!
//! Raw entry points (`malloc`, the C ABI) turn these into a null pointer or a
//! process abort; `try_malloc` and the `Allocator` impl surface them directly.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The OS refused to map more memory, or the request size overflowed.
    #[error("out of memory")]
    OutOfMemory,

    /// An aligned request whose alignment is not a power of two.
    #[error("alignment {align} is not a power of two")]
    InvalidAlignment { align: usize },

    /// The canary past the end of a block was overwritten.
    #[error("heap overflow detected past block at {addr:#x}")]
    CorruptionDetected { addr: usize },

    /// The pointer handed to `free` was never returned by this allocator.
    #[error("free of pointer {addr:#x} not owned by the allocator")]
    MalformedFreeTarget { addr: usize },
}
