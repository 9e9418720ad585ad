//! Overflow guard: a sentinel written just past the usable part of every
//! allocation and verified when the allocation is freed.
//!
//! Enabled by the `overflow-guard` feature. Without it `CANARY_SIZE` is zero
//! and every function here compiles to nothing.

use crate::config::{Canary, CANARY_SIZE, CANARY_VALUE};
use crate::error::AllocError;
use crate::platform;

/// Write the canary at the end of a `block_size` byte block.
///
/// # Safety
/// `ptr` must be the start of a live block of `block_size` bytes.
#[inline(always)]
pub unsafe fn arm(ptr: *mut u8, block_size: usize) {
    if CANARY_SIZE != 0 {
        unsafe {
            (ptr.add(block_size - CANARY_SIZE) as *mut Canary).write_unaligned(CANARY_VALUE);
        }
    }
}

/// Check the canary at the end of a `block_size` byte block.
///
/// # Safety
/// `ptr` must be the start of a live block of `block_size` bytes.
#[inline(always)]
pub unsafe fn verify(ptr: *mut u8, block_size: usize) -> Result<(), AllocError> {
    if CANARY_SIZE != 0 {
        let found = unsafe { (ptr.add(block_size - CANARY_SIZE) as *const Canary).read_unaligned() };
        if found != CANARY_VALUE {
            return Err(AllocError::CorruptionDetected { addr: ptr as usize });
        }
    }
    Ok(())
}

/// Report a failed check and abort. Unwinding out of an allocator is not an
/// option, and the heap can no longer be trusted.
#[cold]
#[inline(never)]
pub fn corruption(err: AllocError) -> ! {
    #[cfg(feature = "std")]
    std::eprintln!("ltalloc: {}", err);
    #[cfg(not(feature = "std"))]
    let _ = err;
    platform::abort()
}

#[cfg(all(test, feature = "overflow-guard"))]
mod tests {
    use super::*;

    #[test]
    fn test_arm_then_verify() {
        let mut block = [0u8; 64];
        let ptr = block.as_mut_ptr();
        unsafe {
            arm(ptr, 64);
            assert_eq!(verify(ptr, 64), Ok(()));
            *ptr.add(64 - CANARY_SIZE) ^= 0xFF;
            assert_eq!(
                verify(ptr, 64),
                Err(AllocError::CorruptionDetected { addr: ptr as usize })
            );
        }
    }

    #[test]
    fn test_payload_writes_do_not_trip() {
        let mut block = [0u8; 48];
        let ptr = block.as_mut_ptr();
        unsafe {
            arm(ptr, 48);
            core::ptr::write_bytes(ptr, 0xFD, 48 - CANARY_SIZE);
            core::ptr::write_bytes(ptr, 0x00, 48 - CANARY_SIZE);
            assert!(verify(ptr, 48).is_ok());
        }
    }
}
