//! Behaviour of the public C-style entry points: malloc, free, realloc,
//! calloc, usable_size, free_and_zero. No global allocator is installed, so
//! only these calls touch ltalloc's heap.

use ltalloc::config::{CHUNK_SIZE, MAX_BLOCK_SIZE, PTR_SIZE};
use ltalloc::{AllocError, calloc, free, free_and_zero, malloc, realloc, usable_size};
use std::ptr;

fn fill(ptr: *mut u8, len: usize, seed: u8) {
    for i in 0..len {
        unsafe { *ptr.add(i) = seed.wrapping_add(i as u8) };
    }
}

fn holds(ptr: *mut u8, len: usize, seed: u8) -> bool {
    (0..len).all(|i| unsafe { *ptr.add(i) } == seed.wrapping_add(i as u8))
}

#[test]
fn malloc_rounds_up_to_the_class_size() {
    for size in [1, 8, 9, 24, 100, 1000, 3000, 40_000, MAX_BLOCK_SIZE] {
        let p = malloc(size);
        assert!(!p.is_null(), "size {size}");
        assert_eq!(p as usize % PTR_SIZE, 0);
        let usable = unsafe { usable_size(p) };
        assert!(usable >= size, "size {size} usable {usable}");
        // Size classes waste at most a quarter, plus word rounding.
        assert!(usable <= size + size / 4 + PTR_SIZE, "size {size} usable {usable}");
        fill(p, usable, 3);
        unsafe { free(p) };
    }
}

#[test]
fn large_requests_are_chunk_aligned() {
    for size in [MAX_BLOCK_SIZE + 1, CHUNK_SIZE, 3 * CHUNK_SIZE + 17, 8 << 20] {
        let p = malloc(size);
        assert!(!p.is_null());
        assert_eq!(p as usize % CHUNK_SIZE, 0, "size {size}");
        let usable = unsafe { usable_size(p) };
        assert!(usable >= size);
        assert!(usable < size + CHUNK_SIZE);
        unsafe {
            *p = 1;
            *p.add(size - 1) = 2;
            free(p);
        }
    }
}

#[test]
fn null_is_accepted_everywhere() {
    unsafe {
        free(ptr::null_mut());
        free_and_zero(ptr::null_mut());
        assert_eq!(usable_size(ptr::null()), 0);
        let p = realloc(ptr::null_mut(), 50);
        assert!(!p.is_null());
        assert!(usable_size(p) >= 50);
        free(p);
    }
}

#[test]
fn realloc_keeps_block_when_it_fits() {
    unsafe {
        let p = malloc(100);
        fill(p, 100, 7);
        assert_eq!(realloc(p, 10), p);
        assert_eq!(realloc(p, usable_size(p)), p);
        assert!(holds(p, 10, 7));
        free(p);
    }
}

#[test]
fn realloc_moves_and_copies_when_growing() {
    unsafe {
        let mut p = malloc(16);
        let mut len = 16;
        fill(p, len, 11);
        for next in [64, 500, 4000, 30_000, MAX_BLOCK_SIZE + 5, 4 * CHUNK_SIZE] {
            let q = realloc(p, next);
            assert!(!q.is_null());
            assert!(holds(q, len, 11), "contents lost growing to {next}");
            fill(q, next, 11);
            p = q;
            len = next;
        }
        free(p);
    }
}

#[test]
fn realloc_to_zero_frees() {
    unsafe {
        let p = malloc(300);
        assert!(realloc(p, 0).is_null());
        let big = malloc(2 * CHUNK_SIZE);
        assert!(realloc(big, 0).is_null());
    }
}

#[test]
fn realloc_failure_leaves_block_intact() {
    unsafe {
        let p = malloc(64);
        fill(p, 64, 5);
        assert!(realloc(p, usize::MAX - 4096).is_null());
        assert!(holds(p, 64, 5));
        free(p);
    }
}

#[test]
fn calloc_returns_zeroed_memory() {
    // Dirty a few blocks first so recycled memory is not already zero.
    let dirty: Vec<_> = (0..64).map(|_| malloc(200)).collect();
    for &p in &dirty {
        unsafe { ptr::write_bytes(p, 0xEE, 200) };
    }
    for p in dirty {
        unsafe { free(p) };
    }
    for _ in 0..64 {
        let p = calloc(8, 25);
        assert!(unsafe { std::slice::from_raw_parts(p, 200) }.iter().all(|&b| b == 0));
        unsafe { free(p) };
    }

    let big = calloc(MAX_BLOCK_SIZE, 2);
    assert!(unsafe { std::slice::from_raw_parts(big, 2 * MAX_BLOCK_SIZE) }.iter().all(|&b| b == 0));
    unsafe { free(big) };

    assert!(calloc(usize::MAX / 2, 3).is_null());
    let zero = calloc(0, 10);
    assert!(!zero.is_null());
    unsafe { free(zero) };
}

#[test]
fn free_and_zero_handles_both_paths() {
    unsafe {
        let small = malloc(128);
        ptr::write_bytes(small, 0xAB, 128);
        free_and_zero(small);

        let large = malloc(MAX_BLOCK_SIZE * 2);
        ptr::write_bytes(large, 0xAB, MAX_BLOCK_SIZE * 2);
        free_and_zero(large);
    }
}

#[test]
fn try_malloc_reports_overflow() {
    assert_eq!(ltalloc::try_malloc(usize::MAX), Err(AllocError::OutOfMemory));
    assert!(malloc(usize::MAX).is_null());
}

#[test]
fn blocks_cross_threads() {
    // Blocks allocated on one thread and freed on another end up in the
    // freeing thread's cache and are handed out again from there.
    let ptrs: Vec<usize> = std::thread::spawn(|| {
        (0..1000).map(|i| malloc(32 + i % 200) as usize).collect()
    })
    .join()
    .unwrap();

    std::thread::spawn(move || {
        for &p in &ptrs {
            unsafe { free(p as *mut u8) };
        }
        let again: Vec<_> = (0..1000).map(|i| malloc(32 + i % 200)).collect();
        for &p in &again {
            fill(p, 32, 1);
        }
        for p in again {
            unsafe { free(p) };
        }
    })
    .join()
    .unwrap();
}

#[test]
fn many_threads_exit_cleanly() {
    let handles: Vec<_> = (0..16)
        .map(|t| {
            std::thread::spawn(move || {
                let mut live = Vec::new();
                for i in 0..2000 {
                    live.push(malloc(8 + (i * 37 + t) % 1500));
                    if live.len() > 100 {
                        unsafe { free(live.swap_remove(i % live.len())) };
                    }
                }
                for p in live {
                    unsafe { free(p) };
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

#[cfg(feature = "stats")]
#[test]
fn stats_count_calls() {
    let before = ltalloc::stats::snapshot();
    let p = malloc(10);
    let big = malloc(MAX_BLOCK_SIZE + 1);
    unsafe {
        free(p);
        free(big);
    }
    let after = ltalloc::stats::snapshot();
    assert!(after.alloc_count >= before.alloc_count + 2);
    assert!(after.free_count >= before.free_count + 2);
    assert!(after.large_allocs > before.large_allocs);
    assert!(after.large_frees > before.large_frees);
}
