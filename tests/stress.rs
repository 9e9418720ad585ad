//! Multi-threaded stress with corruption detection.
//!
//! Every block is stamped with a pattern derived from a per-block seed and
//! checked again before it is freed. A block handed out twice, or a free-list
//! link written into a live block, breaks the stamp. Sizes cover the pointer
//! class, batched classes, the largest block class and the large path.

use ltalloc::LtAlloc;
use ltalloc::config::{CANARY_SIZE, CHUNK_SIZE, MAX_BLOCK_SIZE, PTR_SIZE};
use std::alloc::{GlobalAlloc, Layout};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[global_allocator]
static GLOBAL: LtAlloc = LtAlloc;

/// xorshift64*, enough to spread sizes and victims reproducibly.
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Rng(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1)
    }

    fn next(&mut self) -> u64 {
        self.0 ^= self.0 >> 12;
        self.0 ^= self.0 << 25;
        self.0 ^= self.0 >> 27;
        self.0.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }

    fn range(&mut self, lo: usize, hi: usize) -> usize {
        lo + self.below(hi - lo + 1)
    }
}

/// Request sizes shared by every thread: mostly small, a tail of mid-size
/// blocks, and a few large mappings.
fn pick_size(rng: &mut Rng) -> usize {
    match rng.below(100) {
        0..=59 => rng.range(1, 128),
        60..=84 => rng.range(129, 4096),
        85..=96 => rng.range(4097, MAX_BLOCK_SIZE),
        _ => rng.range(MAX_BLOCK_SIZE + 1, 4 * CHUNK_SIZE),
    }
}

#[inline]
fn stamp_byte(seed: usize, i: usize) -> u8 {
    (seed.wrapping_add(i).wrapping_mul(0x9E37_79B9) >> 8) as u8
}

fn stamp(ptr: *mut u8, size: usize, seed: usize) {
    for i in 0..size {
        unsafe { *ptr.add(i) = stamp_byte(seed, i) };
    }
}

fn stamped(ptr: *mut u8, size: usize, seed: usize) -> bool {
    (0..size).all(|i| unsafe { *ptr.add(i) } == stamp_byte(seed, i))
}

/// A live block as tracked by the tests; `addr` keeps it `Send`.
#[derive(Clone, Copy)]
struct Block {
    addr: usize,
    size: usize,
    seed: usize,
}

impl Block {
    fn alloc(size: usize, seed: usize) -> Self {
        let layout = Layout::from_size_align(size, 8).unwrap();
        let ptr = unsafe { GLOBAL.alloc(layout) };
        assert!(!ptr.is_null(), "alloc failed for size {size}");
        stamp(ptr, size, seed);
        Block { addr: ptr as usize, size, seed }
    }

    fn ptr(self) -> *mut u8 {
        self.addr as *mut u8
    }

    fn intact(self) -> bool {
        stamped(self.ptr(), self.size, self.seed)
    }

    fn free(self) {
        assert!(self.intact(), "block of {} bytes overwritten before free", self.size);
        let layout = Layout::from_size_align(self.size, 8).unwrap();
        unsafe { GLOBAL.dealloc(self.ptr(), layout) };
    }
}

#[test]
fn stress_single_thread_mixed_classes() {
    let mut rng = Rng::new(1);
    let mut live: Vec<Block> = Vec::new();

    for round in 0..40 {
        for k in 0..16 {
            live.push(Block::alloc(pick_size(&mut rng), round * 16 + k));
        }
        for b in &live {
            assert!(b.intact(), "round {round}: block of {} bytes corrupted", b.size);
        }
        // Free from random positions so free lists are rebuilt out of order.
        for _ in 0..live.len() / 2 {
            let victim = rng.below(live.len());
            live.swap_remove(victim).free();
        }
    }
    for b in live {
        b.free();
    }
}

#[test]
fn stress_producer_consumer_pipeline() {
    use std::sync::mpsc;

    // Consumers only ever free: their caches fill from other threads' blocks.
    let pairs = 4;
    let items = 400;
    let mut producers = Vec::new();
    let mut consumers = Vec::new();

    for pair in 0..pairs {
        let (tx, rx) = mpsc::channel::<Block>();
        producers.push(std::thread::spawn(move || {
            let mut rng = Rng::new(100 + pair as u64);
            for i in 0..items {
                tx.send(Block::alloc(pick_size(&mut rng), pair * items + i)).unwrap();
            }
        }));
        consumers.push(std::thread::spawn(move || {
            let mut freed = 0;
            for b in rx {
                b.free();
                freed += 1;
            }
            freed
        }));
    }

    for h in producers {
        h.join().unwrap();
    }
    let total: usize = consumers.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, pairs * items);
}

#[test]
fn stress_seeded_churn_tracks_live_bytes() {
    let threads = 8;
    let ops = 1500;
    let tally = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..threads)
        .map(|tid| {
            let tally = Arc::clone(&tally);
            std::thread::spawn(move || {
                let mut rng = Rng::new(0xC0FFEE + tid as u64);
                let mut live: Vec<Block> = Vec::new();
                for op in 0..ops {
                    if live.is_empty() || rng.below(3) != 0 {
                        let size = pick_size(&mut rng);
                        live.push(Block::alloc(size, tid * ops + op));
                        tally.fetch_add(size, Ordering::Relaxed);
                    } else {
                        let b = live.swap_remove(rng.below(live.len()));
                        tally.fetch_sub(b.size, Ordering::Relaxed);
                        b.free();
                    }
                }
                live
            })
        })
        .collect();

    let live: Vec<Block> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();

    let requested: usize = live.iter().map(|b| b.size).sum();
    assert_eq!(requested, tally.load(Ordering::Relaxed));

    let mut usable_total = 0;
    for b in &live {
        assert!(b.intact());
        let usable = unsafe { ltalloc::usable_size(b.ptr()) };
        assert!(usable >= b.size);
        if b.size + CANARY_SIZE <= MAX_BLOCK_SIZE {
            assert!(usable <= b.size + b.size / 4 + 2 * PTR_SIZE, "size {} usable {usable}", b.size);
        } else {
            assert!(usable < b.size + CHUNK_SIZE, "size {} usable {usable}", b.size);
        }
        usable_total += usable;
    }
    assert!(usable_total >= requested);

    for b in live {
        tally.fetch_sub(b.size, Ordering::Relaxed);
        b.free();
    }
    assert_eq!(tally.load(Ordering::Relaxed), 0);
}

#[test]
fn stress_realloc_keeps_prefix() {
    let mut rng = Rng::new(7);
    for round in 0..200 {
        let small = rng.range(1, 256);
        let b = Block::alloc(small, round);
        let layout = Layout::from_size_align(small, 8).unwrap();

        let grown_size = pick_size(&mut rng).max(small + 1);
        let grown = unsafe { GLOBAL.realloc(b.ptr(), layout, grown_size) };
        assert!(!grown.is_null());
        assert!(stamped(grown, small, round), "round {round}: grow to {grown_size} lost data");

        let grown_layout = Layout::from_size_align(grown_size, 8).unwrap();
        let shrunk = unsafe { GLOBAL.realloc(grown, grown_layout, small) };
        assert_eq!(shrunk, grown, "shrinking keeps the block");
        assert!(stamped(shrunk, small, round));
        unsafe { GLOBAL.dealloc(shrunk, Layout::from_size_align(small, 8).unwrap()) };
    }
}

#[test]
fn stress_squeeze_while_allocating() {
    // Squeezes run against the central cache while other threads keep
    // allocating and freeing through their own caches.
    let workers: Vec<_> = (0..4)
        .map(|tid| {
            std::thread::spawn(move || {
                for round in 0..20 {
                    let size = [24, 200, 3000, 20_000][(tid + round) % 4];
                    let blocks: Vec<_> = (0..300).map(|i| Block::alloc(size, round * 300 + i)).collect();
                    for b in blocks {
                        b.free();
                    }
                    ltalloc::on_thread_exit();
                }
            })
        })
        .collect();

    let squeezer = std::thread::spawn(|| {
        for i in 0..50 {
            ltalloc::squeeze(if i % 2 == 0 { 0 } else { 1 << 20 });
            std::thread::yield_now();
        }
    });

    for h in workers {
        h.join().unwrap();
    }
    squeezer.join().unwrap();
}

#[test]
fn stress_realloc_chain_through_large() {
    // Grow one buffer from a word to well past the block limit and back.
    let mut size = 8;
    let mut ptr = ltalloc::malloc(size);
    stamp(ptr, size, 99);
    while size < 1 << 20 {
        let next = size * 3 / 2 + 1;
        ptr = unsafe { ltalloc::realloc(ptr, next) };
        assert!(!ptr.is_null());
        assert!(stamped(ptr, size, 99), "lost contents growing to {next}");
        stamp(ptr, next, 99);
        size = next;
    }
    let shrunk = unsafe { ltalloc::realloc(ptr, 16) };
    assert_eq!(shrunk, ptr, "shrinking keeps the block");
    assert!(stamped(shrunk, 16, 99));
    unsafe { ltalloc::free(shrunk) };
}
