use ltalloc::LtAlloc;
use std::collections::HashMap;
use std::time::Instant;

#[global_allocator]
static GLOBAL: LtAlloc = LtAlloc;

fn main() {
    println!("ltalloc demo");
    println!("============\n");

    let boxed = Box::new(42u64);
    println!("Box<u64>:    value = {boxed}");

    let mut v: Vec<i32> = (0..1000).collect();
    v.sort_unstable_by(|a, b| b.cmp(a));
    println!("Vec<i32>:    len = {}, cap = {}, first = {}", v.len(), v.capacity(), v[0]);

    let mut map = HashMap::new();
    for i in 0..500 {
        map.insert(i, format!("val_{i}"));
    }
    println!("HashMap:     len = {}", map.len());

    // Above the block limit: mapped straight from the OS.
    let big = vec![0u8; 1024 * 1024];
    println!(
        "Large alloc: {} bytes, usable = {}",
        big.len(),
        unsafe { ltalloc::usable_size(big.as_ptr()) }
    );
    drop(big);

    println!("\nMulti-threaded workload (8 threads, 100k allocs each):");
    let start = Instant::now();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            std::thread::spawn(|| {
                let mut vecs: Vec<Vec<u64>> = Vec::new();
                for i in 0u64..100_000 {
                    vecs.push(vec![i; 8]);
                    if vecs.len() > 100 {
                        vecs.drain(..50);
                    }
                }
                vecs.len()
            })
        })
        .collect();
    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    println!("  completed in {:?} ({total} live vecs remaining)", start.elapsed());

    // Worker caches were flushed on thread exit; hand the idle chunks back.
    let released = ltalloc::squeeze(0);
    println!("\nsqueeze released {released} bytes");

    #[cfg(feature = "stats")]
    println!("\n{:#?}", ltalloc::stats::snapshot());
}
