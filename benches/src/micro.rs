//! Allocator microbenchmarks.
//!
//! The binary calls the C allocator symbols of whatever heap it is running
//! on, so comparisons are done via LD_PRELOAD against the cdylib built with
//! `--features replace-malloc`:
//!
//!   cargo build --release -p wardmalloc --features replace-malloc
//!   cargo build --release -p wardmalloc-benches
//!   LD_PRELOAD=target/release/libwardmalloc.so target/release/micro
//!   target/release/micro   # baseline: system allocator

use std::hint::black_box;
use std::time::Instant;

extern "C" {
    fn malloc(size: usize) -> *mut u8;
    fn free(ptr: *mut u8);
    fn calloc(nmemb: usize, size: usize) -> *mut u8;
    fn realloc(ptr: *mut u8, size: usize) -> *mut u8;
}

fn ns_per_op(iterations: usize, mut work: impl FnMut()) -> f64 {
    // Warmup pass.
    for _ in 0..iterations / 10 {
        work();
    }
    let start = Instant::now();
    for _ in 0..iterations {
        work();
    }
    start.elapsed().as_nanos() as f64 / iterations as f64
}

fn bench_alloc_free(size: usize, iterations: usize) -> f64 {
    ns_per_op(iterations, || unsafe {
        let ptr = malloc(black_box(size));
        std::ptr::write_bytes(ptr, 0xAB, size.min(64));
        free(black_box(ptr));
    })
}

fn bench_calloc_free(size: usize, iterations: usize) -> f64 {
    ns_per_op(iterations, || unsafe {
        let ptr = calloc(black_box(1), black_box(size));
        free(black_box(ptr));
    })
}

fn bench_realloc_ladder(iterations: usize) -> f64 {
    ns_per_op(iterations, || unsafe {
        let mut ptr = malloc(black_box(16));
        for &size in black_box(&[64usize, 256, 1024, 4096, 20_000]) {
            ptr = realloc(black_box(ptr), size);
        }
        free(black_box(ptr));
    })
}

/// Steady-state churn: a window of live allocations with random-ish
/// replacement, the pattern slab caches are built for.
fn bench_churn(window: usize, size: usize, iterations: usize) -> f64 {
    let mut live = vec![std::ptr::null_mut::<u8>(); window];
    let result = ns_per_op(iterations, || unsafe {
        for (i, slot) in live.iter_mut().enumerate() {
            if !slot.is_null() {
                free(*slot);
            }
            *slot = malloc(black_box(size + (i % 8) * 16));
        }
    });
    for ptr in live {
        if !ptr.is_null() {
            unsafe { free(ptr) };
        }
    }
    result / window as f64
}

fn bench_threaded(num_threads: usize, ops_per_thread: usize, size: usize) -> f64 {
    let start = Instant::now();
    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            std::thread::spawn(move || {
                for _ in 0..ops_per_thread {
                    unsafe {
                        let ptr = malloc(black_box(size));
                        std::ptr::write_bytes(ptr, 0xCD, size.min(16));
                        free(black_box(ptr));
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let total_ops = num_threads * ops_per_thread;
    total_ops as f64 / start.elapsed().as_secs_f64() / 1_000_000.0
}

fn main() {
    let iterations: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(200_000);

    let name = std::env::var("ALLOCATOR_NAME").unwrap_or_else(|_| "default".to_string());
    println!("=== microbenchmarks ({}) ===\n", name);

    println!("--- malloc/free latency (ns/op) ---");
    for &size in &[16, 64, 128, 512, 1024, 4096, 16384, 65536, 262144] {
        println!("  size={:>7}: {:>8.1} ns", size, bench_alloc_free(size, iterations));
    }

    println!("\n--- calloc/free latency (ns/op) ---");
    for &size in &[16, 256, 4096, 65536] {
        println!("  size={:>7}: {:>8.1} ns", size, bench_calloc_free(size, iterations));
    }

    println!("\n--- realloc ladder 16 -> 20000 (ns/ladder) ---");
    println!("  {:>8.1} ns", bench_realloc_ladder(iterations / 20));

    println!("\n--- steady-state churn (ns/op) ---");
    for &(window, size) in &[(64usize, 64usize), (256, 128), (64, 2048)] {
        println!(
            "  window={:>3} size={:>5}: {:>8.1} ns",
            window,
            size,
            bench_churn(window, size, iterations / window)
        );
    }

    println!("\n--- threaded throughput (Mops/sec) ---");
    for &threads in &[1usize, 2, 4, 8] {
        println!(
            "  threads={}: {:>6.2} Mops/sec",
            threads,
            bench_threaded(threads, iterations, 64)
        );
    }
}
