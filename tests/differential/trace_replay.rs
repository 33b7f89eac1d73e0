//! Trace-driven differential testing.
//!
//! Generates deterministic random op traces and replays them against the
//! C allocator symbols of the running process, verifying the core ABI
//! contracts hold. Run once against the system allocator and once with the
//! hardened allocator preloaded; both must pass identically:
//!
//!   cargo build --release -p wardmalloc --features replace-malloc
//!   rustc -O tests/differential/trace_replay.rs -o target/trace_replay
//!   target/trace_replay
//!   LD_PRELOAD=target/release/libwardmalloc.so target/trace_replay

extern "C" {
    fn malloc(size: usize) -> *mut u8;
    fn free(ptr: *mut u8);
    fn calloc(nmemb: usize, size: usize) -> *mut u8;
    fn realloc(ptr: *mut u8, size: usize) -> *mut u8;
}

const MAX_LIVE: usize = 10_000;

#[derive(Clone, Copy)]
enum Op {
    Malloc(usize),
    Free(usize),           // slot hint
    Realloc(usize, usize), // slot hint, new size
    Calloc(usize, usize),  // nmemb, size
}

struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, max: usize) -> usize {
        (self.next() as usize) % max
    }
}

fn generate_trace(seed: u64, count: usize) -> Vec<Op> {
    let mut rng = Rng(seed.wrapping_add(0x9E3779B97F4A7C15));
    let mut ops = Vec::with_capacity(count);
    let mut live = 0usize;

    for _ in 0..count {
        let r = rng.next() % 100;
        if r < 40 || live == 0 {
            let size = match rng.next() % 4 {
                0 => rng.below(16) + 1,
                1 => rng.below(256) + 1,
                2 => rng.below(4096) + 1,
                _ => rng.below(131_072) + 1,
            };
            ops.push(Op::Malloc(size));
            live += 1;
        } else if r < 65 {
            ops.push(Op::Free(rng.below(live)));
            live -= 1;
        } else if r < 85 {
            let new_size = match rng.next() % 3 {
                0 => rng.below(64) + 1,
                1 => rng.below(1024) + 1,
                _ => rng.below(32_768) + 1,
            };
            ops.push(Op::Realloc(rng.below(live), new_size));
        } else {
            ops.push(Op::Calloc(rng.below(100) + 1, rng.below(256) + 1));
            live += 1;
        }

        if live > MAX_LIVE {
            ops.push(Op::Free(rng.below(live)));
            live -= 1;
        }
    }
    ops
}

fn replay_trace(ops: &[Op]) -> (usize, usize) {
    let mut slots: Vec<(*mut u8, usize)> = Vec::new();
    let mut alloc_count = 0usize;
    let mut free_count = 0usize;

    for op in ops {
        match *op {
            Op::Malloc(size) => {
                let ptr = unsafe { malloc(size) };
                assert!(!ptr.is_null(), "malloc({}) returned NULL", size);
                assert_eq!(ptr as usize % 16, 0, "malloc({}) unaligned", size);
                unsafe { std::ptr::write_bytes(ptr, 0xAA, size) };
                slots.push((ptr, size));
                alloc_count += 1;
            }
            Op::Free(hint) => {
                if slots.is_empty() {
                    continue;
                }
                let idx = hint % slots.len();
                let (ptr, size) = slots.swap_remove(idx);
                // Content must still be intact at free time.
                for j in (0..size).step_by(251) {
                    assert_eq!(unsafe { ptr.add(j).read() }, 0xAA, "corrupt before free");
                }
                unsafe { free(ptr) };
                free_count += 1;
            }
            Op::Realloc(hint, new_size) => {
                if slots.is_empty() {
                    continue;
                }
                let idx = hint % slots.len();
                let (old_ptr, old_size) = slots[idx];
                let new_ptr = unsafe { realloc(old_ptr, new_size) };
                assert!(!new_ptr.is_null(), "realloc({}) returned NULL", new_size);
                assert_eq!(new_ptr as usize % 16, 0, "realloc unaligned");
                let check = old_size.min(new_size);
                for j in 0..check {
                    assert_eq!(
                        unsafe { new_ptr.add(j).read() },
                        0xAA,
                        "realloc lost byte {} (old={}, new={})",
                        j,
                        old_size,
                        new_size
                    );
                }
                unsafe { std::ptr::write_bytes(new_ptr, 0xAA, new_size) };
                slots[idx] = (new_ptr, new_size);
            }
            Op::Calloc(nmemb, size) => {
                let ptr = unsafe { calloc(nmemb, size) };
                let total = nmemb * size;
                assert!(!ptr.is_null(), "calloc({}, {}) returned NULL", nmemb, size);
                for j in 0..total.min(4096) {
                    assert_eq!(unsafe { ptr.add(j).read() }, 0, "calloc not zeroed at {}", j);
                }
                unsafe { std::ptr::write_bytes(ptr, 0xAA, total) };
                slots.push((ptr, total));
                alloc_count += 1;
            }
        }
    }

    for (ptr, _) in slots {
        unsafe { free(ptr) };
    }
    (alloc_count, free_count)
}

fn main() {
    let trace_size: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(100_000);

    println!("differential test: {} ops per trace", trace_size);

    for seed in 0..10 {
        let trace = generate_trace(seed, trace_size);
        let (allocs, frees) = replay_trace(&trace);
        println!("  seed {}: OK ({} allocs, {} frees)", seed, allocs, frees);
    }

    println!("all traces passed");
}
