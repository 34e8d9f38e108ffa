//! Rough cost of thread creation and context switches.
//!
//! Run with `cargo bench`. Numbers are wall-clock and include the
//! preemption timer firing now and then.

use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use uthreads::{create, join, preemption, shutdown, yield_now};

const THREADS: u32 = 256;
const YIELDS_PER_THREAD: u64 = 10_000;

static YIELDS: AtomicU64 = AtomicU64::new(0);

fn yield_loop() -> usize {
    for _ in 0..YIELDS_PER_THREAD {
        YIELDS.fetch_add(1, Ordering::Relaxed);
        yield_now();
    }
    0
}

fn report(what: &str, total: std::time::Duration, count: u64) {
    let _guard = preemption::disable();
    println!("{what}: {total:?} total, {:?} each", total / count.max(1) as u32);
}

fn main() {
    println!("=== uthreads runtime benchmarks ===");

    let start = Instant::now();
    for _ in 0..THREADS {
        let handle = create(|| black_box(1));
        black_box(join(handle).ok());
    }
    report("create + join", start.elapsed(), THREADS.into());

    let start = Instant::now();
    let first = create(yield_loop);
    let second = create(yield_loop);
    black_box(join(first).ok());
    black_box(join(second).ok());
    report("yield", start.elapsed(), YIELDS.load(Ordering::Relaxed));

    let _ = shutdown();
    println!(
        "ThreadHandle: {} bytes, Mutex: {} bytes",
        std::mem::size_of::<uthreads::ThreadHandle>(),
        std::mem::size_of::<uthreads::Mutex>()
    );
}
