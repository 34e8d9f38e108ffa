//! Returning from `main` with threads still queued runs them to completion
//! before the process exits.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use uthreads::{create, yield_now};

const WORKERS: usize = 3;

static FINISHED: AtomicUsize = AtomicUsize::new(0);

// Registered before the runtime starts, so it runs after the runtime's own
// exit hook.
extern "C" fn verify() {
    let finished = FINISHED.load(Ordering::Acquire);
    if finished != WORKERS {
        eprintln!("return_from_main: {finished} of {WORKERS} threads finished");
        unsafe { libc::_exit(1) };
    }
    println!("test queued_threads_finish_after_main_returns ... ok");
}

fn main() {
    common::watchdog(30);
    unsafe { libc::atexit(verify) };

    for _ in 0..WORKERS {
        create(|| {
            for _ in 0..5 {
                yield_now();
            }
            FINISHED.fetch_add(1, Ordering::AcqRel);
            0
        });
    }
}
