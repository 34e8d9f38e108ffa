//! Helpers shared by the integration test binaries.
//!
//! Each binary owns the process: the runtime installs process-wide signal
//! handlers and a profiling timer, so these tests run one per process with a
//! plain `main` instead of the libtest harness.

#![allow(dead_code)]

/// Aborts the process with SIGALRM if it is still running after `seconds`.
/// A broken scheduler shows up as a hang, not an assertion.
pub fn watchdog(seconds: u32) {
    unsafe { libc::alarm(seconds) };
}

/// Runs one check and reports it.
///
/// Printing happens with preemption masked. The stdout lock is reentrant per
/// OS thread, so two runtime threads could otherwise both enter it.
pub fn run(name: &str, check: fn()) {
    check();
    let _guard = uthreads::preemption::disable();
    println!("test {name} ... ok");
}

/// Spins for roughly `iterations` loop turns without yielding.
pub fn busy(iterations: usize) {
    for i in 0..iterations {
        std::hint::black_box(i);
    }
}
