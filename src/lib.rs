//! User-space threads multiplexed onto a single OS thread.
//!
//! Threads are created with [`create`] or a [`Builder`], run round-robin, and
//! are preempted by a profiling timer. How long a thread runs before it is
//! preempted depends on its priority. Each thread gets its own mmap'ed stack
//! with a guard page; running into the guard terminates only that thread,
//! and its joiner sees [`ExitStatus::StackOverflow`].
//!
//! The runtime starts on first use, on the OS thread that first touches it.
//! Every runtime thread must be created and run from that OS thread.
//!
//! Code running on a runtime thread can be interrupted at any instruction.
//! Allocator calls and other non-reentrant code shared between threads must
//! run inside [`preemption::disable`].

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
compile_error!("uthreads supports Linux on x86_64 and aarch64 only");

pub mod builder;
pub mod config;
pub mod context;
pub mod error;
pub mod mutex;
pub mod preemption;
pub mod priority;
mod scheduler;
pub mod stack_guard;
pub mod sync;
pub mod thread;

pub use builder::Builder;
pub use config::RuntimeConfig;
pub use error::{ThreadError, ThreadResult};
pub use mutex::Mutex;
pub use preemption::PreemptionGuard;
pub use stack_guard::StackInstrumentation;
pub use sync::{
    create, current, exit, get_priority, init, join, set_priority, shutdown, status, yield_now,
};
pub use thread::{ExitStatus, ThreadHandle, ThreadId, ThreadStatus};
