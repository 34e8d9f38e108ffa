//! Thread operations: creation, yielding, joining, exiting and shutdown.
//!
//! Every operation runs with preemption masked from the moment it reads
//! scheduler state until it either returns or hands the CPU to another
//! thread. Code resumed after a switch fetches the scheduler again instead of
//! reusing a reference taken before it.

use crate::config::RuntimeConfig;
use crate::context;
use crate::error::{fatal, ThreadError, ThreadResult};
use crate::preemption;
use crate::priority::Priority;
use crate::scheduler::{self, scheduler, Scheduler, SCHEDULER};
use crate::stack_guard;
use crate::thread::{Entry, ExitStatus, ThreadHandle, ThreadId, ThreadStatus};
use alloc::boxed::Box;

/// Starts the runtime with an explicit configuration. Without this call the
/// first use of any operation starts it with [`RuntimeConfig::default`].
pub fn init(config: RuntimeConfig) -> ThreadResult<()> {
    let _guard = preemption::disable();
    scheduler::start(config).map(|_| ())
}

/// Creates a thread running `f` and queues it behind every runnable thread.
/// Its return value becomes the value seen by [`join`].
///
/// Running out of memory for the stack is fatal.
pub fn create<F>(f: F) -> ThreadHandle
where
    F: FnOnce() -> usize + 'static,
{
    match spawn(f, None, None) {
        Ok(handle) => handle,
        Err(err) => fatal("failed to create thread", Some(err)),
    }
}

pub(crate) fn spawn<F>(
    f: F,
    priority: Option<u8>,
    stack_size: Option<usize>,
) -> ThreadResult<ThreadHandle>
where
    F: FnOnce() -> usize + 'static,
{
    let _guard = preemption::disable();
    let scheduler = scheduler();
    let priority = Priority::new(priority.unwrap_or(scheduler.config().default_priority))?;
    let stack_size = stack_size.unwrap_or(scheduler.config().stack_size);

    let entry: Entry = Box::new(move || run_unmasked(f));
    let id = scheduler
        .spawn(entry, priority, stack_size, trampoline)
        .unwrap_or_else(|err| fatal("failed to allocate thread", Some(err)));
    log::debug!("created thread {} with priority {}", id.get(), priority.value());
    Ok(ThreadHandle::new(id))
}

/// Runs a thread body with preemption enabled. The entry box that holds the
/// body is freed by the caller after this returns, with the mask back on.
fn run_unmasked<F>(f: F) -> usize
where
    F: FnOnce() -> usize,
{
    preemption::unblock();
    let value = f();
    preemption::block();
    value
}

/// First activation of every created thread. Entered with preemption masked.
extern "C" fn trampoline() -> ! {
    if let Err(err) = stack_guard::arm() {
        fatal("failed to arm the stack guard", Some(err));
    }

    let entry = {
        let scheduler = scheduler();
        let id = scheduler.current();
        scheduler.thread_mut(id).ok().and_then(|tcb| tcb.entry.take())
    };

    let value = entry.map_or(0, |entry| entry());
    exit(value)
}

/// Handle of the calling thread.
pub fn current() -> ThreadHandle {
    let _guard = preemption::disable();
    ThreadHandle::new(scheduler().current())
}

/// Gives the CPU to the head of the run queue and goes to the back of it.
/// Returns immediately when no other thread is runnable.
pub fn yield_now() {
    let _guard = preemption::disable();
    let scheduler = scheduler();
    scheduler.reclaim_pending();
    if let Some(next) = scheduler.rotate() {
        switch_to(scheduler, next);
    }
}

/// Forced yield from the preemption handler. Reclaims nothing, because
/// unmapping and freeing are not safe at an arbitrary interruption point.
pub(crate) fn preempt() {
    let _guard = preemption::disable();
    let Some(scheduler) = (unsafe { SCHEDULER.get() }) else {
        return;
    };
    if let Some(next) = scheduler.rotate() {
        switch_to(scheduler, next);
    }
}

/// Two-way switch into `next`; returns once the caller is scheduled again.
fn switch_to(scheduler: &mut Scheduler, next: ThreadId) {
    let switch = scheduler.begin_switch(next);
    preemption::arm(switch.timeslice);
    unsafe { context::switch(switch.from, switch.to) };
}

/// Suspends the caller until someone puts it back on the run queue.
pub(crate) fn block(what: &str) {
    let scheduler = scheduler();
    match scheduler.successor() {
        Some(next) => switch_to(scheduler, next),
        None => fatal(what, Some(ThreadError::Deadlock)),
    }
}

/// Waits for `handle` to finish and returns what it exited with. The
/// finished thread is reclaimed, except for the main thread.
///
/// Fails with [`ThreadError::Deadlock`] when the target is the caller or is
/// itself waiting to join the caller, and with [`ThreadError::AlreadyJoined`]
/// when another thread already joins it.
pub fn join(handle: ThreadHandle) -> ThreadResult<ExitStatus> {
    let _guard = preemption::disable();
    let target = handle.id();
    if let Err(err) = scheduler().register_joiner(target) {
        log::warn!("join on thread {} rejected: {err}", target.get());
        return Err(err);
    }

    while scheduler().thread(target)?.is_running() {
        block("main thread joined a thread that can never finish");
    }

    let status = scheduler().collect(target)?;
    log::debug!("joined thread {}: {status:?}", target.get());
    Ok(status)
}

/// Terminates the calling thread with `value`.
///
/// When the main thread exits, the remaining threads keep running; once none
/// is runnable the runtime is torn down, the configured
/// [`before_exit`](RuntimeConfig::before_exit) hook runs, and the process
/// exits with status 0. That exit bypasses the return from `main`, so
/// buffered output that std would normally flush there is only flushed if
/// the hook does it.
pub fn exit(value: usize) -> ! {
    preemption::block();
    let id = scheduler().current();
    log::debug!("thread {} exiting with {value}", id.get());
    leave(id, ExitStatus::Returned(value))
}

/// Exit path of a thread that hit its stack guard. Runs on the alternate
/// signal stack, so it must not allocate or log.
pub(crate) fn exit_on_overflow(id: ThreadId) -> ! {
    preemption::block();
    leave(id, ExitStatus::StackOverflow)
}

fn leave(id: ThreadId, status: ExitStatus) -> ! {
    let scheduler = scheduler();
    scheduler.adopt(id);
    scheduler.retire(id, status);

    if id == ThreadId::MAIN {
        let before_exit = scheduler.config().before_exit;
        drain();
        scheduler::teardown();
        if let Some(hook) = before_exit {
            hook();
        }
        unsafe { libc::exit(0) }
    }

    // A non-main thread always has a successor: the main thread at worst.
    let Some(next) = scheduler.successor() else {
        unsafe { libc::abort() }
    };
    let switch = scheduler.begin_switch(next);
    preemption::arm(switch.timeslice);
    unsafe { context::restore(switch.to) }
}

/// Runs the other threads until nothing is runnable. Called by the main
/// thread on its way out.
fn drain() {
    loop {
        let scheduler = scheduler();
        let Some(next) = scheduler.successor() else {
            break;
        };
        switch_to(scheduler, next);
    }
}

/// Lets every runnable thread finish, then reclaims all threads and stops
/// preemption. Only the main thread may call this; the runtime starts afresh
/// on the next use.
pub fn shutdown() -> ThreadResult<()> {
    let _guard = preemption::disable();
    let Some(scheduler) = (unsafe { SCHEDULER.get() }) else {
        return Ok(());
    };
    if scheduler.current() != ThreadId::MAIN {
        return Err(ThreadError::NotMainThread);
    }

    log::debug!("shutting down the runtime");
    scheduler.retire(ThreadId::MAIN, ExitStatus::Returned(0));
    drain();
    scheduler::teardown();
    Ok(())
}

/// Registered with `atexit` when the runtime starts, so returning from
/// `main` still runs the queued threads and reclaims everything.
pub(crate) extern "C" fn shutdown_at_exit() {
    if !preemption::on_owner_thread() {
        return;
    }
    if let Err(err) = shutdown() {
        log::debug!("runtime left running at exit: {err}");
    }
}

/// Changes a thread's priority; the new timeslice applies from its next turn.
pub fn set_priority(handle: ThreadHandle, priority: u8) -> ThreadResult<()> {
    let _guard = preemption::disable();
    let tcb = scheduler().thread_mut(handle.id())?;
    tcb.priority.set(priority).inspect_err(|err| {
        log::warn!("thread {}: {err}", handle.id().get());
    })
}

pub fn get_priority(handle: ThreadHandle) -> ThreadResult<u8> {
    let _guard = preemption::disable();
    Ok(scheduler().thread(handle.id())?.priority.value())
}

pub fn status(handle: ThreadHandle) -> ThreadResult<ThreadStatus> {
    let _guard = preemption::disable();
    Ok(scheduler().thread(handle.id())?.status)
}
