//! Timer-driven preemption.
//!
//! A profiling interval timer raises `SIGPROF` while the process burns CPU.
//! The handler forces a yield unless the current thread is the only runnable
//! one. Runtime code that touches the run queue, a mutex queue or a thread
//! record holds a [`PreemptionGuard`], which keeps `SIGPROF` blocked for its
//! lifetime; with a single OS thread that is all the synchronization needed.

use crate::error::{ThreadError, ThreadResult};
use crate::stack_guard::{errno, set_errno};
use core::mem::MaybeUninit;
use core::ptr;
use core::time::Duration;
use portable_atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(false);
static OWNER: AtomicUsize = AtomicUsize::new(0);
static TICK_US: AtomicU64 = AtomicU64::new(0);

/// Keeps preemption off until dropped. Guards nest: dropping one only
/// unblocks the timer signal if it was unblocked when the guard was taken.
#[must_use = "preemption is re-enabled as soon as the guard is dropped"]
pub struct PreemptionGuard {
    was_blocked: bool,
}

/// Masks preemption for the current scope.
pub fn disable() -> PreemptionGuard {
    let was_blocked = change_mask(libc::SIG_BLOCK);
    PreemptionGuard { was_blocked }
}

impl Drop for PreemptionGuard {
    fn drop(&mut self) {
        if !self.was_blocked {
            change_mask(libc::SIG_UNBLOCK);
        }
    }
}

/// Masks preemption with no way back, for paths that abandon their stack.
pub(crate) fn block() {
    change_mask(libc::SIG_BLOCK);
}

/// Unmasks preemption unconditionally, for a thread's first activation.
pub(crate) fn unblock() {
    change_mask(libc::SIG_UNBLOCK);
}

/// Applies `how` to SIGPROF and reports whether it was blocked before.
fn change_mask(how: libc::c_int) -> bool {
    unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        let mut previous = MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigaddset(set.as_mut_ptr(), libc::SIGPROF);
        libc::sigemptyset(previous.as_mut_ptr());
        libc::pthread_sigmask(how, set.as_ptr(), previous.as_mut_ptr());
        libc::sigismember(previous.as_ptr(), libc::SIGPROF) == 1
    }
}

/// Installs the handler, binds preemption to the calling OS thread and starts
/// the timer at one tick.
pub(crate) fn start(tick: Duration) -> ThreadResult<()> {
    OWNER.store(unsafe { libc::pthread_self() } as usize, Ordering::Release);
    TICK_US.store(micros(tick), Ordering::Release);

    unsafe {
        let mut action: libc::sigaction = core::mem::zeroed();
        action.sa_sigaction = on_tick as usize;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGPROF, &action, ptr::null_mut()) != 0 {
            return Err(ThreadError::SignalSetup("preemption handler"));
        }
    }

    ENABLED.store(true, Ordering::Release);
    if !set_timer(tick) {
        ENABLED.store(false, Ordering::Release);
        return Err(ThreadError::SignalSetup("preemption timer"));
    }
    Ok(())
}

/// Schedules the next preemption `timeslice` from now; later ones recur every
/// tick unless re-armed at the next switch.
pub(crate) fn arm(timeslice: Duration) {
    if ENABLED.load(Ordering::Acquire) {
        set_timer(timeslice);
    }
}

/// Disarms the timer. A signal already pending is ignored by the handler.
pub(crate) fn stop() {
    ENABLED.store(false, Ordering::Release);
    let zero = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    let timer = libc::itimerval {
        it_interval: zero,
        it_value: zero,
    };
    unsafe { libc::setitimer(libc::ITIMER_PROF, &timer, ptr::null_mut()) };
}

/// Whether the caller runs on the OS thread that owns a live runtime.
pub(crate) fn on_owner_thread() -> bool {
    let owner = OWNER.load(Ordering::Acquire) as libc::pthread_t;
    ENABLED.load(Ordering::Acquire) && unsafe { libc::pthread_equal(libc::pthread_self(), owner) } != 0
}

fn set_timer(first: Duration) -> bool {
    let timer = libc::itimerval {
        it_interval: timeval(TICK_US.load(Ordering::Acquire)),
        it_value: timeval(micros(first).max(1)),
    };
    unsafe { libc::setitimer(libc::ITIMER_PROF, &timer, ptr::null_mut()) == 0 }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

fn timeval(micros: u64) -> libc::timeval {
    libc::timeval {
        tv_sec: (micros / 1_000_000) as libc::time_t,
        tv_usec: (micros % 1_000_000) as libc::suseconds_t,
    }
}

extern "C" fn on_tick(_sig: libc::c_int) {
    let saved_errno = errno();

    if ENABLED.load(Ordering::Acquire) {
        let owner = OWNER.load(Ordering::Acquire) as libc::pthread_t;
        if unsafe { libc::pthread_equal(libc::pthread_self(), owner) } == 0 {
            // The process-wide timer picked another OS thread.
            unsafe { libc::pthread_kill(owner, libc::SIGPROF) };
        } else if crate::scheduler::has_runnable() {
            crate::sync::preempt();
        }
    }

    set_errno(saved_errno);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked() -> bool {
        let guard = disable();
        let was = guard.was_blocked;
        drop(guard);
        was
    }

    #[test]
    fn test_guard_restores_mask() {
        assert!(!blocked());
        {
            let _outer = disable();
            assert!(blocked());
            {
                let _inner = disable();
                assert!(blocked());
            }
            assert!(blocked());
        }
        assert!(!blocked());
    }

    #[test]
    fn test_timeval_split() {
        let value = timeval(4_500_123);
        assert_eq!(value.tv_sec, 4);
        assert_eq!(value.tv_usec, 500_123);
        assert_eq!(micros(Duration::from_millis(12)), 12_000);
    }
}
