use crate::error::{ThreadError, ThreadResult};
use crate::preemption;
use crate::scheduler::scheduler;
use crate::sync;
use crate::thread::ThreadId;
use alloc::collections::VecDeque;
use core::cell::UnsafeCell;

/// A sleeping lock between runtime threads.
///
/// Contended lockers wait in FIFO order without being on the run queue.
/// Unlocking hands the next sleeper the front of the run queue, so it runs
/// before anything already waiting there; it still competes for the lock on
/// wake-up like everyone else.
///
/// The mutex does not guard data of its own. It is meant to live in a
/// `static` or be shared by reference between threads of the same runtime.
pub struct Mutex {
    state: UnsafeCell<State>,
}

enum State {
    Active {
        possessor: Option<ThreadId>,
        sleepers: VecDeque<ThreadId>,
    },
    Destroyed,
}

// All state is touched on the runtime's OS thread with preemption masked.
unsafe impl Sync for Mutex {}

impl Mutex {
    pub const fn new() -> Self {
        Mutex {
            state: UnsafeCell::new(State::Active {
                possessor: None,
                sleepers: VecDeque::new(),
            }),
        }
    }

    /// Acquires the mutex, sleeping while another thread holds it.
    ///
    /// Fails with [`ThreadError::DestroyedMutex`] after
    /// [`destroy`](Self::destroy), and with [`ThreadError::Deadlock`] if the
    /// caller already holds it. A plain sleeping lock would put the holder to
    /// sleep forever in that case.
    pub fn lock(&self) -> ThreadResult<()> {
        let _guard = preemption::disable();
        let me = scheduler().current();

        loop {
            let State::Active { possessor, sleepers } = (unsafe { &mut *self.state.get() }) else {
                return Err(ThreadError::DestroyedMutex);
            };
            // A sleeper can also be resumed as the fallback for a thread that
            // blocked with an empty run queue; it is still listed then.
            sleepers.retain(|id| *id != me);

            match *possessor {
                None => {
                    *possessor = Some(me);
                    return Ok(());
                }
                Some(owner) if owner == me => return Err(ThreadError::Deadlock),
                Some(_) => {
                    sleepers.push_back(me);
                    sync::block("lock on a mutex that can never be released");
                }
            }
        }
    }

    /// Releases the mutex and wakes the longest-sleeping waiter, if any.
    ///
    /// Fails with [`ThreadError::NotPossessor`] when the caller does not hold
    /// it, which includes every unlock after [`destroy`](Self::destroy).
    pub fn unlock(&self) -> ThreadResult<()> {
        let _guard = preemption::disable();
        let scheduler = scheduler();
        let me = scheduler.current();

        match unsafe { &mut *self.state.get() } {
            State::Active { possessor, sleepers } if *possessor == Some(me) => {
                if let Some(next) = sleepers.pop_front() {
                    scheduler.enqueue_front(next);
                }
                *possessor = None;
                Ok(())
            }
            State::Active { .. } | State::Destroyed => Err(ThreadError::NotPossessor),
        }
    }

    /// Retires the mutex. Refused while threads sleep on it; a mutex that is
    /// held but has no sleepers can be destroyed.
    pub fn destroy(&self) -> ThreadResult<()> {
        let _guard = preemption::disable();
        let state = unsafe { &mut *self.state.get() };
        if let State::Active { sleepers, .. } = state {
            if !sleepers.is_empty() {
                return Err(ThreadError::MutexBusy);
            }
        }
        *state = State::Destroyed;
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        let _guard = preemption::disable();
        matches!(
            unsafe { &*self.state.get() },
            State::Active { possessor: Some(_), .. }
        )
    }

    pub fn is_destroyed(&self) -> bool {
        let _guard = preemption::disable();
        matches!(unsafe { &*self.state.get() }, State::Destroyed)
    }

    /// Number of threads sleeping on the mutex.
    pub fn sleepers(&self) -> usize {
        let _guard = preemption::disable();
        match unsafe { &*self.state.get() } {
            State::Active { sleepers, .. } => sleepers.len(),
            State::Destroyed => 0,
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .field("destroyed", &self.is_destroyed())
            .field("sleepers", &self.sleepers())
            .finish()
    }
}
