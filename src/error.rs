use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ThreadError {
    #[error("joining this thread would deadlock")]
    Deadlock,
    #[error("thread already has a joiner")]
    AlreadyJoined,
    #[error("priority {0} is outside 1..=10")]
    InvalidPriority(u8),
    #[error("invalid thread ID provided")]
    InvalidThreadId,
    #[error("mutex has been destroyed")]
    DestroyedMutex,
    #[error("calling thread does not possess the mutex")]
    NotPossessor,
    #[error("mutex still has sleeping waiters")]
    MutexBusy,
    #[error("only the main thread may shut the runtime down")]
    NotMainThread,
    #[error("runtime is already initialized")]
    AlreadyInitialized,
    #[error("failed to map thread stack (errno {0})")]
    StackAllocation(i32),
    #[error("failed to install {0}")]
    SignalSetup(&'static str),
}

pub type ThreadResult<T> = Result<T, ThreadError>;

/// Logs `what` and aborts the process.
///
/// Used for conditions the runtime cannot recover from: exhausted memory,
/// failed signal setup, or a deadlock with nothing left to run.
pub(crate) fn fatal(what: &str, err: Option<ThreadError>) -> ! {
    match err {
        Some(err) => log::error!("{what}: {err}"),
        None => log::error!("{what}"),
    }
    unsafe { libc::abort() }
}
