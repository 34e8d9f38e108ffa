use crate::context::Context;
use crate::priority::Priority;
use crate::stack_guard::Stack;
use alloc::boxed::Box;
use core::num::NonZeroUsize;

/// Unique identifier for threads. Never reused and never zero; the main
/// thread is always the first one issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(NonZeroUsize);

impl ThreadId {
    pub(crate) const MAIN: ThreadId = ThreadId(NonZeroUsize::MIN);

    pub(crate) fn from_raw(id: usize) -> Option<Self> {
        NonZeroUsize::new(id).map(ThreadId)
    }

    pub fn get(self) -> usize {
        self.0.get()
    }
}

/// Caller-side reference to a thread. Copying it does not keep the thread
/// alive; once the thread has been joined the handle is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle(ThreadId);

impl ThreadHandle {
    pub(crate) fn new(id: ThreadId) -> Self {
        ThreadHandle(id)
    }

    pub fn id(&self) -> ThreadId {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Runnable, running, or blocked.
    Running,
    /// Exited; its stack is still mapped and waits for lazy teardown.
    PendingFree,
    /// Exited and torn down; only the return slot remains for the joiner.
    Freed,
}

/// What a finished thread hands to its joiner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Returned(usize),
    /// The thread ran into its stack guard and was terminated.
    StackOverflow,
}

pub(crate) type Entry = Box<dyn FnOnce() -> usize + 'static>;

pub(crate) struct Tcb {
    pub id: ThreadId,
    pub status: ThreadStatus,
    pub priority: Priority,
    pub context: Option<Context>,
    /// `None` for the main thread, which runs on the OS stack.
    pub stack: Option<Stack>,
    pub entry: Option<Entry>,
    pub joiner: Option<ThreadId>,
    pub exit: Option<ExitStatus>,
}

impl Tcb {
    pub fn main(priority: Priority) -> Self {
        Tcb {
            id: ThreadId::MAIN,
            status: ThreadStatus::Running,
            priority,
            context: Some(Context::empty()),
            stack: None,
            entry: None,
            joiner: None,
            exit: None,
        }
    }

    pub fn new(id: ThreadId, priority: Priority, stack: Stack, context: Context, entry: Entry) -> Self {
        Tcb {
            id,
            status: ThreadStatus::Running,
            priority,
            context: Some(context),
            stack: Some(stack),
            entry: Some(entry),
            joiner: None,
            exit: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ThreadStatus::Running
    }

    pub fn owns_guard(&self, address: usize) -> bool {
        self.stack
            .as_ref()
            .is_some_and(|stack| stack.guard_region().contains(&address))
    }

    /// Drops the context and unmaps the stack. Only valid once nothing can
    /// run on that stack again.
    pub fn release_context(&mut self) {
        debug_assert_eq!(self.status, ThreadStatus::PendingFree);
        self.context = None;
        self.stack = None;
        self.entry = None;
        self.status = ThreadStatus::Freed;
    }
}

impl core::fmt::Debug for Tcb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tcb")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("priority", &self.priority)
            .field("joiner", &self.joiner)
            .field("exit", &self.exit)
            .finish_non_exhaustive()
    }
}
