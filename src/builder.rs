//! Thread builder for configuring thread creation.

use crate::error::ThreadResult;
use crate::sync;
use crate::thread::ThreadHandle;

/// Builder for threads that need something other than the runtime defaults.
///
/// [`create`](crate::create) is `Builder::new().spawn(f)` with allocation
/// failures treated as fatal.
#[derive(Debug, Clone, Copy, Default)]
pub struct Builder {
    priority: Option<u8>,
    stack_size: Option<usize>,
}

impl Builder {
    /// Create a builder that uses the runtime's configured defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread priority.
    ///
    /// # Arguments
    ///
    /// * `priority` - Priority in `1..=10`; checked when the thread is spawned
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the usable stack size in bytes, rounded up to whole pages.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Spawn a thread running `f` with the configured parameters.
    ///
    /// # Returns
    ///
    /// The new thread's handle, or [`ThreadError::InvalidPriority`] if the
    /// requested priority is out of range.
    ///
    /// [`ThreadError::InvalidPriority`]: crate::ThreadError::InvalidPriority
    pub fn spawn<F>(self, f: F) -> ThreadResult<ThreadHandle>
    where
        F: FnOnce() -> usize + 'static,
    {
        sync::spawn(f, self.priority, self.stack_size)
    }
}
