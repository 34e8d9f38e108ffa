//! Runtime configuration.

use crate::priority::Priority;
use crate::stack_guard::StackInstrumentation;
use core::time::Duration;

/// Parameters fixed when the runtime is initialized.
///
/// The defaults match a 4ms clock tick, 64 KiB stacks with a single guard
/// page, and mid-range priority for new threads.
#[derive(Clone, Copy)]
pub struct RuntimeConfig {
    /// Base unit of the timeslice model and period of the preemption timer.
    pub tick: Duration,
    /// Usable stack bytes per thread, rounded up to whole pages.
    pub stack_size: usize,
    /// Bytes of no-access memory below each stack. Zero means one page.
    pub guard_size: usize,
    /// Priority given to threads that do not ask for one.
    pub default_priority: u8,
    /// Optional memory-checker hook told about every stack mapping.
    pub instrumentation: Option<&'static dyn StackInstrumentation>,
    /// Called after the main thread's [`exit`](crate::exit) has drained and
    /// torn down the runtime, just before the process exits. A std program
    /// flushes its buffered output here.
    pub before_exit: Option<fn()>,
}

impl RuntimeConfig {
    pub const DEFAULT_TICK: Duration = Duration::from_millis(4);
    pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn guard_size(mut self, size: usize) -> Self {
        self.guard_size = size;
        self
    }

    /// Sets the priority of new threads; out-of-range values are clamped.
    pub fn default_priority(mut self, priority: u8) -> Self {
        self.default_priority = priority.clamp(Priority::MIN, Priority::MAX);
        self
    }

    pub fn instrumentation(mut self, hook: &'static dyn StackInstrumentation) -> Self {
        self.instrumentation = Some(hook);
        self
    }

    pub fn before_exit(mut self, hook: fn()) -> Self {
        self.before_exit = Some(hook);
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick: Self::DEFAULT_TICK,
            stack_size: Self::DEFAULT_STACK_SIZE,
            guard_size: 0,
            default_priority: Priority::DEFAULT,
            instrumentation: None,
            before_exit: None,
        }
    }
}

impl core::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("tick", &self.tick)
            .field("stack_size", &self.stack_size)
            .field("guard_size", &self.guard_size)
            .field("default_priority", &self.default_priority)
            .field("instrumentation", &self.instrumentation.is_some())
            .field("before_exit", &self.before_exit.is_some())
            .finish()
    }
}
