//! Thread stacks with a hardware guard region, and the fault handler that
//! turns a guard hit into the termination of the offending thread.

use crate::error::{ThreadError, ThreadResult};
use core::ops::Range;
use core::ptr::{self, NonNull};
use spin::Once;

/// Hook for an external memory checker that must be told where thread stacks
/// live (Valgrind's `STACK_REGISTER` is the usual client).
pub trait StackInstrumentation {
    /// Called once a stack is mapped. The returned id is handed back to
    /// [`deregister`](Self::deregister).
    fn register(&self, start: *const u8, end: *const u8) -> usize;
    fn deregister(&self, id: usize);
}

/// An anonymous mapping laid out as `[guard | usable stack]`, growing down
/// towards the guard.
pub struct Stack {
    base: NonNull<u8>,
    len: usize,
    guard: usize,
    registration: Option<(&'static dyn StackInstrumentation, usize)>,
}

impl Stack {
    pub fn new(
        size: usize,
        guard: usize,
        hook: Option<&'static dyn StackInstrumentation>,
    ) -> ThreadResult<Self> {
        let page = page_size();
        let guard = round_up(guard.max(1), page);
        let len = guard + round_up(size.max(1), page);

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ThreadError::StackAllocation(errno()));
        }

        if unsafe { libc::mprotect(base, guard, libc::PROT_NONE) } != 0 {
            let err = errno();
            unsafe { libc::munmap(base, len) };
            return Err(ThreadError::StackAllocation(err));
        }

        let mut stack = Stack {
            base: NonNull::new(base as *mut u8).ok_or(ThreadError::StackAllocation(0))?,
            len,
            guard,
            registration: None,
        };
        if let Some(hook) = hook {
            let usable = stack.usable();
            let id = hook.register(usable.start as *const u8, usable.end as *const u8);
            stack.registration = Some((hook, id));
        }
        Ok(stack)
    }

    /// Upper end of the stack, where a fresh context's first frame goes.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.len) }
    }

    pub fn usable(&self) -> Range<usize> {
        let base = self.base.as_ptr() as usize;
        base + self.guard..base + self.len
    }

    pub fn guard_region(&self) -> Range<usize> {
        let base = self.base.as_ptr() as usize;
        base..base + self.guard
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if let Some((hook, id)) = self.registration.take() {
            hook.deregister(id);
        }
        unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len) };
    }
}

impl core::fmt::Debug for Stack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Stack")
            .field("usable", &self.usable())
            .field("guard", &self.guard_region())
            .finish()
    }
}

const ALT_STACK_SIZE: usize = 64 * 1024;

static FAULT_HANDLER: Once<Result<(), ThreadError>> = Once::new();

/// Makes sure guard hits on the calling OS thread are caught: the fault
/// handler is installed once per process and an alternate signal stack is
/// set up so the handler can run when the faulting stack is exhausted.
pub fn arm() -> ThreadResult<()> {
    (*FAULT_HANDLER.call_once(install_fault_handler))?;
    install_alt_stack()
}

fn install_alt_stack() -> ThreadResult<()> {
    unsafe {
        let mut current: libc::stack_t = core::mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut current) == 0
            && current.ss_flags & libc::SS_DISABLE == 0
        {
            return Ok(());
        }

        // Lives for the rest of the process.
        let memory = libc::mmap(
            ptr::null_mut(),
            ALT_STACK_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if memory == libc::MAP_FAILED {
            return Err(ThreadError::SignalSetup("alternate signal stack"));
        }

        let alt = libc::stack_t {
            ss_sp: memory,
            ss_flags: 0,
            ss_size: ALT_STACK_SIZE,
        };
        if libc::sigaltstack(&alt, ptr::null_mut()) != 0 {
            libc::munmap(memory, ALT_STACK_SIZE);
            return Err(ThreadError::SignalSetup("alternate signal stack"));
        }
    }
    Ok(())
}

fn install_fault_handler() -> Result<(), ThreadError> {
    unsafe {
        let mut action: libc::sigaction = core::mem::zeroed();
        action.sa_sigaction = on_fault as usize;
        // SA_NODEFER: the handler never returns to the faulting thread, so
        // the fault signal must not stay blocked afterwards.
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_NODEFER;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaddset(&mut action.sa_mask, libc::SIGPROF);

        for signal in [libc::SIGSEGV, libc::SIGBUS] {
            if libc::sigaction(signal, &action, ptr::null_mut()) != 0 {
                return Err(ThreadError::SignalSetup("stack fault handler"));
            }
        }
    }
    Ok(())
}

extern "C" fn on_fault(signal: libc::c_int, info: *mut libc::siginfo_t, _ucontext: *mut libc::c_void) {
    let address = unsafe { (*info).si_addr() } as usize;
    if let Some(id) = crate::scheduler::guard_owner(address) {
        crate::sync::exit_on_overflow(id);
    }

    // Not a guard hit. Returning re-executes the faulting access, which now
    // gets the default action.
    unsafe { libc::signal(signal, libc::SIG_DFL) };
}

pub(crate) fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

pub(crate) fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

pub(crate) fn set_errno(value: i32) {
    unsafe { *libc::__errno_location() = value };
}
