//! Execution contexts and the two ways of transferring control between them.
//!
//! A context is only the saved stack pointer of a suspended thread. Every
//! callee-saved register is pushed onto the thread's own stack before the
//! stack pointer is stored, and popped again after it is loaded, so the same
//! frame layout serves both a thread that suspended itself and a fresh thread
//! whose first frame was written by [`Context::prepare`].

/// Entry point of a fresh context. Must never return.
pub type Trampoline = extern "C" fn() -> !;

#[repr(C)]
#[derive(Debug, Default)]
pub struct Context {
    sp: usize,
}

impl Context {
    /// Context for the thread already running on the OS stack. Its stack
    /// pointer is filled in the first time it switches away.
    pub const fn empty() -> Self {
        Context { sp: 0 }
    }

    /// Writes an initial switch frame at the top of a fresh stack so that
    /// the first switch into this context enters `entry` with an ABI-aligned
    /// stack pointer.
    ///
    /// # Safety
    /// `stack_top` must be the 16-byte aligned upper end of writable memory
    /// with room for at least [`FRAME_SIZE`] + 16 bytes.
    pub unsafe fn prepare(stack_top: *mut u8, entry: Trampoline) -> Self {
        debug_assert_eq!(stack_top as usize % 16, 0);
        let sp = unsafe { arch::initial_frame(stack_top, entry) };
        Context { sp: sp as usize }
    }

    pub fn is_started(&self) -> bool {
        self.sp != 0
    }
}

pub use arch::FRAME_SIZE;

/// Saves the running thread into `from` and resumes `to`. Returns when some
/// other thread switches back into `from`.
///
/// # Safety
/// `to` must hold a context produced by [`Context::prepare`] or by an earlier
/// switch out of a thread whose stack is still mapped. Preemption must be
/// masked.
#[inline(always)]
pub unsafe fn switch(from: *mut Context, to: *const Context) {
    unsafe { arch::switch_context(from, to) }
}

/// Resumes `to` without saving anything. The calling frame is abandoned.
///
/// # Safety
/// As for [`switch`]; additionally nothing may ever resume the caller.
#[inline(always)]
pub unsafe fn restore(to: *const Context) -> ! {
    unsafe { arch::restore_context(to) }
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use super::{Context, Trampoline};

    /// mxcsr + x87 control word, then r15, r14, r13, r12, rbx, rbp.
    pub const FRAME_SIZE: usize = 8 + 6 * 8;

    const MXCSR_DEFAULT: u32 = 0x1F80;
    const FPU_CW_DEFAULT: u16 = 0x037F;

    pub unsafe fn initial_frame(stack_top: *mut u8, entry: Trampoline) -> *mut u8 {
        unsafe {
            let top = stack_top as *mut u64;
            // Fake return address of the trampoline, leaving rsp at 8 mod 16
            // on entry like after a call.
            top.sub(1).write(0);
            top.sub(2).write(entry as usize as u64);
            for slot in 3..=8 {
                top.sub(slot).write(0);
            }
            let control = top.sub(9) as *mut u32;
            control.write(MXCSR_DEFAULT);
            (control.add(1) as *mut u16).write(FPU_CW_DEFAULT);
            top.sub(9) as *mut u8
        }
    }

    #[unsafe(naked)]
    pub unsafe extern "C" fn switch_context(from: *mut Context, to: *const Context) {
        core::arch::naked_asm!(
            "push rbp",
            "push rbx",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "sub rsp, 8",
            "stmxcsr dword ptr [rsp]",
            "fnstcw word ptr [rsp + 4]",
            "mov [rdi], rsp",
            "mov rsp, [rsi]",
            "ldmxcsr dword ptr [rsp]",
            "fldcw word ptr [rsp + 4]",
            "add rsp, 8",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbx",
            "pop rbp",
            "ret",
        );
    }

    #[unsafe(naked)]
    pub unsafe extern "C" fn restore_context(to: *const Context) -> ! {
        core::arch::naked_asm!(
            "mov rsp, [rdi]",
            "ldmxcsr dword ptr [rsp]",
            "fldcw word ptr [rsp + 4]",
            "add rsp, 8",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbx",
            "pop rbp",
            "ret",
        );
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use super::{Context, Trampoline};

    /// x19..x28, fp, lr, then d8..d15.
    pub const FRAME_SIZE: usize = 12 * 8 + 8 * 8;

    pub unsafe fn initial_frame(stack_top: *mut u8, entry: Trampoline) -> *mut u8 {
        unsafe {
            let frame = stack_top.sub(FRAME_SIZE) as *mut u64;
            for slot in 0..FRAME_SIZE / 8 {
                frame.add(slot).write(0);
            }
            // lr sits right after fp in the x29/x30 pair at offset 80.
            frame.add(11).write(entry as usize as u64);
            frame as *mut u8
        }
    }

    #[unsafe(naked)]
    pub unsafe extern "C" fn switch_context(from: *mut Context, to: *const Context) {
        core::arch::naked_asm!(
            "sub sp, sp, #160",
            "stp x19, x20, [sp, #0]",
            "stp x21, x22, [sp, #16]",
            "stp x23, x24, [sp, #32]",
            "stp x25, x26, [sp, #48]",
            "stp x27, x28, [sp, #64]",
            "stp x29, x30, [sp, #80]",
            "stp d8, d9, [sp, #96]",
            "stp d10, d11, [sp, #112]",
            "stp d12, d13, [sp, #128]",
            "stp d14, d15, [sp, #144]",
            "mov x9, sp",
            "str x9, [x0]",
            "ldr x9, [x1]",
            "mov sp, x9",
            "ldp x19, x20, [sp, #0]",
            "ldp x21, x22, [sp, #16]",
            "ldp x23, x24, [sp, #32]",
            "ldp x25, x26, [sp, #48]",
            "ldp x27, x28, [sp, #64]",
            "ldp x29, x30, [sp, #80]",
            "ldp d8, d9, [sp, #96]",
            "ldp d10, d11, [sp, #112]",
            "ldp d12, d13, [sp, #128]",
            "ldp d14, d15, [sp, #144]",
            "add sp, sp, #160",
            "ret",
        );
    }

    #[unsafe(naked)]
    pub unsafe extern "C" fn restore_context(to: *const Context) -> ! {
        core::arch::naked_asm!(
            "ldr x9, [x0]",
            "mov sp, x9",
            "ldp x19, x20, [sp, #0]",
            "ldp x21, x22, [sp, #16]",
            "ldp x23, x24, [sp, #32]",
            "ldp x25, x26, [sp, #48]",
            "ldp x27, x28, [sp, #64]",
            "ldp x29, x30, [sp, #80]",
            "ldp d8, d9, [sp, #96]",
            "ldp d10, d11, [sp, #112]",
            "ldp d12, d13, [sp, #128]",
            "ldp d14, d15, [sp, #144]",
            "add sp, sp, #160",
            "ret",
        );
    }
}
