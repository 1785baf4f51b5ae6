//! Register frames and the kernel-stack context switch.
//!
//! Two frame types exist per task:
//!
//! * [`TrapFrame`] is the uniform record the interrupt entry stubs push on
//!   the kernel stack for every trap, IRQ and syscall. Handlers mutate it in
//!   place; `iret` consumes it.
//! * [`Context`] is the callee-saved set the scheduler saves when a task
//!   blocks inside the kernel. Switching tasks is "save my context on my
//!   stack, load yours from your stack" -- a plain stack switch, no
//!   self-raised interrupt involved.

/// Saved register state as pushed by the common interrupt stub.
///
/// Field order mirrors the push sequence in `entry.rs` exactly: segment
/// registers first (lowest addresses), then the `pushal` block, then the
/// vector/error pair, then the hardware `iret` frame. `esp`/`ss` are only
/// valid when the trap came from ring 3.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,

    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// esp as saved by `pushal`; ignored by `popal`.
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,

    pub vector: u32,
    pub error_code: u32,

    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,

    pub esp: u32,
    pub ss: u32,
}

impl TrapFrame {
    /// Did this trap interrupt user mode?
    pub fn from_user(&self) -> bool {
        self.cs & 0x3 == 0x3
    }
}

/// Callee-saved registers captured by [`switch_context`].
///
/// Layout matches the pop order in the switch stub; `eip` is the return
/// address the final `ret` consumes.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub ebp: u32,
    pub eip: u32,
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
core::arch::global_asm!(
    r#"
    .section .text
    .globl switch_context
    .type switch_context, @function
// fn switch_context(old: *mut *mut Context, new: *const Context)
switch_context:
    mov eax, [esp + 4]
    mov edx, [esp + 8]

    push ebp
    push ebx
    push esi
    push edi

    mov [eax], esp
    mov esp, edx

    pop edi
    pop esi
    pop ebx
    pop ebp
    ret
"#
);

#[cfg(all(target_arch = "x86", target_os = "none"))]
extern "C" {
    /// Save the current kernel context into `*old` and resume `new`.
    ///
    /// Returns when somebody switches back to `*old`. Interrupts must be
    /// disabled across the call; the resumed side restores its own flags.
    pub fn switch_context(old: *mut *const Context, new: *const Context);

    /// Discard the current kernel context and `iret` through `frame`.
    ///
    /// Used by `do_exit` (nothing to come back to) and by the clone
    /// trampoline when first entering user mode.
    pub fn resume_frame(frame: *mut TrapFrame) -> !;
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
core::arch::global_asm!(
    r#"
    .section .text
    .globl resume_frame
    .type resume_frame, @function
resume_frame:
    mov esp, [esp + 4]
    jmp isr_return
"#
);

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod host {
    use super::{Context, TrapFrame};

    /// Host stub; context switching only exists on bare metal.
    ///
    /// # Safety
    /// No-op.
    pub unsafe fn switch_context(_old: *mut *const Context, _new: *const Context) {}

    /// Host stub.
    ///
    /// # Safety
    /// Never returns on bare metal; panics on the host.
    pub unsafe fn resume_frame(_frame: *mut TrapFrame) -> ! {
        unreachable!("resume_frame on host")
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub use host::{resume_frame, switch_context};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trapframe_ring_detection() {
        let mut frame = TrapFrame::default();
        frame.cs = 0x08; // kernel code selector
        assert!(!frame.from_user());
        frame.cs = 0x1b; // user code selector, RPL 3
        assert!(frame.from_user());
    }

    #[test]
    fn trapframe_layout() {
        // The asm stubs rely on these offsets.
        assert_eq!(core::mem::offset_of!(TrapFrame, edi), 16);
        assert_eq!(core::mem::offset_of!(TrapFrame, eax), 44);
        assert_eq!(core::mem::offset_of!(TrapFrame, vector), 48);
        assert_eq!(core::mem::offset_of!(TrapFrame, eip), 56);
        assert_eq!(core::mem::offset_of!(TrapFrame, ss), 72);
    }
}
