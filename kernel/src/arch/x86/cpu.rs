//! CPU-level primitives: interrupt flag, TLB, control registers, CPUID.
//!
//! Single-CPU kernel; "interrupts off" is the global lock. Everything that
//! mutates shared state brackets itself with [`save_flags`]/[`restore_flags`]
//! through [`crate::sync::IrqGuard`] rather than calling these directly.

#![allow(clippy::missing_safety_doc)]

/// EFLAGS interrupt-enable bit.
pub const EFLAGS_IF: u32 = 1 << 9;

/// EFLAGS bit 1 is fixed to 1 on every x86.
pub const EFLAGS_BASE: u32 = 1 << 1;

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod imp {
    use core::arch::asm;

    pub fn save_flags() -> u32 {
        let flags: u32;
        // SAFETY: pushfd/pop only moves EFLAGS into a register.
        unsafe {
            asm!("pushfd", "pop {}", out(reg) flags, options(preserves_flags));
        }
        flags
    }

    pub fn restore_flags(flags: u32) {
        // SAFETY: restoring a previously saved EFLAGS value.
        unsafe {
            asm!("push {}", "popfd", in(reg) flags);
        }
    }

    pub fn irq_disable() {
        // SAFETY: cli only clears IF.
        unsafe { x86::irq::disable() };
    }

    pub fn irq_enable() {
        // SAFETY: sti only sets IF.
        unsafe { x86::irq::enable() };
    }

    /// Invalidate a single TLB entry on the current CPU.
    pub fn invlpg(addr: usize) {
        // SAFETY: invlpg on any address is harmless.
        unsafe { x86::tlb::flush(addr) };
    }

    /// Full TLB flush (reload CR3). Global pages survive.
    pub fn flush_tlb() {
        // SAFETY: rewriting CR3 with its current value only flushes the TLB.
        unsafe { x86::tlb::flush_all() };
    }

    /// Physical address of the active page directory.
    pub fn read_cr3() -> usize {
        // SAFETY: reading CR3 has no side effects.
        unsafe { x86::controlregs::cr3() as usize }
    }

    /// Load a new page directory.
    ///
    /// # Safety
    /// `phys` must point at a valid page directory that keeps the kernel
    /// mapped, or the next instruction fetch faults.
    pub unsafe fn write_cr3(phys: usize) {
        // SAFETY: contract forwarded to the caller.
        unsafe { x86::controlregs::cr3_write(phys as u64) };
    }

    /// Enable 4 MiB pages (PSE) and turn paging on.
    ///
    /// # Safety
    /// Must be called exactly once during early boot, with CR3 already
    /// pointing at the initial directory.
    pub unsafe fn enable_paging() {
        // SAFETY: early-boot only, per the function contract.
        unsafe {
            use x86::controlregs::{cr0, cr0_write, cr4, cr4_write, Cr0, Cr4};
            cr4_write(cr4() | Cr4::CR4_ENABLE_PSE);
            cr0_write(cr0() | Cr0::CR0_ENABLE_PAGING);
        }
    }

    pub fn halt() {
        // SAFETY: hlt waits for the next interrupt.
        unsafe { x86::halt() };
    }

    /// Reset the x87/SSE state to power-on defaults (exec, fresh tasks).
    pub fn fpu_init() {
        // SAFETY: finit only reinitializes the coprocessor.
        unsafe { asm!("finit") };
    }

    /// CPUID leaf 1 EDX: the hardware capability bits handed to user space
    /// through the aux vector.
    pub fn hwcap() -> u32 {
        let res = x86::cpuid!(1);
        res.edx
    }
}

// Host build: the logic above is exercised only on bare metal; these stubs
// let the rest of the kernel compile for `cargo test` on the build machine.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod imp {
    pub fn save_flags() -> u32 {
        super::EFLAGS_IF
    }
    pub fn restore_flags(_flags: u32) {}
    pub fn irq_disable() {}
    pub fn irq_enable() {}
    pub fn invlpg(_addr: usize) {}
    pub fn flush_tlb() {}
    pub fn read_cr3() -> usize {
        0
    }
    /// Host stub.
    ///
    /// # Safety
    /// No-op off target.
    pub unsafe fn write_cr3(_phys: usize) {}
    /// Host stub.
    ///
    /// # Safety
    /// No-op off target.
    pub unsafe fn enable_paging() {}
    pub fn halt() {}
    pub fn fpu_init() {}
    pub fn hwcap() -> u32 {
        0
    }
}

pub use imp::*;

/// True when the saved EFLAGS had interrupts enabled.
pub fn flags_had_irq(flags: u32) -> bool {
    flags & EFLAGS_IF != 0
}
