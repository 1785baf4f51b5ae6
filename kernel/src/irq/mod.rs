//! Trap, IRQ and syscall dispatch.
//!
//! A 256-entry action table indexed by vector. The assembly stubs push a
//! uniform [`TrapFrame`] and call [`do_interrupt`], which looks up the
//! action. Hardware IRQs get their EOI sent here, before the handler runs,
//! so a handler that blocks can't wedge the PIC.
//!
//! Every handler starts with interrupts disabled; handlers that tolerate
//! re-entry may re-enable. On the way back to user mode the epilogue runs
//! signal delivery and, when enough timer ticks have accumulated, yields.

pub mod vector {
    //! Vector assignments.

    pub const DIVIDE_ERROR: u32 = 0;
    pub const INVALID_OPCODE: u32 = 6;
    pub const GENERAL_PROTECTION: u32 = 13;
    pub const PAGE_FAULT: u32 = 14;
    pub const X87_FP: u32 = 16;
    pub const ALIGNMENT_CHECK: u32 = 17;
    pub const SIMD_FP: u32 = 19;

    /// First hardware IRQ (PIC line 0).
    pub const IRQ_BASE: u32 = 32;
    /// One past the last hardware IRQ.
    pub const IRQ_END: u32 = 48;

    /// Software interrupt both ABIs use for system calls.
    pub const SYSCALL: u32 = 128;
    /// Reserved for the self-test harness.
    pub const SELF_TEST: u32 = 130;
}

use crate::arch::x86::context::TrapFrame;
use crate::sync::IrqLock;

/// An interrupt action: plain function, no captured state.
pub type Handler = fn(&mut TrapFrame);

static ACTIONS: IrqLock<[Option<Handler>; 256]> = IrqLock::new([None; 256]);

/// Install (or replace) the action for a vector.
pub fn set_action(vec: u32, handler: Handler) {
    ACTIONS.lock()[vec as usize] = Some(handler);
}

/// Remove the action for a vector.
pub fn clear_action(vec: u32) {
    ACTIONS.lock()[vec as usize] = None;
}

/// Install an action for a PIC line and unmask it.
pub fn register_irq(irq: u8, handler: Handler) {
    set_action(vector::IRQ_BASE + irq as u32, handler);
    #[cfg(target_os = "none")]
    crate::arch::x86::pic::enable_irq(irq);
}

/// The single C-ABI dispatcher every stub calls.
///
/// # Safety
/// Called from the assembly stubs with `frame` pointing at the trap frame
/// on the current kernel stack.
#[no_mangle]
pub unsafe extern "C" fn do_interrupt(frame: *mut TrapFrame) {
    // SAFETY: the stub hands us a live frame on this stack.
    let frame = unsafe { &mut *frame };
    let vec = frame.vector;

    let action = ACTIONS.lock()[vec as usize];

    if (vector::IRQ_BASE..vector::IRQ_END).contains(&vec) {
        let irq = (vec - vector::IRQ_BASE) as u8;
        #[cfg(target_os = "none")]
        crate::arch::x86::pic::send_eoi(irq);
        if let Some(handler) = action {
            handler(frame);
        } else {
            log::warn!("spurious IRQ {}", irq);
        }
    } else if let Some(handler) = action {
        handler(frame);
    } else if vec < 32 {
        exception(frame);
    } else {
        log::warn!(
            "unhandled interrupt: vector {:#x}, code {:#x}",
            vec,
            frame.error_code
        );
    }

    // Return-to-user epilogue: surface signals, then maybe preempt.
    if frame.from_user() {
        crate::task::signal::deliver_signals(frame);
        crate::task::sched::cond_resched();
    }
}

/// Default CPU-exception policy: user faults become signals, kernel faults
/// halt the system with a diagnostic.
fn exception(frame: &mut TrapFrame) {
    use crate::task::signal::{self, Sig};

    if frame.vector == vector::PAGE_FAULT {
        let addr = fault_address();
        // Bit 1 of the error code: the access was a write. A write to a
        // CoW-tagged page is the one fault we expect in steady state.
        if frame.error_code & 0x2 != 0 && crate::mm::clone_cow(addr) {
            return;
        }
        if frame.from_user() {
            log::debug!(
                "segfault: pid {} eip {:#x} addr {:#x} code {:#x}",
                crate::task::try_current().map(|t| t.pid()).unwrap_or(0),
                frame.eip,
                addr,
                frame.error_code
            );
            signal::force_sig_current(Sig::SEGV);
            return;
        }
        panic!(
            "kernel page fault at {:#x}, eip {:#x}, code {:#x}",
            addr, frame.eip, frame.error_code
        );
    }

    if frame.from_user() {
        let sig = match frame.vector {
            vector::DIVIDE_ERROR | vector::X87_FP | vector::SIMD_FP => Sig::FPE,
            vector::INVALID_OPCODE => Sig::ILL,
            vector::ALIGNMENT_CHECK => Sig::BUS,
            _ => Sig::SEGV,
        };
        signal::force_sig_current(sig);
        return;
    }

    panic!(
        "unhandled CPU exception {} in kernel, eip {:#x}, code {:#x}",
        frame.vector, frame.eip, frame.error_code
    );
}

/// CR2 on a page fault.
fn fault_address() -> usize {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    // SAFETY: reading CR2 has no side effects.
    unsafe {
        x86::controlregs::cr2()
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    0
}
