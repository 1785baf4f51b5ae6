//! System call dispatch.
//!
//! Two ABI subsystems share one software-interrupt vector; each task's ABI
//! tag selects its numbered table. Arguments arrive in registers (`eax` =
//! number, then `ebx`/`ecx`/`edx`/`esi`/`edi`); the return lands in `eax`,
//! negative values being errno. The legacy flavour additionally collapses
//! every negative return to `-1` -- its programs only ever test for that.

mod file;
mod legacy;
mod process;

use crate::arch::x86::context::TrapFrame;
use crate::error::Errno;
use crate::irq::{self, vector};
use crate::sync::IrqLock;
use crate::task::{self, Abi, NUM_ABIS};

/// Upper bound on syscall numbers in either table.
pub const NR_MAX: usize = 384;

/// A syscall handler: full frame access, returns the raw `eax` value.
pub type Handler = fn(&mut TrapFrame) -> isize;

static TABLES: IrqLock<[[Option<Handler>; NR_MAX]; NUM_ABIS]> =
    IrqLock::new([[None; NR_MAX]; NUM_ABIS]);

/// Install one handler in one ABI's table.
pub fn register(abi: Abi, nr: usize, handler: Handler) {
    debug_assert!(nr < NR_MAX);
    TABLES.lock()[abi as usize][nr] = Some(handler);
}

fn syscall_action(frame: &mut TrapFrame) {
    // Syscalls tolerate re-entry; let the timer keep preempting.
    crate::arch::x86::cpu::irq_enable();

    let abi = task::current().abi();
    let nr = frame.eax as usize;

    let handler = if nr < NR_MAX {
        TABLES.lock()[abi as usize][nr]
    } else {
        None
    };

    let mut ret = match handler {
        Some(handler) => handler(frame),
        None => {
            log::warn!("unknown syscall {} (abi {:?})", nr, abi);
            Errno::ENOSYS.sysret()
        }
    };

    // Legacy compatibility shim: callers check for exactly -1.
    if abi == Abi::Legacy && ret < 0 {
        ret = -1;
    }
    frame.eax = ret as u32;
}

/// Wire the syscall vector and populate both tables.
pub fn init() {
    irq::set_action(vector::SYSCALL, syscall_action);

    file::register_all();
    process::register_all();
    legacy::register_all();

    log::info!("syscall tables registered for {} subsystems", NUM_ABIS);
}
