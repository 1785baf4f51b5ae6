//! Task creation: one primitive behind fork and kernel threads.
//!
//! `do_clone` builds the task object, shares or deep-copies each resource
//! according to the flags, fabricates the initial kernel stack so that the
//! first dispatch lands in [`task_entry_trampoline`], and enqueues the
//! child. The trampoline then either calls the kernel entry function or
//! `iret`s through the prepared user frame.

use alloc::sync::Arc;
use core::mem::size_of;
use core::sync::atomic::Ordering;

use bitflags::bitflags;

use crate::arch::x86::context::{resume_frame, Context, TrapFrame};
use crate::arch::x86::cpu::{self, EFLAGS_BASE, EFLAGS_IF};
use crate::error::KernelResult;
use crate::mm::user;

use super::{exit, sched, signal, Mm, TaskPtr};

bitflags! {
    /// Sharing selectors, numerically compatible with the rich ABI's
    /// clone flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CloneFlags: u32 {
        /// Share the address space instead of CoW-cloning it.
        const VM = 0x0000_0100;
        /// Share the open-file table.
        const FILES = 0x0000_0400;
        /// Share the signal-action table.
        const SIGHAND = 0x0000_0800;
        /// Child gets the cloner's parent, not the cloner.
        const PARENT = 0x0000_8000;
        /// Same thread group (accepted, tracked via PARENT for now).
        const THREAD = 0x0001_0000;
        /// Install a fresh TLS descriptor in the child.
        const SETTLS = 0x0008_0000;
        /// Store the child PID at `parent_tid` in the parent.
        const PARENT_SETTID = 0x0010_0000;
        /// Store the child PID at `child_tid` in the child (accepted).
        const CHILD_SETTID = 0x0100_0000;
    }
}

/// What the child should run.
pub enum CloneEntry {
    /// Kernel thread: call `func(arg)`; its return value becomes the exit
    /// code.
    Kernel { func: fn(usize) -> i32, arg: usize },
    /// User fork: resume this interrupt frame with `eax` zeroed.
    UserFrame(*const TrapFrame),
}

/// Clone the current task.
pub fn do_clone(
    flags: CloneFlags,
    entry: CloneEntry,
    parent_tid: usize,
) -> KernelResult<TaskPtr> {
    let parent = sched::current();
    let child_ptr = super::register_new_task()?;
    let child = child_ptr.as_ref();

    child.set_comm(&parent.comm.lock());
    child.set_abi(parent.abi());
    child.ppid.store(
        if flags.contains(CloneFlags::PARENT) {
            parent.ppid()
        } else {
            parent.pid()
        },
        Ordering::Release,
    );
    child.pgid.store(parent.pgid(), Ordering::Release);

    *child.cwd.lock() = parent.cwd.lock().clone();
    *child.exe.lock() = parent.exe.lock().clone();
    *child.session.lock() = parent.session.lock().clone();

    // Memory map: share or CoW-snapshot.
    if let Some(mm) = parent.mm.lock().as_ref() {
        let child_mm = if flags.contains(CloneFlags::VM) {
            mm.clone()
        } else {
            let space = mm.space.fork_cow()?;
            let new = Mm::new(space);
            new.brk.store(mm.brk.load(Ordering::Acquire), Ordering::Release);
            Arc::new(new)
        };
        *child.mm.lock() = Some(child_mm);
    }

    // File table: share or duplicate every handle.
    if let Some(files) = parent.files.lock().as_ref() {
        let child_files = if flags.contains(CloneFlags::FILES) {
            files.clone()
        } else {
            Arc::new(files.clone_table())
        };
        *child.files.lock() = Some(child_files);
    }

    // Signal actions: share or deep copy. Pending state is always copied.
    {
        let parent_actions = parent.sigactions.lock().clone();
        *child.sigactions.lock() = if flags.contains(CloneFlags::SIGHAND) {
            parent_actions
        } else {
            Arc::new(parent_actions.clone_table())
        };
    }
    signal::copy_pending_for_fork(parent, child);

    *child.tls.lock() = *parent.tls.lock();

    if flags.contains(CloneFlags::PARENT_SETTID) && parent_tid != 0 {
        user::write_user(parent_tid, child.pid() as u32)?;
    }

    // Fabricate the child's first kernel stack: the entry trap frame at
    // the top, a scheduler context just below whose return address is the
    // trampoline.
    match entry {
        CloneEntry::Kernel { func, arg } => {
            child.entry_fn.store(func as usize, Ordering::Release);
            child.entry_arg.store(arg, Ordering::Release);
        }
        CloneEntry::UserFrame(frame) => {
            child.entry_fn.store(0, Ordering::Release);
            // SAFETY: the parent's frame lives on its kernel stack for the
            // duration of this call; the child's slot is exclusively ours.
            unsafe {
                let child_frame = child.entry_frame();
                *child_frame = *frame;
                // Fork returns 0 in the child.
                (*child_frame).eax = 0;
            }
        }
    }

    let ctx_addr = child.entry_frame() as usize - size_of::<Context>();
    let ctx = ctx_addr as *mut Context;
    // SAFETY: inside the freshly allocated kernel stack.
    unsafe {
        *ctx = Context {
            edi: 0,
            esi: 0,
            ebx: 0,
            ebp: 0,
            eip: task_entry_trampoline as usize as u32,
        };
    }
    child.set_saved_context(ctx);

    sched::activate_new(child_ptr);
    Ok(child_ptr)
}

/// Spawn a kernel thread.
pub fn kernel_thread(func: fn(usize) -> i32, arg: usize) -> KernelResult<TaskPtr> {
    do_clone(CloneFlags::empty(), CloneEntry::Kernel { func, arg }, 0)
}

/// First instructions of every new task, entered from `switch_context`
/// with interrupts disabled.
extern "C" fn task_entry_trampoline() -> ! {
    let task = sched::current();
    let func = task.entry_fn.load(Ordering::Acquire);
    let arg = task.entry_arg.load(Ordering::Acquire);

    // No saved FPU image yet; start from power-on defaults rather than
    // whatever the previous task left in the registers.
    if task.fpu.lock().is_none() {
        cpu::fpu_init();
    }

    if func != 0 {
        cpu::irq_enable();
        // SAFETY: entry_fn was stored from a `fn(usize) -> i32` in
        // do_clone and never mutated since.
        let func: fn(usize) -> i32 = unsafe { core::mem::transmute(func) };
        let code = func(arg);
        exit::do_exit(code);
    }

    // User fork: run the signal hook a parent's fork frame may owe, then
    // drop to user mode through the prepared frame.
    let frame = task.entry_frame();
    // SAFETY: do_clone populated this frame; it is ours alone.
    unsafe {
        debug_assert!((*frame).eflags & EFLAGS_IF != 0);
        debug_assert!((*frame).eflags & EFLAGS_BASE != 0);
        crate::task::signal::deliver_signals(&mut *frame);
        resume_frame(frame)
    }
}
