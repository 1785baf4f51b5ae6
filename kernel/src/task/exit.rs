//! Exit, zombie reaping and wait.
//!
//! A task that exits turns Zombie, releases everything it owns except the
//! task object and kernel stack, reparents its children to PID 1, and
//! notifies its parent with SIGCHLD. The parent's wait consumes the status
//! and retires the task; the scheduler reclaims the stack afterwards.

use core::sync::atomic::Ordering;

use crate::error::{Errno, KernelResult};
use crate::sync::IrqGuard;

use super::signal::{self, Disposition, Sig, SigInfo};
use super::{sched, session, Pid, TaskPtr, TaskState};

/// Pack a normal exit: code in the second byte.
pub fn status_exited(code: i32) -> i32 {
    (code & 0xff) << 8
}

/// Pack a killed-by-signal exit: signal number in the low byte.
pub fn status_signaled(sig: Sig) -> i32 {
    sig.number() as i32
}

pub fn status_is_signaled(status: i32) -> bool {
    status & 0x7f != 0
}

/// The legacy ABI's view of a wait status: 256 when killed by a signal,
/// the plain exit code otherwise.
pub fn legacy_status(status: i32) -> i32 {
    if status_is_signaled(status) {
        256
    } else {
        (status >> 8) & 0xff
    }
}

/// Normal exit with a code.
pub fn do_exit(code: i32) -> ! {
    do_exit_status(status_exited(code))
}

/// Exit because a signal terminated the task.
pub fn do_exit_signal(sig: Sig) -> ! {
    do_exit_status(status_signaled(sig))
}

fn do_exit_status(status: i32) -> ! {
    let cur = sched::current();
    if cur.pid() == 1 {
        panic!("attempted to kill init (status {:#x})", status);
    }
    cur.exit_status.store(status, Ordering::Release);
    cur.set_state(TaskState::Zombie);

    // The TTY may hold videomem aliases into our address space.
    crate::fs::tty::exit_vidmaps(cur.pid());

    // Release owned references; each drop runs the subsystem finalizer
    // when the count crosses zero.
    *cur.cwd.lock() = None;
    *cur.exe.lock() = None;
    session::put_session(cur);
    *cur.files.lock() = None;
    *cur.mm.lock() = None;
    *cur.fpu.lock() = None;

    // Reparent children to init.
    let pid = cur.pid();
    super::for_each_task(|task| {
        if task.ppid() == pid {
            task.ppid.store(1, Ordering::Release);
        }
    });

    let ppid = cur.ppid();
    if ppid == 0 {
        // Kernel thread owned by the idle task: nobody waits, self-reap.
        reap(TaskPtr::new(core::ptr::NonNull::from(cur)));
    } else if let Ok(parent) = super::get_task(ppid) {
        let parent = parent.as_ref();
        let chld_ignored =
            parent.sigactions.lock().get(Sig::CHLD).disposition == Disposition::Ignore;
        if chld_ignored {
            // Parent opted out of wait: no notification, immediate reap.
            reap(TaskPtr::new(core::ptr::NonNull::from(cur)));
        } else {
            signal::send_sig_info(
                parent,
                SigInfo {
                    sig: Sig::CHLD,
                    pid,
                    status,
                },
            );
        }
    }

    sched::schedule();
    unreachable!("dead task scheduled back in");
}

/// Move a zombie to the dead list and hand back its status.
fn reap(task: TaskPtr) -> i32 {
    let t = task.as_ref();
    let status = t.exit_status.load(Ordering::Acquire);
    super::unregister_task(t.pid());
    sched::retire(task);
    status
}

/// Wait for one specific child. Returns its packed status.
pub fn do_wait(task: TaskPtr) -> KernelResult<i32> {
    let cur = sched::current();
    let target = task.as_ref();

    if target.ppid() != cur.pid() {
        return Err(Errno::ECHILD);
    }
    if target.state() == TaskState::Zombie {
        return Ok(reap(task));
    }

    // Make sure SIGCHLD is observable while we sleep, even if the caller
    // ignores it: park the ignore disposition and restore it after.
    let actions = cur.sigactions.lock().clone();
    let old_action = actions.set(Sig::CHLD, signal::SigAction::default());

    let res = loop {
        cur.set_state(TaskState::Interruptible);
        sched::schedule();
        cur.set_state(TaskState::Running);

        let mut pending = cur.pending.lock();
        if pending.deliverable_mask() == 0 {
            continue;
        }
        if pending.is_pending(Sig::CHLD) && target.state() == TaskState::Zombie {
            pending.take(Sig::CHLD);
            drop(pending);
            break Ok(reap(task));
        }
        break Err(Errno::EINTR);
    };

    actions.set(Sig::CHLD, old_action);
    res
}

/// Wait for any child (optionally restricted to a process group).
///
/// `block == false` gives WNOHANG semantics: `Ok((0, 0))` when children
/// exist but none is ready.
pub fn do_waitpg(pgid: Pid, block: bool) -> KernelResult<(Pid, i32)> {
    let cur = sched::current();

    loop {
        let mut zombie: Option<TaskPtr> = None;
        let mut has_child = false;
        {
            let _guard = IrqGuard::new();
            super::for_each_task(|task| {
                if task.ppid() == cur.pid() && (pgid == 0 || task.pgid() == pgid) {
                    has_child = true;
                    if task.state() == TaskState::Zombie && zombie.is_none() {
                        zombie = Some(TaskPtr::new(core::ptr::NonNull::from(task)));
                    }
                }
            });
        }

        if let Some(task) = zombie {
            let pid = task.as_ref().pid();
            return Ok((pid, reap(task)));
        }
        if !has_child {
            return Err(Errno::ECHILD);
        }
        if !block {
            return Ok((0, 0));
        }

        let actions = cur.sigactions.lock().clone();
        let old_action = actions.set(Sig::CHLD, signal::SigAction::default());

        let res = loop {
            cur.set_state(TaskState::Interruptible);
            sched::schedule();
            cur.set_state(TaskState::Running);

            let mut pending = cur.pending.lock();
            if pending.deliverable_mask() == 0 {
                continue;
            }
            if pending.is_pending(Sig::CHLD) {
                pending.take(Sig::CHLD);
                break Ok(());
            }
            break Err(Errno::EINTR);
        };

        actions.set(Sig::CHLD, old_action);
        res?;
        // Loop back and pick up the zombie.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_packing() {
        let exited = status_exited(42);
        assert_eq!(exited, 42 << 8);
        assert!(!status_is_signaled(exited));
        assert_eq!(legacy_status(exited), 42);

        let killed = status_signaled(Sig::KILL);
        assert!(status_is_signaled(killed));
        assert_eq!(killed & 0xff, 9);
        assert_eq!(legacy_status(killed), 256);
    }

    #[test]
    fn exit_code_truncates_to_byte() {
        assert_eq!(status_exited(0x1ff), 0xff00);
        assert_eq!(legacy_status(status_exited(0x1ff)), 0xff);
    }
}
