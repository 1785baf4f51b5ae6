//! Sessions and process groups.
//!
//! A session carries the leader's PID, the foreground process group, and
//! (optionally) a controlling TTY. Ownership runs one way: the session
//! strongly owns its TTY reference, the TTY points back weakly, and tasks
//! hold their session strongly -- so the task -> session -> TTY chain has
//! no cycle.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU16, Ordering};

use spin::Mutex;

use crate::error::{Errno, KernelResult};
use crate::fs::tty::Tty;

use super::{sched, Pid, Task};

pub struct Session {
    sid: Pid,
    foreground_pgid: AtomicU16,
    pub tty: Mutex<Option<Arc<Tty>>>,
}

impl Session {
    pub fn new(sid: Pid) -> Self {
        Self {
            sid,
            foreground_pgid: AtomicU16::new(sid),
            tty: Mutex::new(None),
        }
    }

    pub fn sid(&self) -> Pid {
        self.sid
    }

    pub fn foreground_pgid(&self) -> Pid {
        self.foreground_pgid.load(Ordering::Acquire)
    }

    pub fn set_foreground_pgid(&self, pgid: Pid) {
        self.foreground_pgid.store(pgid, Ordering::Release);
    }
}

/// `setsid`: start a new session with the caller as leader, unless the
/// caller already leads a process group.
pub fn do_setsid() -> KernelResult<usize> {
    let cur = sched::current();

    let mut leads_group = false;
    super::for_each_task(|task| {
        if task.pgid() == cur.pid() {
            leads_group = true;
        }
    });
    if leads_group {
        return Err(Errno::EPERM);
    }

    let session = Arc::new(Session::new(cur.pid()));
    *cur.session.lock() = Some(session);
    cur.pgid.store(cur.pid(), Ordering::Release);

    Ok(cur.pid() as usize)
}

/// Drop a task's session reference. The TTY back-pointer is weak, so the
/// last drop invalidates it automatically.
pub fn put_session(task: &Task) {
    *task.session.lock() = None;
    task.pgid.store(0, Ordering::Release);
}
