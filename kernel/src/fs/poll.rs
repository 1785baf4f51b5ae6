//! Poll infrastructure: event masks and wait queues.
//!
//! A pollable object owns a [`WaitQueue`] and wakes it whenever its
//! readiness changes. A polling task passes a [`PollTable`] into every
//! file's `poll`; drivers register the table on their queues, so the task
//! can sleep and be woken by whichever file turns ready first. Dropping
//! the table unregisters everywhere.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr;

use bitflags::bitflags;

use crate::sync::IrqLock;
use crate::task::{sched, Task, TaskPtr};

bitflags! {
    /// Poll event bits, numerically the classic poll(2) values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: u16 {
        const IN = 0x0001;
        const PRI = 0x0002;
        const OUT = 0x0004;
        const ERR = 0x0008;
        const HUP = 0x0010;
        const NVAL = 0x0020;
    }
}

/// A queue of tasks waiting on one object. Wake-ups clear the queue;
/// sleepers re-register each time around their condition loop.
pub struct WaitQueue {
    tasks: IrqLock<Vec<TaskPtr>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            tasks: IrqLock::new(Vec::new()),
        }
    }

    pub fn register(&self, task: &Task) {
        let ptr = TaskPtr::new(ptr::NonNull::from(task));
        let mut tasks = self.tasks.lock();
        if !tasks.contains(&ptr) {
            tasks.push(ptr);
        }
    }

    pub fn unregister(&self, task: &Task) {
        let ptr = TaskPtr::new(ptr::NonNull::from(task));
        self.tasks.lock().retain(|t| *t != ptr);
    }

    /// Wake every waiter and empty the queue.
    pub fn wake_all(&self) {
        let tasks: Vec<TaskPtr> = core::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            sched::wake_up_process(task.as_ref());
        }
    }

    /// Sleep interruptibly until `cond` holds, staying registered across
    /// each check so a wake between "check" and "sleep" is not lost.
    pub fn wait_interruptible(
        &self,
        mut cond: impl FnMut() -> bool,
    ) -> crate::error::KernelResult<()> {
        let cur = sched::current();
        let res = sched::wait_event_interruptible(|| {
            self.register(cur);
            cond()
        });
        self.unregister(cur);
        res
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects the queues a poll pass touched; keeps the poller registered
/// on all of them until the poll finishes.
pub struct PollTable {
    queues: Vec<Arc<WaitQueue>>,
}

impl PollTable {
    pub fn new() -> Self {
        Self { queues: Vec::new() }
    }

    /// Driver-side hook: called from `FileOps::poll` to say "wake this
    /// poller when the object changes".
    pub fn wait_on(&mut self, queue: &Arc<WaitQueue>) {
        if let Some(task) = sched::try_current() {
            queue.register(task);
        }
        if !self.queues.iter().any(|q| Arc::ptr_eq(q, queue)) {
            self.queues.push(queue.clone());
        }
    }
}

impl Default for PollTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PollTable {
    fn drop(&mut self) {
        if let Some(task) = sched::try_current() {
            for queue in &self.queues {
                queue.unregister(task);
            }
        }
    }
}
