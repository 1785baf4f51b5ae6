//! Sleeping mutex with strict FIFO fairness.
//!
//! The queue holds every contender in arrival order; the head owns the
//! lock. Waiters sleep interruptibly (or not), and unlock wakes exactly
//! the next in line. This is the only cross-task synchronisation primitive
//! the core provides beyond the interruptible-sleep idiom itself.

use alloc::collections::VecDeque;
use core::ptr::NonNull;

use crate::error::{Errno, KernelResult};
use crate::task::{sched, signal, TaskPtr, TaskState};

use super::IrqLock;

pub struct Mutex {
    queue: IrqLock<VecDeque<TaskPtr>>,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            queue: IrqLock::new(VecDeque::new()),
        }
    }

    fn enqueue_current(&self) -> TaskPtr {
        let cur = TaskPtr::new(NonNull::from(sched::current()));
        let mut queue = self.queue.lock();
        assert!(
            !queue.contains(&cur),
            "task {} double-locking mutex",
            cur.as_ref().pid()
        );
        queue.push_back(cur);
        cur
    }

    fn at_head(&self, me: TaskPtr) -> bool {
        self.queue.lock().front() == Some(&me)
    }

    /// Acquire; a deliverable signal aborts the wait with `EINTR`.
    pub fn lock_interruptible(&self) -> KernelResult<MutexGuard<'_>> {
        let me = self.enqueue_current();
        let cur = sched::current();

        loop {
            cur.set_state(TaskState::Interruptible);
            if self.at_head(me) {
                break;
            }
            if signal::signal_pending(cur) {
                cur.set_state(TaskState::Running);
                self.queue.lock().retain(|t| *t != me);
                return Err(Errno::EINTR);
            }
            sched::schedule();
        }
        cur.set_state(TaskState::Running);
        Ok(MutexGuard { mutex: self })
    }

    /// Acquire, deaf to signals. For paths holding hardware state that
    /// must complete.
    pub fn lock_uninterruptible(&self) -> MutexGuard<'_> {
        let me = self.enqueue_current();
        let cur = sched::current();

        loop {
            cur.set_state(TaskState::Uninterruptible);
            if self.at_head(me) {
                break;
            }
            sched::schedule();
        }
        cur.set_state(TaskState::Running);
        MutexGuard { mutex: self }
    }

    fn unlock(&self) {
        let next = {
            let mut queue = self.queue.lock();
            let head = queue.pop_front();
            debug_assert_eq!(
                head.map(|t| t.as_ref().pid()),
                Some(sched::current().pid()),
                "mutex unlocked by non-owner"
            );
            queue.front().copied()
        };
        if let Some(next) = next {
            sched::wake_up_process(next.as_ref());
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock ownership token; releases and wakes the next waiter on drop.
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
