//! Preemptive round-robin scheduler.
//!
//! Single CPU. The runqueue is a FIFO of task pointers. `schedule()` is the
//! primitive: requeue the current task if it is still runnable (or if a
//! wake-up raced its decision to sleep), pop the head (idle when empty),
//! switch the address space if the target has one, refresh the TSS kernel
//! stack pointer, and resume the target's saved context with a direct
//! kernel-stack switch.
//!
//! Preemption: the timer tick bumps a counter; once it crosses the
//! threshold, the return-to-user epilogue calls `schedule()`. Inside the
//! kernel scheduling is cooperative -- `schedule()` and the blocking
//! helpers below are the only suspension points.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use super::{KernelStack, Task, TaskPtr, TaskState};
use crate::arch::x86::context::{switch_context, Context};
use crate::arch::x86::gdt;
use crate::error::{Errno, KernelResult};
use crate::sync::{IrqGuard, IrqLock};

static RUNQUEUE: IrqLock<VecDeque<TaskPtr>> = IrqLock::new(VecDeque::new());

/// Tasks reaped by wait, waiting for their stacks to be reclaimed.
static DEAD_LIST: IrqLock<VecDeque<TaskPtr>> = IrqLock::new(VecDeque::new());

/// Per-CPU slot holding the running task.
static CURRENT: AtomicPtr<Task> = AtomicPtr::new(ptr::null_mut());

/// The idle task (the boot context after init hands off).
static IDLE: AtomicPtr<Task> = AtomicPtr::new(ptr::null_mut());

/// Timer ticks accumulated since the last dispatch.
static PREEMPT_TICKS: AtomicU32 = AtomicU32::new(0);

/// Ticks a task may keep the CPU before the return-to-user hook preempts.
const RESCHED_THRESHOLD: u32 = 1;

/// The running task. Panics before `init`; kernel code past early boot may
/// assume a current task exists.
pub fn current() -> &'static Task {
    try_current().expect("no current task")
}

pub fn try_current() -> Option<&'static Task> {
    let ptr = CURRENT.load(Ordering::Acquire);
    // SAFETY: the current task is never reaped while it owns the CPU.
    unsafe { ptr.as_ref() }
}

fn idle_task() -> &'static Task {
    // SAFETY: set once at init, never freed.
    unsafe { IDLE.load(Ordering::Acquire).as_ref().expect("no idle task") }
}

/// Adopt the boot context as the idle task (PID 0) and make it current.
///
/// # Safety
/// `boot_stack_base` must be the base of the running boot stack.
pub unsafe fn init(boot_stack_base: usize) {
    // SAFETY: forwarded contract.
    let kstack = unsafe { KernelStack::adopt(boot_stack_base) };
    let task = super::make_boot_task(kstack);
    task.set_comm("swapper");
    let ptr = super::register_boot_task(task);
    IDLE.store(ptr.as_ptr(), Ordering::Release);
    CURRENT.store(ptr.as_ptr(), Ordering::Release);
}

/// Append to the runqueue unless already present.
fn enqueue(task: TaskPtr) {
    let mut queue = RUNQUEUE.lock();
    if !queue.contains(&task) {
        queue.push_back(task);
    }
}

/// Make a task runnable.
///
/// Waking the current task during the window between "decided to sleep"
/// and its `schedule()` call sets a flag that the next `schedule()`
/// consumes, so the wake-up is never lost.
pub fn wake_up_process(task: &Task) {
    task.set_state(TaskState::Running);
    if ptr::eq(task, current()) {
        task.wake_pending.store(true, Ordering::Release);
        return;
    }
    enqueue(TaskPtr::new(ptr::NonNull::from(task)));
}

/// Put a freshly cloned task on the runqueue.
pub(crate) fn activate_new(task: TaskPtr) {
    enqueue(task);
}

/// Free stacks of reaped tasks. Runs inside `schedule()`, where we know
/// the dead task is off-CPU.
fn reap_dead() {
    loop {
        let task = {
            let mut dead = DEAD_LIST.lock();
            match dead.pop_front() {
                Some(t) => t,
                None => return,
            }
        };
        debug_assert!(!ptr::eq(task.as_ref(), current()));
        // SAFETY: the task was unregistered, is Dead, and cannot be
        // current (it exited through schedule()).
        drop(unsafe { Box::from_raw(task.as_ptr()) });
    }
}

/// Queue a reaped task for stack reclamation.
pub(crate) fn retire(task: TaskPtr) {
    task.as_ref().set_state(TaskState::Dead);
    DEAD_LIST.lock().push_back(task);
}

/// The scheduling primitive.
pub fn schedule() {
    let guard = IrqGuard::new();
    PREEMPT_TICKS.store(0, Ordering::Relaxed);

    let cur = current();
    let idle = idle_task();

    let runnable = cur.state() == TaskState::Running
        || cur.wake_pending.swap(false, Ordering::AcqRel);
    if !ptr::eq(cur, idle) && runnable {
        cur.set_state(TaskState::Running);
        enqueue(TaskPtr::new(ptr::NonNull::from(cur)));
    }

    let next = RUNQUEUE
        .lock()
        .pop_front()
        .map(|t| t.as_ref())
        .unwrap_or(idle);

    if !ptr::eq(next, cur) {
        // Address-space switch only when the target has userspace; kernel
        // threads run fine in whatever directory is live.
        if let Some(mm) = next.mm.lock().as_ref() {
            mm.space.activate();
        }
        gdt::set_kernel_stack(next.kstack_top());
        save_fpu(cur);
        restore_tls(next);

        CURRENT.store(next as *const Task as *mut Task, Ordering::Release);

        // SAFETY: both stacks are live; interrupts are off; `next` was
        // parked by this same mechanism (or by the clone trampoline). The
        // saved stack pointer lands directly in our ctx slot so whoever
        // resumes us later finds it there.
        unsafe {
            switch_context(
                cur.ctx.as_ptr() as *mut *const Context,
                next.saved_context(),
            );
        }
        // Back on this task's stack.
        restore_fpu(cur);
    }

    reap_dead();
    drop(guard);
}

/// Preemption tick from the timer interrupt.
pub fn timer_tick() {
    PREEMPT_TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Return-to-user scheduling point: yield if the task exhausted its slice.
pub fn cond_resched() {
    if PREEMPT_TICKS.load(Ordering::Relaxed) >= RESCHED_THRESHOLD {
        schedule();
    }
}

/// Block until `cond` holds, sleeping interruptibly. Returns `EINTR` when
/// a deliverable signal arrives first.
pub fn wait_event_interruptible(mut cond: impl FnMut() -> bool) -> KernelResult<()> {
    loop {
        let cur = current();
        cur.set_state(TaskState::Interruptible);
        if cond() {
            break;
        }
        if super::signal::signal_pending(cur) {
            cur.set_state(TaskState::Running);
            return Err(Errno::EINTR);
        }
        schedule();
    }
    current().set_state(TaskState::Running);
    Ok(())
}

/// Block until `cond` holds. Reserved for operations that must complete
/// (in-flight hardware state); signals do not interrupt it.
pub fn wait_event_uninterruptible(mut cond: impl FnMut() -> bool) {
    loop {
        let cur = current();
        cur.set_state(TaskState::Uninterruptible);
        if cond() {
            break;
        }
        schedule();
    }
    current().set_state(TaskState::Running);
}

fn save_fpu(task: &Task) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        let mut slot = task.fpu.lock();
        let area = slot.get_or_insert_with(|| Box::new(super::FpuState::zeroed()));
        // SAFETY: fxsave writes 512 bytes to a 16-byte-aligned buffer; the
        // boxed image is exclusively ours under the lock.
        unsafe {
            core::arch::asm!("fxsave [{}]", in(reg) area.0.as_mut_ptr());
        }
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = task;
}

fn restore_fpu(task: &Task) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        let slot = task.fpu.lock();
        // SAFETY: fxrstor from the image fxsave produced; finit otherwise.
        unsafe {
            match slot.as_ref() {
                Some(area) => core::arch::asm!("fxrstor [{}]", in(reg) area.0.as_ptr()),
                None => core::arch::asm!("finit"),
            }
        }
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = task;
}

fn restore_tls(task: &Task) {
    match *task.tls.lock() {
        Some(desc) => gdt::set_tls(desc.base, desc.limit, desc.limit_in_pages),
        None => gdt::clear_tls(),
    }
}
