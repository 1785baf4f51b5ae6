//! Task model.
//!
//! A task owns a kernel stack, an optional memory map, an optional file
//! table, a signal-action set, a pending-signal set, a working directory
//! and executable reference, an optional session, an ABI tag and an exit
//! status. Shared sub-objects are `Arc`s; cloning a handle bumps the count
//! and dropping the last one runs the subsystem finalizer.
//!
//! The current task lives in a per-CPU slot written by the scheduler; no
//! component derives it from the stack pointer.

pub mod clone;
pub mod exec;
pub mod exit;
pub mod sched;
pub mod session;
pub mod signal;

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicI32, AtomicU16, AtomicU32, AtomicUsize, Ordering};

use spin::Mutex;

use crate::arch::x86::context::{Context, TrapFrame};
use crate::error::{Errno, KernelResult};
use crate::fs::file::File;
use crate::fs::fd_table::FdTable;
use crate::mm::{self, AddressSpace, Gfp, PAGE_SIZE_SMALL};
use crate::sync::IrqLock;

use self::session::Session;
use self::signal::{SigActions, SigPending};

/// Process identifier. 16-bit by design: the frame directory counts sharers
/// in an `i16`, which bounds the number of processes.
pub type Pid = u16;

/// Largest PID ever handed out.
pub const MAX_PID: Pid = 32767;
/// After wrapping, PIDs restart here (1..16 stay reserved for early
/// kernel threads and init).
pub const LOOP_PID: Pid = 16;

/// Kernel stack size, in pages. Power of two.
pub const KSTACK_PAGES: usize = 4;
pub const KSTACK_SIZE: usize = KSTACK_PAGES * PAGE_SIZE_SMALL;

/// Task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TaskState {
    /// On CPU or on the runqueue.
    Running = 0,
    /// Sleeping, wakeable by signals.
    Interruptible = 1,
    /// Sleeping, not signal-wakeable.
    Uninterruptible = 2,
    /// Exited, waiting for the parent to collect the status.
    Zombie = 3,
    /// Reaped, waiting for the scheduler to reclaim the stack.
    Dead = 4,
}

/// Which syscall table and status-encoding convention a task follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Abi {
    /// Rich Linux-like ABI: full auxv, env, packed wait status.
    Linux = 0,
    /// Fixed-layout legacy ABI: flat 4 MiB image, collapsed error returns.
    Legacy = 1,
}

pub const NUM_ABIS: usize = 2;

/// Memory-map record: page directory plus program break.
pub struct Mm {
    pub space: AddressSpace,
    pub brk: AtomicUsize,
}

impl Mm {
    pub fn new(space: AddressSpace) -> Self {
        Self {
            space,
            brk: AtomicUsize::new(0),
        }
    }
}

/// A task's kernel stack: a power-of-two cluster of kernel heap pages.
pub struct KernelStack {
    base: usize,
    owned: bool,
}

impl KernelStack {
    pub fn new() -> KernelResult<Self> {
        let base = mm::alloc_pages(KSTACK_PAGES, 0, Gfp::empty())?;
        Ok(Self { base, owned: true })
    }

    /// Wrap the boot stack, which the loader owns.
    ///
    /// # Safety
    /// `base` must point at `KSTACK_PAGES` mapped pages nobody frees.
    pub unsafe fn adopt(base: usize) -> Self {
        Self { base, owned: false }
    }

    pub fn top(&self) -> usize {
        self.base + KSTACK_SIZE
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        if self.owned {
            mm::free_pages(self.base, KSTACK_PAGES, Gfp::empty());
        }
    }
}

/// The task object.
pub struct Task {
    pid: Pid,
    pub ppid: AtomicU16,
    pub pgid: AtomicU16,
    pub comm: Mutex<String>,

    state: AtomicU32,
    abi: AtomicU32,
    /// Packed wait status (see `exit::status_exited`), valid once Zombie.
    pub exit_status: AtomicI32,

    /// Wake-up arrived between "decided to sleep" and `schedule()`.
    pub wake_pending: core::sync::atomic::AtomicBool,

    kstack: KernelStack,
    /// Saved scheduler context; only the scheduler touches this.
    pub(crate) ctx: AtomicUsize,
    /// Clone trampoline parameters: 0/0 means "resume the entry frame".
    pub(crate) entry_fn: AtomicUsize,
    pub(crate) entry_arg: AtomicUsize,

    pub mm: Mutex<Option<Arc<Mm>>>,
    pub files: Mutex<Option<Arc<FdTable>>>,
    pub cwd: Mutex<Option<Arc<File>>>,
    pub exe: Mutex<Option<Arc<File>>>,
    pub session: Mutex<Option<Arc<Session>>>,
    pub sigactions: Mutex<Arc<SigActions>>,
    pub pending: IrqLock<SigPending>,
    /// Lazily saved FPU/SSE register image.
    pub fpu: IrqLock<Option<Box<FpuState>>>,
    /// User descriptor installed by set_thread_area, restored on switch.
    pub tls: Mutex<Option<UserDesc>>,
}

/// The user-supplied TLS descriptor (set_thread_area).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserDesc {
    pub base: u32,
    pub limit: u32,
    pub limit_in_pages: bool,
}

/// An fxsave image; the instruction demands 16-byte alignment.
#[repr(C, align(16))]
pub struct FpuState(pub [u8; 512]);

impl FpuState {
    pub const fn zeroed() -> Self {
        Self([0; 512])
    }
}

impl Task {
    fn new(pid: Pid, kstack: KernelStack) -> Self {
        Self {
            pid,
            ppid: AtomicU16::new(0),
            pgid: AtomicU16::new(0),
            comm: Mutex::new(String::new()),
            state: AtomicU32::new(TaskState::Running as u32),
            abi: AtomicU32::new(Abi::Linux as u32),
            exit_status: AtomicI32::new(0),
            wake_pending: core::sync::atomic::AtomicBool::new(false),
            kstack,
            ctx: AtomicUsize::new(0),
            entry_fn: AtomicUsize::new(0),
            entry_arg: AtomicUsize::new(0),
            mm: Mutex::new(None),
            files: Mutex::new(None),
            cwd: Mutex::new(None),
            exe: Mutex::new(None),
            session: Mutex::new(None),
            sigactions: Mutex::new(Arc::new(SigActions::new())),
            pending: IrqLock::new(SigPending::new()),
            fpu: IrqLock::new(None),
            tls: Mutex::new(None),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn ppid(&self) -> Pid {
        self.ppid.load(Ordering::Acquire)
    }

    pub fn pgid(&self) -> Pid {
        self.pgid.load(Ordering::Acquire)
    }

    pub fn state(&self) -> TaskState {
        match self.state.load(Ordering::Acquire) {
            0 => TaskState::Running,
            1 => TaskState::Interruptible,
            2 => TaskState::Uninterruptible,
            3 => TaskState::Zombie,
            _ => TaskState::Dead,
        }
    }

    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub fn abi(&self) -> Abi {
        match self.abi.load(Ordering::Acquire) {
            0 => Abi::Linux,
            _ => Abi::Legacy,
        }
    }

    pub fn set_abi(&self, abi: Abi) {
        self.abi.store(abi as u32, Ordering::Release);
    }

    pub fn kstack_top(&self) -> usize {
        self.kstack.top()
    }

    /// The interrupt frame a user-mode task re-enters through; pinned at
    /// the top of the kernel stack.
    pub fn entry_frame(&self) -> *mut TrapFrame {
        (self.kstack_top() - core::mem::size_of::<TrapFrame>()) as *mut TrapFrame
    }

    pub fn set_comm(&self, comm: &str) {
        let mut slot = self.comm.lock();
        slot.clear();
        // Tradition caps the task name at 15 significant bytes.
        let mut end = comm.len().min(15);
        while !comm.is_char_boundary(end) {
            end -= 1;
        }
        slot.push_str(&comm[..end]);
    }

    pub(crate) fn saved_context(&self) -> *const Context {
        self.ctx.load(Ordering::Acquire) as *const Context
    }

    pub(crate) fn set_saved_context(&self, ctx: *const Context) {
        self.ctx.store(ctx as usize, Ordering::Release);
    }
}

/// Shared pointer to a task living in the global table.
///
/// Tasks are freed only after they are Dead *and* off-CPU, by the
/// scheduler's reap pass, which is what makes the bare pointer safe to
/// pass around inside the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPtr(NonNull<Task>);

// SAFETY: see type docs; all mutation goes through atomics or locks.
unsafe impl Send for TaskPtr {}
// SAFETY: as above.
unsafe impl Sync for TaskPtr {}

impl TaskPtr {
    pub fn new(ptr: NonNull<Task>) -> Self {
        Self(ptr)
    }

    pub fn as_ref(&self) -> &'static Task {
        // SAFETY: tasks outlive every TaskPtr; see type docs.
        unsafe { &*self.0.as_ptr() }
    }

    pub fn as_ptr(&self) -> *mut Task {
        self.0.as_ptr()
    }
}

/// Global task table, keyed by PID.
static TASKS: IrqLock<BTreeMap<Pid, TaskPtr>> = IrqLock::new(BTreeMap::new());

static NEXT_PID: AtomicU16 = AtomicU16::new(1);

fn next_pid_candidate() -> Pid {
    // Wrapping increment over 1..=MAX_PID, restarting from LOOP_PID.
    let mut pid;
    loop {
        pid = NEXT_PID.load(Ordering::Relaxed);
        let next = if pid >= MAX_PID { LOOP_PID } else { pid + 1 };
        if NEXT_PID
            .compare_exchange(pid, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return pid;
        }
    }
}

/// Next free PID, skipping values still owned by live tasks.
pub fn alloc_pid() -> Pid {
    loop {
        let pid = next_pid_candidate();
        if !TASKS.lock().contains_key(&pid) {
            return pid;
        }
    }
}

/// Allocate a task with a fresh PID and stack and publish it in the table.
pub(crate) fn register_new_task() -> KernelResult<TaskPtr> {
    let kstack = KernelStack::new()?;
    let pid = alloc_pid();
    let task = Box::new(Task::new(pid, kstack));
    let ptr = TaskPtr::new(NonNull::new(Box::into_raw(task)).ok_or(Errno::ENOMEM)?);
    TASKS.lock().insert(pid, ptr);
    Ok(ptr)
}

/// Publish the hand-built boot task (PID 0, the idle task).
pub(crate) fn register_boot_task(task: Box<Task>) -> TaskPtr {
    let pid = task.pid();
    let ptr = TaskPtr::new(NonNull::new(Box::into_raw(task)).expect("boot task"));
    TASKS.lock().insert(pid, ptr);
    ptr
}

pub(crate) fn make_boot_task(kstack: KernelStack) -> Box<Task> {
    Box::new(Task::new(0, kstack))
}

/// Look up a live task by PID.
pub fn get_task(pid: Pid) -> KernelResult<TaskPtr> {
    TASKS.lock().get(&pid).copied().ok_or(Errno::ESRCH)
}

/// Remove a task from the table (reap path).
pub(crate) fn unregister_task(pid: Pid) -> Option<TaskPtr> {
    TASKS.lock().remove(&pid)
}

/// Run `f` over every live task. The table lock is held; `f` must not
/// sleep.
pub fn for_each_task(mut f: impl FnMut(&Task)) {
    for ptr in TASKS.lock().values() {
        f(ptr.as_ref());
    }
}

/// Count of live tasks matching a predicate.
pub fn count_tasks(mut pred: impl FnMut(&Task) -> bool) -> usize {
    let mut n = 0;
    for_each_task(|t| {
        if pred(t) {
            n += 1;
        }
    });
    n
}

pub use sched::{current, try_current};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_wraps_from_loop_pid() {
        NEXT_PID.store(MAX_PID, Ordering::Relaxed);
        assert_eq!(next_pid_candidate(), MAX_PID);
        assert_eq!(next_pid_candidate(), LOOP_PID);
        assert_eq!(next_pid_candidate(), LOOP_PID + 1);
        NEXT_PID.store(1, Ordering::Relaxed);
    }

    #[test]
    fn state_roundtrip() {
        // A state set is observed exactly, through the atomic encoding.
        let states = [
            TaskState::Running,
            TaskState::Interruptible,
            TaskState::Uninterruptible,
            TaskState::Zombie,
            TaskState::Dead,
        ];
        let cell = AtomicU32::new(0);
        for state in states {
            cell.store(state as u32, Ordering::Relaxed);
            let loaded = match cell.load(Ordering::Relaxed) {
                0 => TaskState::Running,
                1 => TaskState::Interruptible,
                2 => TaskState::Uninterruptible,
                3 => TaskState::Zombie,
                _ => TaskState::Dead,
            };
            assert_eq!(loaded, state);
        }
    }
}
