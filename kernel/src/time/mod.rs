//! Timekeeping: the tick counter, the sleep queue, and the wall clock
//! surface the RTC collaborator feeds.
//!
//! The timer IRQ does three things per tick: bump the monotonic counter,
//! charge the scheduler's preemption budget, and wake expired sleepers.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::arch::x86::context::TrapFrame;
use crate::arch::x86::TICK_HZ;
use crate::error::{Errno, KernelResult};
use crate::sync::IrqLock;
use crate::task::{sched, signal, TaskPtr};

pub const NSEC_PER_SEC: u32 = 1_000_000_000;

/// Seconds + nanoseconds, the syscall-visible time format.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timespec {
    pub sec: u32,
    pub nsec: u32,
}

impl Timespec {
    pub fn cmp_to(&self, other: &Timespec) -> core::cmp::Ordering {
        (self.sec, self.nsec).cmp(&(other.sec, other.nsec))
    }

    pub fn add(&self, other: &Timespec) -> Timespec {
        let mut sec = self.sec + other.sec;
        let mut nsec = self.nsec + other.nsec;
        if nsec >= NSEC_PER_SEC {
            sec += 1;
            nsec -= NSEC_PER_SEC;
        }
        Timespec { sec, nsec }
    }

    pub fn saturating_sub(&self, other: &Timespec) -> Timespec {
        if self.cmp_to(other).is_le() {
            return Timespec::default();
        }
        let (mut sec, mut nsec) = (self.sec, self.nsec);
        if nsec < other.nsec {
            sec -= 1;
            nsec += NSEC_PER_SEC;
        }
        Timespec {
            sec: sec - other.sec,
            nsec: nsec - other.nsec,
        }
    }
}

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Wall-clock seconds at boot; the RTC collaborator sets it.
static BOOT_EPOCH: AtomicU32 = AtomicU32::new(0);

/// Monotonic tick count since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Monotonic uptime.
pub fn uptime() -> Timespec {
    let t = ticks();
    Timespec {
        sec: (t / TICK_HZ as u64) as u32,
        nsec: ((t % TICK_HZ as u64) * (NSEC_PER_SEC as u64 / TICK_HZ as u64)) as u32,
    }
}

/// Wall-clock surface for the RTC driver.
pub fn set_wall_clock(epoch: u32) {
    BOOT_EPOCH.store(epoch, Ordering::Release);
}

/// Seconds since the Unix epoch (zero until the RTC reports in).
pub fn wall_time() -> u32 {
    BOOT_EPOCH.load(Ordering::Acquire) + uptime().sec
}

/// One parked sleeper.
pub struct Sleeper {
    task: TaskPtr,
    deadline: Timespec,
    expired: AtomicBool,
}

impl Sleeper {
    pub fn expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }
}

static SLEEPERS: IrqLock<Vec<Arc<Sleeper>>> = IrqLock::new(Vec::new());

/// Park an entry in the sleep queue; the timer wakes it at `deadline`.
pub fn add_sleeper(deadline: Timespec) -> Arc<Sleeper> {
    let sleeper = Arc::new(Sleeper {
        task: TaskPtr::new(core::ptr::NonNull::from(sched::current())),
        deadline,
        expired: AtomicBool::new(false),
    });
    SLEEPERS.lock().push(sleeper.clone());
    sleeper
}

/// Remove an entry (sleep finished or interrupted).
pub fn remove_sleeper(sleeper: &Arc<Sleeper>) {
    SLEEPERS.lock().retain(|s| !Arc::ptr_eq(s, sleeper));
}

fn wake_expired(now: &Timespec) {
    let mut woken: Vec<TaskPtr> = Vec::new();
    {
        let mut sleepers = SLEEPERS.lock();
        sleepers.retain(|s| {
            if now.cmp_to(&s.deadline).is_ge() {
                s.expired.store(true, Ordering::Release);
                woken.push(s.task);
                false
            } else {
                true
            }
        });
    }
    for task in woken {
        sched::wake_up_process(task.as_ref());
    }
}

/// The timer IRQ action.
pub fn timer_tick(_frame: &mut TrapFrame) {
    TICKS.fetch_add(1, Ordering::Relaxed);
    sched::timer_tick();
    wake_expired(&uptime());
}

/// Sleep for `req`, interruptibly. On `EINTR` returns the remaining time
/// in `Err`'s companion out-param style via `rem`.
pub fn nanosleep(req: Timespec, rem: Option<&mut Timespec>) -> KernelResult<()> {
    if req.nsec >= NSEC_PER_SEC {
        return Err(Errno::EINVAL);
    }

    let deadline = uptime().add(&req);
    let sleeper = add_sleeper(deadline);
    let cur = sched::current();
    let mut rem = rem;

    let mut res = Ok(());
    loop {
        if uptime().cmp_to(&deadline).is_ge() {
            break;
        }
        if signal::signal_pending(cur) {
            if let Some(out) = rem.take() {
                *out = deadline.saturating_sub(&uptime());
            }
            res = Err(Errno::EINTR);
            break;
        }
        cur.set_state(crate::task::TaskState::Interruptible);
        sched::schedule();
        cur.set_state(crate::task::TaskState::Running);
    }

    remove_sleeper(&sleeper);
    res
}

/// Wire the timer action and unmask IRQ 0.
pub fn init() {
    crate::irq::register_irq(0, timer_tick);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespec_arithmetic() {
        let a = Timespec {
            sec: 1,
            nsec: 800_000_000,
        };
        let b = Timespec {
            sec: 0,
            nsec: 300_000_000,
        };
        assert_eq!(
            a.add(&b),
            Timespec {
                sec: 2,
                nsec: 100_000_000
            }
        );
        assert_eq!(
            a.saturating_sub(&b),
            Timespec {
                sec: 1,
                nsec: 500_000_000
            }
        );
        assert_eq!(b.saturating_sub(&a), Timespec::default());
        assert!(a.cmp_to(&b).is_gt());
    }
}
