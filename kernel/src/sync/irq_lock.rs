//! Interrupt-disabling lock adapter.
//!
//! On a single CPU, "interrupts off" is the global lock: any data shared
//! with interrupt context is protected by saving and restoring EFLAGS.IF
//! around the critical section. [`IrqLock`] wraps a `spin::Mutex` with that
//! discipline so lock ordering against handlers can never deadlock.
//!
//! The design does not assume SMP, but it also does not bake the irq-off
//! trick into callers: everything goes through this adapter, so swapping in
//! a real spinlock-per-CPU later is a local change.

use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use crate::arch::x86::cpu;

/// RAII interrupt-flag save/restore.
pub struct IrqGuard {
    flags: u32,
}

impl IrqGuard {
    pub fn new() -> Self {
        let flags = cpu::save_flags();
        cpu::irq_disable();
        Self { flags }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if cpu::flags_had_irq(self.flags) {
            cpu::irq_enable();
        }
    }
}

/// A mutex whose critical sections run with interrupts disabled.
pub struct IrqLock<T> {
    inner: Mutex<T>,
}

/// Guard for [`IrqLock`]; restores the interrupt flag after unlock.
pub struct IrqLockGuard<'a, T> {
    // Field order matters: the mutex guard must drop before the irq guard
    // re-enables interrupts.
    guard: MutexGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> IrqLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> IrqLockGuard<'_, T> {
        let irq = IrqGuard::new();
        IrqLockGuard {
            guard: self.inner.lock(),
            _irq: irq,
        }
    }
}

impl<T> Deref for IrqLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_roundtrip() {
        let lock = IrqLock::new(7);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 8);
    }
}
