//! Kernel synchronization primitives.

mod irq_lock;
pub mod mutex;

pub use irq_lock::{IrqGuard, IrqLock, IrqLockGuard};
pub use mutex::Mutex;
