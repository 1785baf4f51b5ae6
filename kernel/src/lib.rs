//! Cinder kernel library.
//!
//! The core of a preemptive, multi-tasking, protected-mode x86 kernel:
//! paging with copy-on-write, round-robin scheduling, trap/IRQ/syscall
//! entry, signals, wait/exit, and the VFS skeleton. Device drivers,
//! filesystem parsers and the network stack plug in through the
//! registration surfaces each subsystem exports.
//!
//! The crate also compiles for the build host so the pure-logic parts run
//! under the standard `cargo test` harness; everything hardware-shaped is
//! gated on `target_os = "none"`.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
// Bare-metal self-tests use the custom runner; host tests use the
// standard harness.
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![cfg_attr(target_os = "none", feature(custom_test_frameworks))]
#![cfg_attr(
    target_os = "none",
    test_runner(crate::test_framework::test_runner)
)]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

#[cfg(feature = "alloc")]
extern crate alloc;

// Bare metal uses the kernel heap; the host build delegates to the system
// allocator so tests can allocate normally.
#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod config;
pub mod elf;
pub mod error;
pub mod fs;
pub mod irq;
pub mod logger;
pub mod mm;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod test_framework;
pub mod time;

pub use error::{Errno, KernelResult};

/// Bring the core up, in dependency order. The caller (the boot shim)
/// has already published [`boot::BootInfo`].
///
/// # Safety
/// Exactly once, single-threaded, paging off, identity-mapped.
#[cfg(target_os = "none")]
pub unsafe fn kernel_init(info: &'static boot::BootInfo) {
    logger::init(log::LevelFilter::Info);
    let config = config::init(info.cmdline);
    logger::set_level(config.loglevel);

    // SAFETY: forwarded early-boot contract. The CPU gates (and the
    // serial port behind the logger) need no paging; the heap needs the
    // page allocator; the scheduler needs the heap for its tables.
    unsafe {
        arch::x86::init();
        mm::paging::init(info.memory_map);
        mm::heap::init();
        task::sched::init(boot_stack_base());
    }

    time::init();
    fs::init();
    syscall::init();

    log::info!("core up: {} boot modules, cmdline {:?}", info.modules.len(), info.cmdline);
}

/// Base of the boot stack the loader handed us (grows down from 8 MiB).
#[cfg(target_os = "none")]
fn boot_stack_base() -> usize {
    (8 << 20) - task::KSTACK_SIZE
}

/// Heap allocation error handler: allocation failure in the kernel heap
/// is unrecoverable.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {:?}", layout);
}

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}
