//! No-std test framework.
//!
//! Bare-metal self-tests report over the serial port and exit QEMU through
//! the isa-debug-exit device. Host-side unit tests use the standard
//! harness instead; this module only matters for `cargo test` against the
//! bare-metal target.

use core::panic::PanicInfo;

use crate::{serial_print, serial_println};

/// Exit codes QEMU maps to process status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Result alias the self-tests use.
pub type KernelError = crate::error::Errno;

/// Trait that all testable functions implement.
pub trait Testable {
    fn run(&self) -> Result<(), KernelError>;
}

impl<T> Testable for T
where
    T: Fn() -> Result<(), KernelError>,
{
    fn run(&self) -> Result<(), KernelError> {
        serial_print!("{}...\t", core::any::type_name::<T>());
        match self() {
            Ok(()) => {
                serial_println!("[ok]");
                Ok(())
            }
            Err(e) => {
                serial_println!("[failed]: {}", e);
                Err(e)
            }
        }
    }
}

/// Custom test runner for bare-metal tests.
pub fn test_runner(tests: &[&dyn Testable]) -> ! {
    serial_println!("Running {} tests", tests.len());
    let mut failed = 0;
    for test in tests {
        if test.run().is_err() {
            failed += 1;
        }
    }
    serial_println!("Test results: {} run, {} failed", tests.len(), failed);
    if failed == 0 {
        exit_qemu(QemuExitCode::Success)
    } else {
        exit_qemu(QemuExitCode::Failed)
    }
}

/// Panic handler for test mode.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failed)
}

/// Exit QEMU via the debug-exit device on port 0xf4.
pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    // SAFETY: the write tells QEMU to terminate; nothing runs after it.
    unsafe {
        x86::io::outl(0xf4, exit_code as u32);
    }
    let _ = exit_code;
    loop {
        crate::arch::x86::cpu::halt();
    }
}
