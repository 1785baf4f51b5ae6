//! Bare-metal entry point.
//!
//! The multiboot shim (assembly, external to the core) parses the loader
//! tables into [`cinder_kernel::boot::BootInfo`], publishes it, and jumps
//! here on the boot stack with paging off.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel_entry {
    use cinder_kernel::task::{clone, exec, exit, sched};
    use cinder_kernel::{arch, boot, config, println};

    /// PID 1: exec the configured init once a root filesystem parser has
    /// mounted something to exec from.
    fn init_task(_arg: usize) -> i32 {
        let path = config::config().init_path;
        let cur = sched::current();
        let frame = cur.entry_frame();

        // SAFETY: the entry frame slot at our stack top is ours alone.
        unsafe {
            match exec::do_execve(
                &mut *frame,
                path,
                alloc::vec![alloc::string::String::from(path)],
                alloc::vec![],
            ) {
                Ok(_) => {
                    cinder_kernel::task::signal::deliver_signals(&mut *frame);
                    arch::x86::context::resume_frame(frame)
                }
                Err(e) => {
                    log::error!("cannot start {}: {} (no root filesystem?)", path, e);
                    exit::do_exit(1)
                }
            }
        }
    }

    extern crate alloc;

    /// Rust-side boot entry, called by the multiboot shim.
    ///
    /// # Safety
    /// Single CPU, paging off, `boot::set_boot_info` already called.
    #[no_mangle]
    pub unsafe extern "C" fn kernel_main() -> ! {
        let info = boot::boot_info().expect("boot shim published no BootInfo");

        // SAFETY: forwarded early-boot contract.
        unsafe { cinder_kernel::kernel_init(info) };

        println!("cinder {}", env!("CARGO_PKG_VERSION"));

        if let Err(e) = clone::kernel_thread(init_task, 0) {
            panic!("cannot spawn init: {}", e);
        }

        // The boot context becomes the idle task.
        loop {
            arch::x86::cpu::irq_enable();
            arch::x86::cpu::halt();
            sched::schedule();
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        // A kernel panic is fatal by design: report on both consoles and
        // halt with interrupts off.
        arch::x86::cpu::irq_disable();
        cinder_kernel::serial_println!("KERNEL PANIC: {}", info);
        println!("KERNEL PANIC: {}", info);
        loop {
            arch::x86::cpu::halt();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("cinder-kernel only runs on bare metal; use `cargo test` on the host");
}
