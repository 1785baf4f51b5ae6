//! x86 (32-bit, protected mode) architecture support.

pub mod context;
pub mod cpu;
pub mod gdt;
pub mod idt;

#[cfg(target_os = "none")]
pub mod entry;
#[cfg(target_os = "none")]
pub mod pic;
#[cfg(target_os = "none")]
pub mod pit;
#[cfg(target_os = "none")]
pub mod serial;
#[cfg(target_os = "none")]
pub mod vga;

/// Scheduler tick rate.
pub const TICK_HZ: u32 = 100;

/// Bring up the CPU gates: GDT/TSS, IDT, PICs, PIT, serial.
///
/// Paging is *not* touched here; `mm::init` owns that and runs first so the
/// descriptor tables land in mapped memory.
///
/// # Safety
/// Early boot, single CPU, exactly once.
#[cfg(target_os = "none")]
pub unsafe fn init() {
    // SAFETY: forwarded early-boot contract.
    unsafe {
        serial::init();
        gdt::init();
        idt::init();
        pic::init();
        pit::init(TICK_HZ);
    }
    log::info!("cpu gates up: gdt/idt/pic/pit @ {} Hz", TICK_HZ);
}

/// Host stub.
///
/// # Safety
/// No-op off target.
#[cfg(not(target_os = "none"))]
pub unsafe fn init() {}
