//! Global descriptor table, TSS and the single user TLS slot.
//!
//! Flat 4 GiB segments; privilege separation is ring 0 vs ring 3 plus
//! paging. The TSS exists only so the CPU knows which kernel stack to load
//! on a ring 3 -> ring 0 transition; the scheduler refreshes `esp0` on every
//! task switch.

use x86::segmentation::SegmentSelector;
use x86::Ring;

/// Kernel code segment selector (GDT index 1, ring 0).
pub const KERNEL_CS: SegmentSelector = SegmentSelector::new(1, Ring::Ring0);
/// Kernel data segment selector (GDT index 2, ring 0).
pub const KERNEL_DS: SegmentSelector = SegmentSelector::new(2, Ring::Ring0);
/// User code segment selector (GDT index 3, ring 3).
pub const USER_CS: SegmentSelector = SegmentSelector::new(3, Ring::Ring3);
/// User data segment selector (GDT index 4, ring 3).
pub const USER_DS: SegmentSelector = SegmentSelector::new(4, Ring::Ring3);
/// Task state segment selector (GDT index 5).
pub const TSS_SELECTOR: SegmentSelector = SegmentSelector::new(5, Ring::Ring0);
/// The one GDT slot `set_thread_area` may populate (index 6, ring 3).
pub const TLS_SELECTOR: SegmentSelector = SegmentSelector::new(6, Ring::Ring3);

const GDT_ENTRIES: usize = 7;

/// 32-bit task state segment. Only `ss0`/`esp0` are ever consulted; the
/// hardware task-switching fields stay zero.
#[repr(C, packed)]
pub struct TaskStateSegment {
    link: u16,
    _pad0: u16,
    esp0: u32,
    ss0: u16,
    _pad1: u16,
    esp1: u32,
    ss1: u16,
    _pad2: u16,
    esp2: u32,
    ss2: u16,
    _pad3: u16,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u16,
    _pad4: u16,
    cs: u16,
    _pad5: u16,
    ss: u16,
    _pad6: u16,
    ds: u16,
    _pad7: u16,
    fs: u16,
    _pad8: u16,
    gs: u16,
    _pad9: u16,
    ldt: u16,
    _pad10: u16,
    trap: u16,
    iomap_base: u16,
}

impl TaskStateSegment {
    const fn zeroed() -> Self {
        // SAFETY: all fields are plain integers; the all-zero pattern is valid.
        unsafe { core::mem::zeroed() }
    }
}

/// Pack a segment descriptor from base/limit/access/flags nibbles.
const fn gdt_entry(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    let base = base as u64;
    let limit = limit as u64;
    (limit & 0xffff)
        | ((base & 0xff_ffff) << 16)
        | ((access as u64) << 40)
        | (((limit >> 16) & 0xf) << 48)
        | (((flags as u64) & 0xf) << 52)
        | (((base >> 24) & 0xff) << 56)
}

static mut GDT: [u64; GDT_ENTRIES] = [
    0,
    gdt_entry(0, 0xf_ffff, 0x9a, 0xc), // kernel code
    gdt_entry(0, 0xf_ffff, 0x92, 0xc), // kernel data
    gdt_entry(0, 0xf_ffff, 0xfa, 0xc), // user code
    gdt_entry(0, 0xf_ffff, 0xf2, 0xc), // user data
    0,                                 // TSS, patched in init()
    0,                                 // TLS, patched by set_tls()
];

static mut TSS: TaskStateSegment = TaskStateSegment::zeroed();

/// Build the GDT, load it, and load the task register.
///
/// # Safety
/// Must run once during early boot on the boot CPU, before the first ring
/// transition.
#[cfg(target_os = "none")]
pub unsafe fn init() {
    use x86::dtables::{lgdt, DescriptorTablePointer};
    use x86::segmentation::{load_ds, load_es, load_fs, load_gs, load_ss};
    use x86::task::load_tr;

    // SAFETY: single-threaded early boot; nothing else touches these statics.
    unsafe {
        TSS.ss0 = KERNEL_DS.bits();
        TSS.iomap_base = core::mem::size_of::<TaskStateSegment>() as u16;

        let tss_base = core::ptr::addr_of!(TSS) as u32;
        let tss_limit = core::mem::size_of::<TaskStateSegment>() as u32 - 1;
        GDT[5] = gdt_entry(tss_base, tss_limit, 0x89, 0x0);

        let gdtr = DescriptorTablePointer {
            limit: (core::mem::size_of::<[u64; GDT_ENTRIES]>() - 1) as u16,
            base: core::ptr::addr_of!(GDT) as *const u64,
        };
        lgdt(&gdtr);

        load_ds(KERNEL_DS);
        load_es(KERNEL_DS);
        load_fs(KERNEL_DS);
        load_gs(KERNEL_DS);
        load_ss(KERNEL_DS);
        load_tr(TSS_SELECTOR);
    }
}

/// Point the TSS at a task's kernel stack top. Called on every switch.
pub fn set_kernel_stack(esp0: usize) {
    // SAFETY: single CPU, callers run with interrupts disabled.
    unsafe {
        TSS.esp0 = esp0 as u32;
    }
}

/// Install a user data descriptor in the TLS slot.
///
/// `limit_in_pages` selects 4 KiB limit granularity, matching the Linux
/// `set_thread_area` user descriptor.
pub fn set_tls(base: u32, limit: u32, limit_in_pages: bool) {
    let flags = if limit_in_pages { 0xc } else { 0x4 };
    // SAFETY: single CPU; the slot is private to the current task and the
    // descriptor takes effect on the next segment load.
    unsafe {
        GDT[6] = gdt_entry(base, limit, 0xf2, flags);
    }
}

/// Clear the TLS slot (exec resets inherited TLS).
pub fn clear_tls() {
    // SAFETY: see set_tls.
    unsafe {
        GDT[6] = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_values() {
        assert_eq!(KERNEL_CS.bits(), 0x08);
        assert_eq!(KERNEL_DS.bits(), 0x10);
        assert_eq!(USER_CS.bits(), 0x1b);
        assert_eq!(USER_DS.bits(), 0x23);
        assert_eq!(TLS_SELECTOR.bits(), 0x33);
    }

    #[test]
    fn descriptor_packing() {
        // Flat 4 GiB ring-0 code descriptor, the textbook 0x00cf9a000000ffff.
        assert_eq!(gdt_entry(0, 0xf_ffff, 0x9a, 0xc), 0x00cf_9a00_0000_ffff);
    }
}
