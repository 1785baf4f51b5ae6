//! Interrupt descriptor table.
//!
//! The IDT points every wired vector at the common assembly stub from
//! `entry.rs`; dispatch policy lives in the vector-indexed action table in
//! [`crate::irq`], not here.

#![cfg_attr(not(all(target_arch = "x86", target_os = "none")), allow(dead_code))]

use super::gdt::KERNEL_CS;

/// One 32-bit gate descriptor.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    fn new(handler: u32, type_attr: u8) -> Self {
        Self {
            offset_low: handler as u16,
            selector: KERNEL_CS.bits(),
            zero: 0,
            type_attr,
            offset_high: (handler >> 16) as u16,
        }
    }
}

/// Present, ring 0, 32-bit interrupt gate (IF cleared on entry).
const GATE_INTERRUPT: u8 = 0x8e;
/// Present, ring 0, 32-bit trap gate.
const GATE_TRAP: u8 = 0x8f;
/// Present, ring 3, interrupt gate -- the syscall vector. Every handler
/// starts with interrupts disabled; the syscall dispatcher re-enables
/// because it tolerates re-entry.
const GATE_INT_USER: u8 = 0xee;

static mut IDT: [IdtEntry; 256] = [IdtEntry::missing(); 256];

#[cfg(all(target_arch = "x86", target_os = "none"))]
extern "C" {
    static vector_0: u8;
    static vector_1: u8;
    static vector_2: u8;
    static vector_3: u8;
    static vector_4: u8;
    static vector_5: u8;
    static vector_6: u8;
    static vector_7: u8;
    static vector_8: u8;
    static vector_9: u8;
    static vector_10: u8;
    static vector_11: u8;
    static vector_12: u8;
    static vector_13: u8;
    static vector_14: u8;
    static vector_16: u8;
    static vector_17: u8;
    static vector_18: u8;
    static vector_19: u8;
    static vector_20: u8;
    static vector_21: u8;
    static vector_32: u8;
    static vector_33: u8;
    static vector_34: u8;
    static vector_35: u8;
    static vector_36: u8;
    static vector_37: u8;
    static vector_38: u8;
    static vector_39: u8;
    static vector_40: u8;
    static vector_41: u8;
    static vector_42: u8;
    static vector_43: u8;
    static vector_44: u8;
    static vector_45: u8;
    static vector_46: u8;
    static vector_47: u8;
    static vector_128: u8;
    static vector_130: u8;
}

/// Populate and load the IDT.
///
/// Wires the CPU exceptions, the 16 PIC lines, the syscall vector and the
/// self-test vector. Every other vector stays not-present; a stray trap
/// through one of those is a bug we want loud.
///
/// # Safety
/// Must run once during early boot, after the GDT is live.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub unsafe fn init() {
    use x86::dtables::{lidt, DescriptorTablePointer};

    // SAFETY: single-threaded early boot; the stub addresses come from
    // the linker.
    unsafe {
        macro_rules! gate {
            ($n:literal, $sym:ident, $attr:expr) => {
                IDT[$n] = IdtEntry::new(core::ptr::addr_of!($sym) as u32, $attr);
            };
        }

        gate!(0, vector_0, GATE_INTERRUPT); // #DE divide error
        gate!(1, vector_1, GATE_INTERRUPT); // #DB debug
        gate!(2, vector_2, GATE_INTERRUPT); // NMI
        gate!(3, vector_3, GATE_TRAP); // #BP breakpoint
        gate!(4, vector_4, GATE_TRAP); // #OF overflow
        gate!(5, vector_5, GATE_INTERRUPT); // #BR bound range
        gate!(6, vector_6, GATE_INTERRUPT); // #UD invalid opcode
        gate!(7, vector_7, GATE_INTERRUPT); // #NM device not available
        gate!(8, vector_8, GATE_INTERRUPT); // #DF double fault
        gate!(9, vector_9, GATE_INTERRUPT); // coprocessor segment overrun
        gate!(10, vector_10, GATE_INTERRUPT); // #TS invalid TSS
        gate!(11, vector_11, GATE_INTERRUPT); // #NP segment not present
        gate!(12, vector_12, GATE_INTERRUPT); // #SS stack segment
        gate!(13, vector_13, GATE_INTERRUPT); // #GP general protection
        gate!(14, vector_14, GATE_INTERRUPT); // #PF page fault
        gate!(16, vector_16, GATE_INTERRUPT); // #MF x87 FP
        gate!(17, vector_17, GATE_INTERRUPT); // #AC alignment check
        gate!(18, vector_18, GATE_INTERRUPT); // #MC machine check
        gate!(19, vector_19, GATE_INTERRUPT); // #XF SIMD FP
        gate!(20, vector_20, GATE_INTERRUPT); // #VE virtualization
        gate!(21, vector_21, GATE_INTERRUPT); // #CP control protection

        gate!(32, vector_32, GATE_INTERRUPT); // IRQ 0, timer
        gate!(33, vector_33, GATE_INTERRUPT);
        gate!(34, vector_34, GATE_INTERRUPT);
        gate!(35, vector_35, GATE_INTERRUPT);
        gate!(36, vector_36, GATE_INTERRUPT);
        gate!(37, vector_37, GATE_INTERRUPT);
        gate!(38, vector_38, GATE_INTERRUPT);
        gate!(39, vector_39, GATE_INTERRUPT);
        gate!(40, vector_40, GATE_INTERRUPT);
        gate!(41, vector_41, GATE_INTERRUPT);
        gate!(42, vector_42, GATE_INTERRUPT);
        gate!(43, vector_43, GATE_INTERRUPT);
        gate!(44, vector_44, GATE_INTERRUPT);
        gate!(45, vector_45, GATE_INTERRUPT);
        gate!(46, vector_46, GATE_INTERRUPT);
        gate!(47, vector_47, GATE_INTERRUPT); // IRQ 15

        gate!(128, vector_128, GATE_INT_USER); // syscall
        gate!(130, vector_130, GATE_INTERRUPT); // self-test harness

        let idtr = DescriptorTablePointer {
            limit: (core::mem::size_of::<[IdtEntry; 256]>() - 1) as u16,
            base: core::ptr::addr_of!(IDT) as *const IdtEntry,
        };
        lidt(&idtr);
    }
}

/// Host stub.
///
/// # Safety
/// No-op off target.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub unsafe fn init() {}
