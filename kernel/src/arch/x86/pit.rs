//! 8253/8254 programmable interval timer.
//!
//! Programs channel 0 to fire the scheduler tick on IRQ 0. Everything else
//! about timekeeping lives in [`crate::time`]; this file is only the
//! hardware knob.

use x86::io::outb;

const CHANNEL0_DATA: u16 = 0x40;
const MODE_CMD: u16 = 0x43;

/// Base oscillator frequency of the PIT in Hz.
const PIT_HZ: u32 = 1_193_182;

/// Channel 0, lobyte/hibyte access, mode 3 (square wave).
const MODE_CH0_RATEGEN: u8 = 0x36;

/// Program channel 0 for the given tick rate.
///
/// # Safety
/// Early boot only; reprograms the system timer.
pub unsafe fn init(hz: u32) {
    let divisor = (PIT_HZ / hz).clamp(1, 0xffff) as u16;
    // SAFETY: standard PIT programming sequence, mode then 16-bit reload.
    unsafe {
        outb(MODE_CMD, MODE_CH0_RATEGEN);
        outb(CHANNEL0_DATA, divisor as u8);
        outb(CHANNEL0_DATA, (divisor >> 8) as u8);
    }
}
