//! VGA text-mode back end.
//!
//! Two clients: the early-boot `print!` console (before the TTY layer owns
//! the screen) and the TTY subsystem, which writes cells into its own
//! videomem page and only comes here to move the hardware cursor.

use core::fmt::{self, Write};

use spin::Mutex;
use x86::io::outb;

/// Physical/identity-mapped address of the text buffer.
pub const VGA_BUFFER: usize = 0xb8000;

pub const NUM_COLS: usize = 80;
pub const NUM_ROWS: usize = 25;

/// Grey-on-black attribute byte.
pub const DEFAULT_ATTR: u8 = 0x07;

const CRTC_INDEX: u16 = 0x3d4;
const CRTC_DATA: u16 = 0x3d5;

/// Program the hardware cursor location.
pub fn set_cursor(x: u16, y: u16) {
    let pos = y as u16 * NUM_COLS as u16 + x;
    // SAFETY: CRTC index/data writes; cursor registers are 0x0e/0x0f.
    unsafe {
        outb(CRTC_INDEX, 0x0f);
        outb(CRTC_DATA, pos as u8);
        outb(CRTC_INDEX, 0x0e);
        outb(CRTC_DATA, (pos >> 8) as u8);
    }
}

struct VgaConsole {
    col: usize,
    row: usize,
}

impl VgaConsole {
    const fn new() -> Self {
        Self { col: 0, row: 0 }
    }

    fn buffer(&self) -> *mut u8 {
        VGA_BUFFER as *mut u8
    }

    fn put_at(&self, row: usize, col: usize, byte: u8) {
        let off = (row * NUM_COLS + col) * 2;
        // SAFETY: off < NUM_ROWS * NUM_COLS * 2; the buffer is identity
        // mapped by the boot page tables.
        unsafe {
            self.buffer().add(off).write_volatile(byte);
            self.buffer().add(off + 1).write_volatile(DEFAULT_ATTR);
        }
    }

    fn scroll(&mut self) {
        // SAFETY: in-bounds row moves within the 4000-byte text buffer.
        unsafe {
            core::ptr::copy(
                self.buffer().add(NUM_COLS * 2),
                self.buffer(),
                (NUM_ROWS - 1) * NUM_COLS * 2,
            );
        }
        for col in 0..NUM_COLS {
            self.put_at(NUM_ROWS - 1, col, b' ');
        }
        self.row = NUM_ROWS - 1;
        self.col = 0;
    }

    fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => {
                self.col = 0;
                self.row += 1;
            }
            byte => {
                self.put_at(self.row, self.col, byte);
                self.col += 1;
                if self.col == NUM_COLS {
                    self.col = 0;
                    self.row += 1;
                }
            }
        }
        if self.row == NUM_ROWS {
            self.scroll();
        }
    }
}

impl Write for VgaConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
        set_cursor(self.col as u16, self.row as u16);
        Ok(())
    }
}

static CONSOLE: Mutex<VgaConsole> = Mutex::new(VgaConsole::new());

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use crate::sync::IrqGuard;

    let _guard = IrqGuard::new();
    CONSOLE.lock().write_fmt(args).expect("vga write failed");
}
