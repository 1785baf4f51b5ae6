//! TTY subsystem.
//!
//! Each TTY owns a fixed-size line buffer, a termios record, a cursor, and
//! a videomem backing page: the live VGA page while it is the foreground
//! TTY, a private page while backgrounded. Per-task vidmaps alias the
//! backing page into user address spaces; foreground switching relocates
//! the backing pages and rebinds every vidmap.
//!
//! Input arrives from the keyboard collaborator through
//! [`receive_char`]; output goes through an ANSI-subset interpreter to the
//! backing page. Reads are line-oriented in canonical mode and blocking
//! either way.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{Errno, KernelResult};
use crate::mm::{self, user, PAGE_SIZE_SMALL, VIDEO_ADDR};
use crate::sync::IrqLock;
use crate::task::session::Session;
use crate::task::signal::{self, Sig, SigInfo};
use crate::task::{self, Pid};

use super::device::{self, DevId};
use super::file::{File, FileOps, Private};
use super::poll::{PollEvents, PollTable, WaitQueue};
use super::{Inode, Mode, OpenFlags};

pub const TTY_MAJOR: u32 = 4;
/// "The task's controlling terminal", resolved at open.
pub const TTY_CURRENT_DEV: DevId = DevId::new(5, 0);

/// Number of virtual consoles.
pub const NUM_TTYS: usize = 4;

pub const TTY_BUFFER_SIZE: usize = 128;

const NUM_COLS: usize = 80;
const NUM_ROWS: usize = 25;

// termios lflag bits
pub const ISIG: u32 = 0o0000001;
pub const ICANON: u32 = 0o0000002;
pub const ECHO: u32 = 0o0000010;
pub const ECHOCTL: u32 = 0o0001000;

// control character slots
pub const VINTR: usize = 0;
pub const VERASE: usize = 2;
pub const VKILL: usize = 3;
pub const VEOF: usize = 4;
pub const VSUSP: usize = 10;
pub const VEOL: usize = 11;

// ioctl requests
pub const TCGETS: u32 = 0x5401;
pub const TCSETS: u32 = 0x5402;
pub const TCSETSW: u32 = 0x5403;
pub const TCSETSF: u32 = 0x5404;
pub const TIOCGPGRP: u32 = 0x540f;
pub const TIOCSPGRP: u32 = 0x5410;
pub const TIOCGWINSZ: u32 = 0x5413;
pub const TIOCGSID: u32 = 0x5429;

/// Termios, the subset the line discipline honours.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termios {
    pub iflag: u32,
    pub oflag: u32,
    pub cflag: u32,
    pub lflag: u32,
    pub line: u8,
    pub cc: [u8; 19],
}

impl Termios {
    pub fn console_default() -> Self {
        let mut cc = [0u8; 19];
        cc[VINTR] = 0x03; // ^C
        cc[VERASE] = 0x7f;
        cc[VKILL] = 0x15; // ^U
        cc[VEOF] = 0x04; // ^D
        cc[VSUSP] = 0x1a; // ^Z
        cc[VEOL] = b'\n';
        Self {
            iflag: 0,
            oflag: 0,
            cflag: 0,
            lflag: ISIG | ICANON | ECHO | ECHOCTL,
            line: 0,
            cc,
        }
    }

    pub fn canonical(&self) -> bool {
        self.lflag & ICANON != 0
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Winsize {
    pub row: u16,
    pub col: u16,
    pub xpixel: u16,
    pub ypixel: u16,
}

/// CSI escape accumulator.
struct AnsiState {
    active: bool,
    len: usize,
    buf: [u8; 16],
}

impl AnsiState {
    const fn new() -> Self {
        Self {
            active: false,
            len: 0,
            buf: [0; 16],
        }
    }

    fn reset(&mut self) {
        self.active = false;
        self.len = 0;
    }

    /// First two numeric parameters, defaulting to 0.
    fn params(&self) -> (u16, u16) {
        let mut vals = [0u16; 2];
        let mut idx = 0;
        for &b in &self.buf[..self.len] {
            match b {
                b'0'..=b'9' => vals[idx] = vals[idx] * 10 + (b - b'0') as u16,
                b';' if idx == 0 => idx = 1,
                _ => break,
            }
        }
        (vals[0], vals[1])
    }
}

const DEFAULT_ATTR: u8 = 0x07;

struct TtyInner {
    termios: Termios,
    cursor_x: usize,
    cursor_y: usize,
    color: u8,
    ansi: AnsiState,
    /// Line buffer; input collects here until a read drains it.
    buffer: [u8; TTY_BUFFER_SIZE],
    buf_len: usize,
    /// Active videomem backing: the VGA page when foreground, a private
    /// kernel page otherwise.
    video: usize,
}

impl TtyInner {
    fn cell(&mut self, x: usize, y: usize, ch: u8, attr: u8) {
        let off = (y * NUM_COLS + x) * 2;
        // SAFETY: x/y are clamped below NUM_COLS/NUM_ROWS and the backing
        // page is one mapped 4 KiB page.
        unsafe {
            let base = self.video as *mut u8;
            base.add(off).write_volatile(ch);
            base.add(off + 1).write_volatile(attr);
        }
    }

    fn clear(&mut self) {
        for y in 0..NUM_ROWS {
            for x in 0..NUM_COLS {
                let color = self.color;
                self.cell(x, y, b' ', color);
            }
        }
        self.cursor_x = 0;
        self.cursor_y = 0;
    }

    fn scroll(&mut self) {
        // SAFETY: moves rows inside the one-page backing buffer.
        unsafe {
            let base = self.video as *mut u8;
            core::ptr::copy(base.add(NUM_COLS * 2), base, (NUM_ROWS - 1) * NUM_COLS * 2);
        }
        for x in 0..NUM_COLS {
            let color = self.color;
            self.cell(x, NUM_ROWS - 1, b' ', color);
        }
        self.cursor_y = NUM_ROWS - 1;
    }

    fn newline(&mut self) {
        self.cursor_x = 0;
        self.cursor_y += 1;
        if self.cursor_y == NUM_ROWS {
            self.scroll();
        }
    }

    fn backspace(&mut self) {
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = NUM_COLS - 1;
        }
        let color = self.color;
        let (x, y) = (self.cursor_x, self.cursor_y);
        self.cell(x, y, b' ', color);
    }

    fn sgr(&mut self, code: u16) {
        match code {
            0 => self.color = DEFAULT_ATTR,
            30..=37 => self.color = (self.color & 0xf0) | vga_color(code - 30),
            40..=47 => self.color = (self.color & 0x0f) | (vga_color(code - 40) << 4),
            _ => {}
        }
    }

    /// Apply a completed CSI sequence.
    fn csi(&mut self, cmd: u8) {
        let (a, b) = self.ansi.params();
        match cmd {
            b'A' => self.cursor_y = self.cursor_y.saturating_sub(a.max(1) as usize),
            b'B' => {
                self.cursor_y = (self.cursor_y + a.max(1) as usize).min(NUM_ROWS - 1);
            }
            b'C' => {
                self.cursor_x = (self.cursor_x + a.max(1) as usize).min(NUM_COLS - 1);
            }
            b'D' => self.cursor_x = self.cursor_x.saturating_sub(a.max(1) as usize),
            b'H' | b'f' => {
                self.cursor_y = (a.max(1) as usize - 1).min(NUM_ROWS - 1);
                self.cursor_x = (b.max(1) as usize - 1).min(NUM_COLS - 1);
            }
            b'J' => {
                if a == 2 {
                    self.clear();
                }
            }
            b'K' => {
                for x in self.cursor_x..NUM_COLS {
                    let color = self.color;
                    let y = self.cursor_y;
                    self.cell(x, y, b' ', color);
                }
            }
            b'm' => {
                self.sgr(a);
                if b != 0 {
                    self.sgr(b);
                }
            }
            _ => {}
        }
        self.ansi.reset();
    }

    /// One output byte through the ANSI-subset interpreter.
    fn output(&mut self, byte: u8) {
        if self.ansi.active {
            match (self.ansi.len, byte) {
                (0, b'[') => self.ansi.len = 0,
                (_, b'0'..=b'9') | (_, b';') => {
                    if self.ansi.len < self.ansi.buf.len() {
                        let len = self.ansi.len;
                        self.ansi.buf[len] = byte;
                        self.ansi.len += 1;
                    }
                }
                (_, cmd) => self.csi(cmd),
            }
            return;
        }
        match byte {
            0x1b => self.ansi.active = true,
            b'\n' => self.newline(),
            b'\r' => self.cursor_x = 0,
            0x08 => self.backspace(),
            b'\t' => {
                let next = (self.cursor_x / 8 + 1) * 8;
                while self.cursor_x < next.min(NUM_COLS - 1) {
                    let color = self.color;
                    let (x, y) = (self.cursor_x, self.cursor_y);
                    self.cell(x, y, b' ', color);
                    self.cursor_x += 1;
                }
            }
            byte => {
                let color = self.color;
                let (x, y) = (self.cursor_x, self.cursor_y);
                self.cell(x, y, byte, color);
                self.cursor_x += 1;
                if self.cursor_x == NUM_COLS {
                    self.newline();
                }
            }
        }
    }

    /// Canonical mode: a line is ready once the buffer ends with the wake
    /// character. Raw mode: any byte will do.
    fn should_read(&self) -> bool {
        if self.termios.canonical() {
            self.buf_len > 0
                && (self.buffer[self.buf_len - 1] == self.termios.cc[VEOL]
                    || self.buffer[self.buf_len - 1] == self.termios.cc[VEOF])
        } else {
            self.buf_len > 0
        }
    }
}

fn vga_color(ansi: u16) -> u8 {
    // ANSI colour order to VGA palette order.
    const MAP: [u8; 8] = [0, 4, 2, 6, 1, 5, 3, 7];
    MAP[(ansi & 7) as usize]
}

/// One terminal.
pub struct Tty {
    pub index: usize,
    /// Owning session, if any; sessions own TTYs, the back edge is weak.
    pub session: Mutex<Weak<Session>>,
    /// The single parked reader.
    reader: Mutex<Option<Pid>>,
    read_wait: Arc<WaitQueue>,
    inner: IrqLock<TtyInner>,
}

impl Tty {
    fn new(index: usize, video: usize) -> Arc<Tty> {
        Arc::new(Tty {
            index,
            session: Mutex::new(Weak::new()),
            reader: Mutex::new(None),
            read_wait: Arc::new(WaitQueue::new()),
            inner: IrqLock::new(TtyInner {
                termios: Termios::console_default(),
                cursor_x: 0,
                cursor_y: 0,
                color: DEFAULT_ATTR,
                ansi: AnsiState::new(),
                buffer: [0; TTY_BUFFER_SIZE],
                buf_len: 0,
                video,
            }),
        })
    }

    fn commit_cursor(&self) {
        #[cfg(target_os = "none")]
        if foreground_index() == self.index {
            let inner = self.inner.lock();
            crate::arch::x86::vga::set_cursor(inner.cursor_x as u16, inner.cursor_y as u16);
        }
    }

    /// Write bytes through the output interpreter.
    pub fn write_bytes(&self, buf: &[u8]) -> usize {
        {
            let mut inner = self.inner.lock();
            for &byte in buf {
                inner.output(byte);
            }
        }
        self.commit_cursor();
        buf.len()
    }

    /// Blocking line-oriented read.
    pub fn read_line(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let cur = task::current();

        {
            let mut reader = self.reader.lock();
            match *reader {
                Some(pid) if pid != cur.pid() => return Err(Errno::EBUSY),
                _ => *reader = Some(cur.pid()),
            }
        }

        let res = self
            .read_wait
            .wait_interruptible(|| self.inner.lock().should_read());

        *self.reader.lock() = None;
        res?;

        let mut inner = self.inner.lock();
        let mut n = inner.buf_len.min(buf.len());
        if inner.termios.canonical() {
            // Up to and including the delimiter.
            if let Some(pos) = inner.buffer[..inner.buf_len]
                .iter()
                .position(|&b| b == inner.termios.cc[VEOL] || b == inner.termios.cc[VEOF])
            {
                n = n.min(pos + 1);
            }
        }
        buf[..n].copy_from_slice(&inner.buffer[..n]);
        // An EOF mark is consumed but not handed to the caller.
        let mut handed = n;
        if inner.termios.canonical() && n > 0 && inner.buffer[n - 1] == inner.termios.cc[VEOF] {
            handed = n - 1;
        }
        let buf_len = inner.buf_len;
        inner.buffer.copy_within(n..buf_len, 0);
        inner.buf_len -= n;
        Ok(handed)
    }

    /// Deliver one input character from the keyboard collaborator.
    pub fn input_char(&self, ch: u8, ctrl: bool) {
        let mut echo: [u8; 2] = [0, 0];
        let mut echo_len = 0;
        let mut signal_out: Option<Sig> = None;

        {
            let mut inner = self.inner.lock();
            let termios = inner.termios;

            if ctrl && ch == b'l' && termios.canonical() {
                inner.clear();
            } else if termios.lflag & ISIG != 0 && ch != 0 && ch == termios.cc[VINTR] {
                if termios.lflag & ECHOCTL != 0 {
                    echo = [b'^', ch + 0x40];
                    echo_len = 2;
                }
                signal_out = Some(Sig::INT);
            } else if termios.lflag & ISIG != 0 && ch != 0 && ch == termios.cc[VSUSP] {
                signal_out = Some(Sig::TSTP);
            } else if termios.canonical() && ch == termios.cc[VERASE] {
                if inner.buf_len > 0
                    && inner.buffer[inner.buf_len - 1] != termios.cc[VEOL]
                {
                    inner.buf_len -= 1;
                    if termios.lflag & ECHO != 0 {
                        inner.output(0x08);
                    }
                }
            } else if termios.canonical() && ch == termios.cc[VKILL] {
                while inner.buf_len > 0
                    && inner.buffer[inner.buf_len - 1] != termios.cc[VEOL]
                {
                    inner.buf_len -= 1;
                    if termios.lflag & ECHO != 0 {
                        inner.output(0x08);
                    }
                }
            } else if ch != 0 {
                // Canonical mode always leaves room for the delimiter.
                let room = if termios.canonical() && ch != termios.cc[VEOL] {
                    TTY_BUFFER_SIZE - 1
                } else {
                    TTY_BUFFER_SIZE
                };
                if inner.buf_len < room {
                    let len = inner.buf_len;
                    inner.buffer[len] = ch;
                    inner.buf_len += 1;
                    if termios.lflag & ECHO != 0 && ch != termios.cc[VEOF] {
                        inner.output(ch);
                    }
                }
            }
        }

        if echo_len > 0 {
            self.write_bytes(&echo[..echo_len]);
        } else {
            self.commit_cursor();
        }

        if let Some(sig) = signal_out {
            self.signal_foreground(sig);
        }
        if self.inner.lock().should_read() {
            self.read_wait.wake_all();
        }
    }

    /// Send a signal to this TTY's foreground process group.
    pub fn signal_foreground(&self, sig: Sig) {
        let session = self.session.lock().upgrade();
        if let Some(session) = session {
            let pgid = session.foreground_pgid();
            if pgid != 0 {
                let _ = signal::send_sig_pg(pgid, SigInfo::kernel(sig));
            }
        }
    }

    fn ioctl(&self, request: u32, arg: usize, arg_user: bool) -> KernelResult<usize> {
        match request {
            TCGETS => {
                let termios = self.inner.lock().termios;
                put_arg(arg, arg_user, termios)?;
                Ok(0)
            }
            TCSETS | TCSETSW | TCSETSF => {
                let termios: Termios = get_arg(arg, arg_user)?;
                self.inner.lock().termios = termios;
                Ok(0)
            }
            TIOCGPGRP => {
                let session = self.session.lock().upgrade().ok_or(Errno::ENOTTY)?;
                put_arg(arg, arg_user, session.foreground_pgid() as u32)?;
                Ok(0)
            }
            TIOCSPGRP => {
                let pgid: u32 = get_arg(arg, arg_user)?;
                let session = self.session.lock().upgrade().ok_or(Errno::ENOTTY)?;
                session.set_foreground_pgid(pgid as Pid);
                Ok(0)
            }
            TIOCGSID => {
                let session = self.session.lock().upgrade().ok_or(Errno::ENOTTY)?;
                put_arg(arg, arg_user, session.sid() as u32)?;
                Ok(0)
            }
            TIOCGWINSZ => {
                put_arg(
                    arg,
                    arg_user,
                    Winsize {
                        row: NUM_ROWS as u16,
                        col: NUM_COLS as u16,
                        xpixel: 0,
                        ypixel: 0,
                    },
                )?;
                Ok(0)
            }
            _ => Err(Errno::ENOTTY),
        }
    }

    /// Physical frame currently backing this TTY's videomem.
    fn video_phys(&self) -> usize {
        let video = self.inner.lock().video;
        if video == VIDEO_ADDR {
            VIDEO_ADDR & !(PAGE_SIZE_SMALL - 1)
        } else {
            mm::paging::heap_phys(video)
        }
    }
}

fn get_arg<T: Copy>(arg: usize, arg_user: bool) -> KernelResult<T> {
    if arg_user {
        user::read_user(arg)
    } else {
        // SAFETY: kernel-side callers pass a valid kernel pointer.
        Ok(unsafe { core::ptr::read(arg as *const T) })
    }
}

fn put_arg<T: Copy>(arg: usize, arg_user: bool, value: T) -> KernelResult<()> {
    if arg_user {
        user::write_user(arg, value)
    } else {
        // SAFETY: kernel-side callers pass a valid kernel pointer.
        unsafe { core::ptr::write(arg as *mut T, value) };
        Ok(())
    }
}

lazy_static::lazy_static! {
    /// The virtual consoles, built on first touch (after the heap is up).
    /// Console 0 starts on the live VGA page; the rest draw into private
    /// pages until they are switched to the foreground.
    static ref TTYS: Vec<Arc<Tty>> = {
        let mut list = Vec::with_capacity(NUM_TTYS);
        for index in 0..NUM_TTYS {
            let video = if index == 0 {
                VIDEO_ADDR
            } else {
                mm::alloc_pages(1, 0, mm::Gfp::empty()).unwrap_or(VIDEO_ADDR)
            };
            list.push(Tty::new(index, video));
        }
        list
    };
}

static FOREGROUND: IrqLock<usize> = IrqLock::new(0);

/// One vidmap: a task aliasing a TTY's videomem at a user address.
struct Vidmap {
    pid: Pid,
    tty: usize,
    user_addr: usize,
}

static VIDMAPS: IrqLock<Vec<Vidmap>> = IrqLock::new(Vec::new());

fn ttys() -> &'static Vec<Arc<Tty>> {
    &TTYS
}

fn foreground_index() -> usize {
    *FOREGROUND.lock()
}

/// The TTY currently on screen.
pub fn foreground_tty() -> Arc<Tty> {
    ttys()[foreground_index()].clone()
}

/// Fetch a TTY by console index.
pub fn get_tty(index: usize) -> KernelResult<Arc<Tty>> {
    ttys().get(index).cloned().ok_or(Errno::ENXIO)
}

/// Keyboard collaborator entry point: one decoded character for the
/// foreground console.
pub fn receive_char(ch: u8, ctrl: bool, _alt: bool) {
    foreground_tty().input_char(ch, ctrl);
}

/// Kernel-side console output (printk path once the TTY owns the screen).
pub fn console_puts(s: &str) {
    foreground_tty().write_bytes(s.as_bytes());
}

/// Bring another console to the screen: swap videomem backings and rebind
/// every vidmap alias, then flush the TLB wholesale.
pub fn switch_foreground(index: usize) -> KernelResult<()> {
    let new_tty = get_tty(index)?;
    let old_index = {
        let mut fg = FOREGROUND.lock();
        let old = *fg;
        if old == index {
            return Ok(());
        }
        *fg = index;
        old
    };
    let old_tty = get_tty(old_index)?;

    {
        let mut old_inner = old_tty.inner.lock();
        let mut new_inner = new_tty.inner.lock();
        // The old foreground was drawing on the live VGA page; its private
        // page takes over. The new one moves onto the VGA page.
        let old_private = new_inner.video;
        debug_assert_eq!(old_inner.video, VIDEO_ADDR);
        // SAFETY: both pages are mapped, 4 KiB, non-overlapping.
        unsafe {
            core::ptr::copy_nonoverlapping(
                VIDEO_ADDR as *const u8,
                old_private as *mut u8,
                NUM_ROWS * NUM_COLS * 2,
            );
            core::ptr::copy_nonoverlapping(
                old_private as *const u8,
                VIDEO_ADDR as *mut u8,
                NUM_ROWS * NUM_COLS * 2,
            );
        }
        old_inner.video = old_private;
        new_inner.video = VIDEO_ADDR;
    }

    // Rebind vidmap aliases to the relocated backings.
    {
        let vidmaps = VIDMAPS.lock();
        for map in vidmaps.iter() {
            if let (Ok(task), Ok(tty)) = (task::get_task(map.pid), get_tty(map.tty)) {
                let mm = task.as_ref().mm.lock().clone();
                if let Some(mm) = mm {
                    let _ = mm::paging::rebind_alias(
                        mm.space.raw(),
                        map.user_addr,
                        tty.video_phys(),
                    );
                }
            }
        }
    }

    crate::arch::x86::cpu::flush_tlb();
    new_tty.commit_cursor();
    Ok(())
}

/// Map the calling task's terminal videomem into its address space and
/// return the user virtual address (the legacy `vidmap` service).
pub fn vidmap_current() -> KernelResult<usize> {
    let cur = task::current();
    let tty = match cur.session.lock().as_ref().and_then(|s| s.tty.lock().clone()) {
        Some(tty) => tty,
        None => foreground_tty(),
    };

    let user_addr = mm::alloc_pages(1, 0, mm::Gfp::USER)?;
    mm::paging::make_alias(user_addr, tty.video_phys())?;

    VIDMAPS.lock().push(Vidmap {
        pid: cur.pid(),
        tty: tty.index,
        user_addr,
    });
    Ok(user_addr)
}

/// Drop a task's vidmaps (exit path). The alias PTEs die with the address
/// space; only the bookkeeping goes here.
pub fn exit_vidmaps(pid: Pid) {
    VIDMAPS.lock().retain(|map| map.pid != pid);
}

struct TtyFileOps;

fn tty_of(file: &File) -> KernelResult<Arc<Tty>> {
    match &*file.private.lock() {
        Some(Private::Tty(tty)) => Ok(tty.clone()),
        _ => Err(Errno::ENOTTY),
    }
}

impl FileOps for TtyFileOps {
    fn open(&self, file: &Arc<File>, inode: &Arc<Inode>) -> KernelResult<()> {
        let dev = inode.rdev;
        let tty = if dev == TTY_CURRENT_DEV {
            match task::try_current()
                .and_then(|t| t.session.lock().clone())
                .and_then(|s| s.tty.lock().clone())
            {
                Some(tty) => tty,
                None => foreground_tty(),
            }
        } else {
            get_tty(dev.minor() as usize)?
        };

        // First open by a session leader with no controlling TTY takes it,
        // unless asked not to.
        if !file.flags.lock().contains(OpenFlags::NOCTTY) {
            if let Some(task) = task::try_current() {
                if let Some(session) = task.session.lock().clone() {
                    let mut sess_tty = session.tty.lock();
                    if sess_tty.is_none() && tty.session.lock().upgrade().is_none() {
                        *sess_tty = Some(tty.clone());
                        *tty.session.lock() = Arc::downgrade(&session);
                    }
                }
            }
        }

        *file.private.lock() = Some(Private::Tty(tty));
        Ok(())
    }

    fn read(&self, file: &File, buf: &mut [u8]) -> KernelResult<usize> {
        tty_of(file)?.read_line(buf)
    }

    fn write(&self, file: &File, buf: &[u8]) -> KernelResult<usize> {
        Ok(tty_of(file)?.write_bytes(buf))
    }

    fn seek(&self, _file: &File, _offset: i32, _whence: super::file::Whence) -> KernelResult<i32> {
        Err(Errno::ESPIPE)
    }

    fn ioctl(&self, file: &File, request: u32, arg: usize, arg_user: bool) -> KernelResult<usize> {
        tty_of(file)?.ioctl(request, arg, arg_user)
    }

    fn poll(&self, file: &File, wait: &mut PollTable) -> PollEvents {
        match tty_of(file) {
            Ok(tty) => {
                wait.wait_on(&tty.read_wait);
                let mut events = PollEvents::OUT;
                if tty.inner.lock().should_read() {
                    events |= PollEvents::IN;
                }
                events
            }
            Err(_) => PollEvents::NVAL,
        }
    }

    fn supports_read(&self) -> bool {
        true
    }

    fn supports_write(&self) -> bool {
        true
    }
}

/// Register the console devices.
pub fn init() {
    let _ = ttys();
    let ops: Arc<dyn FileOps> = Arc::new(TtyFileOps);
    device::register_dev(Mode::CHAR, DevId::any_minor(TTY_MAJOR), ops.clone());
    device::register_dev(Mode::CHAR, TTY_CURRENT_DEV, ops);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termios_default_is_canonical_echo() {
        let termios = Termios::console_default();
        assert!(termios.canonical());
        assert!(termios.lflag & ECHO != 0);
        assert_eq!(termios.cc[VINTR], 0x03);
        assert_eq!(termios.cc[VEOL], b'\n');
    }

    #[test]
    fn ansi_params_parse() {
        let mut state = AnsiState::new();
        for &b in b"12;34" {
            state.buf[state.len] = b;
            state.len += 1;
        }
        assert_eq!(state.params(), (12, 34));
        state.reset();
        assert_eq!(state.params(), (0, 0));
    }

    #[test]
    fn vga_color_mapping() {
        assert_eq!(vga_color(0), 0); // black
        assert_eq!(vga_color(1), 4); // red
        assert_eq!(vga_color(4), 1); // blue
        assert_eq!(vga_color(7), 7); // white
    }
}
