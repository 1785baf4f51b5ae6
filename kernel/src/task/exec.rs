//! Program execution.
//!
//! Opens and validates an ELF32 executable, decides the ABI flavour, and
//! rebuilds the calling task around the new image: fresh address space,
//! cloexec-filtered (or default) file table, reset signal actions, zeroed
//! FPU and TLS state. Past the point of no return any failure turns into a
//! forced SIGSEGV instead of an error return.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::x86::context::TrapFrame;
use crate::arch::x86::cpu::{self, EFLAGS_BASE, EFLAGS_IF};
use crate::arch::x86::gdt;
use crate::elf::{Elf32Header, Elf32ProgramHeader, PT_DYNAMIC, PT_INTERP, PT_LOAD};
use crate::error::{Errno, KernelResult};
use crate::fs::fd_table::FdTable;
use crate::fs::file::{File, Whence};
use crate::fs::tty::TTY_CURRENT_DEV;
use crate::fs::{Mode, OpenFlags};
use crate::mm::{self, user, AddressSpace, Gfp, PAGE_SIZE_LARGE, PAGE_SIZE_SMALL};

use super::signal::{self, Sig};
use super::{sched, Abi, Mm, TaskState};

/// Fixed 4 MiB window the legacy ABI maps executables into.
pub const LEGACY_PAGE_ADDR: usize = 0x0800_0000;
/// Offset of the image within the window.
pub const LEGACY_MAP_OFFSET: usize = 0x48000;
/// Where the argument string lives for `getargs`.
pub const LEGACY_ARGS_ADDR: usize = LEGACY_PAGE_ADDR;
/// Cap on the legacy argument string.
pub const LEGACY_ARGS_MAX: usize = LEGACY_MAP_OFFSET;

/// Top-of-stack for rich-ABI processes: one 4 MiB page below 2 GiB.
const USER_STACK_TOP: usize = 2 << 30;
const USER_STACK_PAGE: usize = USER_STACK_TOP - PAGE_SIZE_LARGE;

/// Concurrent legacy-ABI user process cap, a compatibility quirk the
/// legacy test suite expects.
const LEGACY_MAX_TASKS: usize = 6;

// aux vector types, <uapi/linux/auxvec.h> numbering
const AT_NULL: u32 = 0;
const AT_PHDR: u32 = 3;
const AT_PHENT: u32 = 4;
const AT_PHNUM: u32 = 5;
const AT_PAGESZ: u32 = 6;
const AT_BASE: u32 = 7;
const AT_ENTRY: u32 = 9;
const AT_UID: u32 = 11;
const AT_EUID: u32 = 12;
const AT_GID: u32 = 13;
const AT_EGID: u32 = 14;
const AT_HWCAP: u32 = 16;
const AT_RANDOM: u32 = 25;

#[repr(C)]
#[derive(Clone, Copy)]
struct Auxv {
    a_type: u32,
    a_val: u32,
}

/// Weak stack-cookie entropy; a real RNG is a driver concern.
static PRNG_STATE: AtomicU32 = AtomicU32::new(0x9e37_79b9);

fn prng_u32() -> u32 {
    let mut x = PRNG_STATE.load(Ordering::Relaxed) ^ crate::time::ticks() as u32;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    PRNG_STATE.store(x, Ordering::Relaxed);
    x
}

fn read_exact_at(file: &Arc<File>, pos: i32, buf: &mut [u8]) -> KernelResult<()> {
    if file.seek(pos, Whence::Set)? != pos {
        return Err(Errno::ENOEXEC);
    }
    if file.read(buf)? != buf.len() {
        return Err(Errno::ENOEXEC);
    }
    Ok(())
}

fn push(frame: &mut TrapFrame, bytes: &[u8]) -> KernelResult<u32> {
    let esp = (frame.esp as usize)
        .checked_sub(bytes.len())
        .ok_or(Errno::EFAULT)?;
    user::copy_to_user(esp, bytes)?;
    frame.esp = esp as u32;
    Ok(frame.esp)
}

fn push_u32(frame: &mut TrapFrame, value: u32) -> KernelResult<u32> {
    push(frame, &value.to_le_bytes())
}

fn push_auxv(frame: &mut TrapFrame, a_type: u32, a_val: u32) -> KernelResult<()> {
    push_u32(frame, a_val)?;
    push_u32(frame, a_type)?;
    Ok(())
}

/// The legacy image format is an ELF with exactly three load segments; the
/// rich ABI gets everything else.
fn decide_abi(header: &Elf32Header) -> Abi {
    if header.phnum == 3 {
        Abi::Legacy
    } else {
        Abi::Linux
    }
}

/// Replace the current process image. `frame` is the caller's syscall trap
/// frame; on success it is rewritten to enter the new program.
pub fn do_execve(
    frame: &mut TrapFrame,
    path: &str,
    argv: Vec<String>,
    envp: Vec<String>,
) -> KernelResult<usize> {
    let cur = sched::current();

    let exe = File::open(path, OpenFlags::empty())?;

    let mut header_bytes = [0u8; core::mem::size_of::<Elf32Header>()];
    read_exact_at(&exe, 0, &mut header_bytes)?;
    let header = Elf32Header::parse(&header_bytes)?;
    let abi = decide_abi(&header);

    if abi == Abi::Legacy {
        // The legacy environment promises at most six concurrent user
        // processes and programs rely on it.
        let running = super::count_tasks(|t| {
            t.abi() == Abi::Legacy
                && t.mm.lock().is_some()
                && t.pid() != cur.pid()
                && t.state() != TaskState::Zombie
        });
        if running >= LEGACY_MAX_TASKS {
            return Err(Errno::EAGAIN);
        }
    }

    // Reject dynamic executables before committing.
    let mut phdrs = Vec::with_capacity(header.phnum as usize);
    for i in 0..header.phnum as usize {
        let mut phdr_bytes = [0u8; core::mem::size_of::<Elf32ProgramHeader>()];
        let pos = header.phoff as usize + i * core::mem::size_of::<Elf32ProgramHeader>();
        read_exact_at(&exe, pos as i32, &mut phdr_bytes)?;
        let phdr = Elf32ProgramHeader::parse(&phdr_bytes)?;
        if phdr.p_type == PT_DYNAMIC || phdr.p_type == PT_INTERP {
            return Err(Errno::ENOEXEC);
        }
        phdrs.push(phdr);
    }

    if cur.cwd.lock().is_none() {
        *cur.cwd.lock() = Some(File::open("/", OpenFlags::empty())?);
    }

    // ---- Point of no return. Failures below force SIGSEGV on self. ----

    *frame = TrapFrame {
        eflags: EFLAGS_BASE | EFLAGS_IF,
        cs: gdt::USER_CS.bits() as u32,
        ds: gdt::USER_DS.bits() as u32,
        es: gdt::USER_DS.bits() as u32,
        fs: gdt::USER_DS.bits() as u32,
        gs: gdt::USER_DS.bits() as u32,
        ss: gdt::USER_DS.bits() as u32,
        ..TrapFrame::default()
    };

    *cur.exe.lock() = Some(exe.clone());
    cur.set_comm(path.rsplit('/').next().unwrap_or(path));
    cur.set_abi(abi);

    // File table: filter close-on-exec handles, or provide the default
    // console descriptors for a fresh table.
    let existing = cur.files.lock().clone();
    match existing {
        Some(files) => files.close_cloexec(),
        None => {
            let files = FdTable::new();
            match abi {
                Abi::Linux => {
                    let tty = File::open_anon_device(
                        TTY_CURRENT_DEV,
                        Mode::CHAR | Mode::from_bits(0o666),
                        OpenFlags::RDWR,
                    );
                    if let Ok(tty) = tty {
                        let _ = files.install(tty.clone());
                        let _ = files.install(tty.clone());
                        let _ = files.install(tty);
                    }
                }
                Abi::Legacy => {
                    if let Ok(tty) = File::open_anon_device(
                        TTY_CURRENT_DEV,
                        Mode::CHAR | Mode::from_bits(0o666),
                        OpenFlags::empty(),
                    ) {
                        let _ = files.install(tty);
                    }
                    if let Ok(tty) = File::open_anon_device(
                        TTY_CURRENT_DEV,
                        Mode::CHAR | Mode::from_bits(0o666),
                        OpenFlags::WRONLY,
                    ) {
                        let _ = files.install(tty);
                    }
                }
            }
            *cur.files.lock() = Some(Arc::new(files));
        }
    }

    // Signal state: private table, handlers reset, pending cleared.
    {
        let mut actions = cur.sigactions.lock();
        if Arc::strong_count(&*actions) > 1 {
            *actions = Arc::new(actions.clone_table());
        }
        actions.reset_for_exec();
    }
    {
        let mut pending = cur.pending.lock();
        pending.pending = 0;
        pending.forced = 0;
    }

    // Fresh address space; dropping the old one frees every user mapping.
    let space = match AddressSpace::new() {
        Ok(s) => s,
        Err(_) => return force_segv(),
    };
    let mm = Arc::new(Mm::new(space));
    *cur.mm.lock() = Some(mm.clone());
    mm.space.activate();

    // Zeroed coprocessor and TLS state for the new image.
    *cur.fpu.lock() = None;
    cpu::fpu_init();
    *cur.tls.lock() = None;
    gdt::clear_tls();

    let res = match abi {
        Abi::Linux => load_linux(frame, &exe, &header, &phdrs, &mm, &argv, &envp),
        Abi::Legacy => load_legacy(frame, &exe, &argv),
    };
    match res {
        Ok(()) => Ok(0),
        Err(_) => force_segv(),
    }
}

fn force_segv() -> KernelResult<usize> {
    signal::force_sig_current(Sig::SEGV);
    Ok(0)
}

fn load_linux(
    frame: &mut TrapFrame,
    exe: &Arc<File>,
    header: &Elf32Header,
    phdrs: &[Elf32ProgramHeader],
    mm: &Arc<Mm>,
    argv: &[String],
    envp: &[String],
) -> KernelResult<()> {
    let mut file_hdraddr = 0u32;

    for phdr in phdrs {
        if phdr.p_type != PT_LOAD || phdr.memsz == 0 {
            continue;
        }
        let filesz = phdr.filesz.min(phdr.memsz) as usize;

        let map_addr = phdr.vaddr as usize & !(PAGE_SIZE_SMALL - 1);
        let map_end = phdr.vaddr as usize + phdr.memsz as usize;
        let num_pages = (map_end - map_addr).div_ceil(PAGE_SIZE_SMALL);

        let mut gfp = Gfp::USER;
        if !phdr.is_writable() {
            gfp |= Gfp::RO;
        }
        mm::request_pages(map_addr, num_pages, gfp)?;

        if filesz > 0 {
            if exe.seek(phdr.offset as i32, Whence::Set)? != phdr.offset as i32 {
                return Err(Errno::EIO);
            }
            // SAFETY: the segment range was just mapped in the active
            // directory; CoW cannot apply to a fresh mapping. BSS beyond
            // filesz is already zero from request_pages.
            let dst =
                unsafe { core::slice::from_raw_parts_mut(phdr.vaddr as usize as *mut u8, filesz) };
            if exe.read(dst)? != filesz {
                return Err(Errno::EIO);
            }
        }

        if phdr.is_writable() {
            // brk lands after the highest writable segment.
            if mm.brk.load(Ordering::Acquire) == 0 || phdr.filesz != phdr.memsz {
                mm.brk.store(map_end, Ordering::Release);
            }
        }
        if phdr.offset == 0 {
            file_hdraddr = phdr.vaddr;
        }
    }

    frame.eip = header.entry;

    mm::request_pages(USER_STACK_PAGE, 1, Gfp::USER | Gfp::LARGE)?;
    frame.esp = USER_STACK_TOP as u32;

    // Environment and argument strings first, highest on the stack.
    let mut envp_ptrs = Vec::with_capacity(envp.len() + 1);
    for env in envp {
        let mut bytes = env.as_bytes().to_vec();
        bytes.push(0);
        envp_ptrs.push(push(frame, &bytes)?);
    }
    envp_ptrs.push(0);

    let mut argv_ptrs = Vec::with_capacity(argv.len() + 1);
    for arg in argv {
        let mut bytes = arg.as_bytes().to_vec();
        bytes.push(0);
        argv_ptrs.push(push(frame, &bytes)?);
    }
    argv_ptrs.push(0);

    let mut random = [0u8; 16];
    for chunk in random.chunks_mut(4) {
        chunk.copy_from_slice(&prng_u32().to_le_bytes());
    }
    let random_ptr = push(frame, &random)?;

    frame.esp &= !0xf;

    // auxv, terminator first (the stack grows down).
    push_auxv(frame, AT_NULL, 0)?;
    push_auxv(frame, AT_UID, 0)?;
    push_auxv(frame, AT_EUID, 0)?;
    push_auxv(frame, AT_GID, 0)?;
    push_auxv(frame, AT_EGID, 0)?;
    push_auxv(frame, AT_RANDOM, random_ptr)?;
    push_auxv(frame, AT_PHDR, file_hdraddr.wrapping_add(header.phoff))?;
    push_auxv(
        frame,
        AT_PHENT,
        core::mem::size_of::<Elf32ProgramHeader>() as u32,
    )?;
    push_auxv(frame, AT_PHNUM, header.phnum as u32)?;
    push_auxv(frame, AT_BASE, file_hdraddr)?;
    push_auxv(frame, AT_ENTRY, header.entry)?;
    push_auxv(frame, AT_PAGESZ, PAGE_SIZE_SMALL as u32)?;
    push_auxv(frame, AT_HWCAP, cpu::hwcap())?;

    // envp array, argv array, argc.
    for &ptr in envp_ptrs.iter().rev() {
        push_u32(frame, ptr)?;
    }
    for &ptr in argv_ptrs.iter().rev() {
        push_u32(frame, ptr)?;
    }
    push_u32(frame, argv.len() as u32)?;

    Ok(())
}

/// The legacy flavour maps the whole file at a fixed offset inside one
/// 4 MiB page, reads the entry point from image bytes 24..28, and parks
/// the argument string at the bottom of the window.
fn load_legacy(frame: &mut TrapFrame, exe: &Arc<File>, argv: &[String]) -> KernelResult<()> {
    mm::request_pages(LEGACY_PAGE_ADDR, 1, Gfp::USER | Gfp::LARGE)?;

    if exe.seek(0, Whence::Set)? != 0 {
        return Err(Errno::EIO);
    }
    let image_max = PAGE_SIZE_LARGE - LEGACY_MAP_OFFSET;
    // SAFETY: the window was just mapped writable in the active directory.
    let dst = unsafe {
        core::slice::from_raw_parts_mut((LEGACY_PAGE_ADDR + LEGACY_MAP_OFFSET) as *mut u8, image_max)
    };
    let read = exe.read(dst)?;
    if read < 28 {
        return Err(Errno::ENOEXEC);
    }

    let entry = u32::from_le_bytes([dst[24], dst[25], dst[26], dst[27]]);
    frame.eip = entry;
    frame.esp = (LEGACY_PAGE_ADDR + PAGE_SIZE_LARGE) as u32;

    // Argument string (second argv word onward) for getargs.
    let args = argv.get(1).map(String::as_str).unwrap_or("");
    let mut bytes = args.as_bytes()[..args.len().min(LEGACY_ARGS_MAX - 1)].to_vec();
    bytes.push(0);
    user::copy_to_user(LEGACY_ARGS_ADDR, &bytes)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_decision_by_phnum() {
        let mut header = crate::elf::Elf32Header {
            magic: crate::elf::ELF_MAGIC,
            class: 1,
            endian: 1,
            header_version: 1,
            abi: 0,
            padding: [0; 8],
            elf_type: 2,
            machine: 3,
            version: 1,
            entry: 0x0804_8000,
            phoff: 52,
            shoff: 0,
            flags: 0,
            ehsize: 52,
            phentsize: 32,
            phnum: 3,
            shentsize: 0,
            shnum: 0,
            shstrndx: 0,
        };
        assert_eq!(decide_abi(&header), Abi::Legacy);
        header.phnum = 5;
        assert_eq!(decide_abi(&header), Abi::Linux);
    }

    #[test]
    fn legacy_window_constants() {
        assert_eq!(LEGACY_PAGE_ADDR + LEGACY_MAP_OFFSET, 0x0804_8000);
        assert!(LEGACY_ARGS_MAX <= LEGACY_MAP_OFFSET);
    }
}
