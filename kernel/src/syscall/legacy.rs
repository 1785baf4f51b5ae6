//! The legacy ABI's ten services.
//!
//! Flat numbering, register args, and a few deliberate compatibility
//! quirks: at most eight descriptors, stdin/stdout are unclosable, and
//! every error collapses to `-1` in the dispatcher.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::x86::context::{resume_frame, TrapFrame};
use crate::error::{encode_sysret, Errno, KernelResult};
use crate::fs::tty;
use crate::mm::user;
use crate::task::clone::{do_clone, CloneEntry, CloneFlags};
use crate::task::exec::{self, LEGACY_ARGS_ADDR, LEGACY_ARGS_MAX};
use crate::task::signal::{self, Disposition, SigAction};
use crate::task::{exit, sched, Abi};

use super::file::{do_close, do_openat, do_read, do_write, AT_FDCWD};
use super::register;
use crate::fs::{Mode, OpenFlags};

/// Descriptor ceiling the legacy environment promises.
const LEGACY_MAX_FD: usize = 8;

fn sys_halt(frame: &mut TrapFrame) -> isize {
    exit::do_exit((frame.ebx & 0xff) as i32)
}

/// Arguments carried into the child of `execute`.
struct SpawnArgs {
    path: String,
    argv: Vec<String>,
}

/// Child side of `execute`: replace the cloned image, then drop to user
/// mode through the rebuilt entry frame.
fn spawn_child(arg: usize) -> i32 {
    // SAFETY: the parent leaked exactly one SpawnArgs for us.
    let args = unsafe { Box::from_raw(arg as *mut SpawnArgs) };
    let task = sched::current();
    let frame = task.entry_frame();

    // SAFETY: the entry frame slot at our stack top is ours alone.
    unsafe {
        let argv = args.argv.clone();
        if exec::do_execve(&mut *frame, &args.path, argv, Vec::new()).is_err() {
            // Could not load: exit with the legacy "cannot execute" status.
            return -1;
        }
        signal::deliver_signals(&mut *frame);
        resume_frame(frame)
    }
}

/// `execute`: run a program and block until it finishes, returning its
/// legacy status (exit code, or 256 when a signal killed it).
fn do_execute(cmd_ptr: usize) -> KernelResult<usize> {
    let cmd = user::user_cstr(cmd_ptr)?;
    let cmd = cmd.trim();
    if cmd.is_empty() {
        return Err(Errno::ENOENT);
    }

    let mut parts = cmd.splitn(2, ' ');
    let prog = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    let mut path = String::from("/");
    path.push_str(prog);

    // Report a missing or unopenable program before forking anything.
    crate::fs::file::File::open(&path, OpenFlags::empty())?;

    let mut argv = Vec::new();
    argv.push(String::from(prog));
    if !rest.is_empty() {
        argv.push(String::from(rest));
    }

    let spawn = Box::new(SpawnArgs { path, argv });
    let child = do_clone(
        CloneFlags::empty(),
        CloneEntry::Kernel {
            func: spawn_child,
            arg: Box::into_raw(spawn) as usize,
        },
        0,
    )?;

    let status = exit::do_wait(child)?;
    Ok(exit::legacy_status(status) as usize)
}

fn sys_execute(frame: &mut TrapFrame) -> isize {
    encode_sysret(do_execute(frame.ebx as usize))
}

fn sys_read(frame: &mut TrapFrame) -> isize {
    encode_sysret(do_read(
        frame.ebx as usize,
        frame.ecx as usize,
        frame.edx as usize,
    ))
}

fn sys_write(frame: &mut TrapFrame) -> isize {
    encode_sysret(do_write(
        frame.ebx as usize,
        frame.ecx as usize,
        frame.edx as usize,
    ))
}

fn sys_open(frame: &mut TrapFrame) -> isize {
    let res = (|| -> KernelResult<usize> {
        let fd = do_openat(
            AT_FDCWD,
            frame.ebx as usize,
            OpenFlags::RDWR,
            Mode::from_bits(0),
        )?;
        if fd >= LEGACY_MAX_FD {
            let _ = do_close(fd);
            return Err(Errno::ENFILE);
        }
        Ok(fd)
    })();
    encode_sysret(res)
}

fn sys_close(frame: &mut TrapFrame) -> isize {
    let fd = frame.ebx as usize;
    // stdin/stdout are wired shut in this environment.
    if fd == 0 || fd == 1 {
        return Errno::EIO.sysret();
    }
    encode_sysret(do_close(fd))
}

/// `getargs`: hand back the argument string the loader parked in the
/// process image.
fn do_getargs(buf: usize, nbytes: usize) -> KernelResult<usize> {
    let len = user::safe_arr_null_term(LEGACY_ARGS_ADDR, 1, false).min(LEGACY_ARGS_MAX - 1);
    if len == 0 {
        // No arguments were passed.
        let first: u8 = user::read_user(LEGACY_ARGS_ADDR)?;
        if first != 0 {
            return Err(Errno::EFAULT);
        }
    }
    if nbytes < len + 1 {
        return Err(Errno::EINVAL);
    }

    let mut scratch = alloc::vec![0u8; len + 1];
    user::copy_from_user(&mut scratch[..len], LEGACY_ARGS_ADDR)?;
    scratch[len] = 0;
    user::copy_to_user(buf, &scratch)?;
    Ok(0)
}

fn sys_getargs(frame: &mut TrapFrame) -> isize {
    encode_sysret(do_getargs(frame.ebx as usize, frame.ecx as usize))
}

/// `vidmap`: alias the terminal's videomem into the caller and store the
/// user address through `screen_start`.
fn do_vidmap(screen_start: usize) -> KernelResult<usize> {
    // The pointer itself must live in user memory.
    if user::safe_buf(screen_start, core::mem::size_of::<u32>(), true)
        != core::mem::size_of::<u32>()
    {
        return Err(Errno::EFAULT);
    }
    let addr = tty::vidmap_current()?;
    user::write_user(screen_start, addr as u32)?;
    Ok(addr)
}

fn sys_vidmap(frame: &mut TrapFrame) -> isize {
    encode_sysret(do_vidmap(frame.ebx as usize))
}

fn sys_set_handler(frame: &mut TrapFrame) -> isize {
    let res = (|| -> KernelResult<usize> {
        let sig = signal::legacy_sig_from(frame.ebx).ok_or(Errno::EINVAL)?;
        let handler = frame.ecx as usize;
        let disposition = if handler == 0 {
            Disposition::Default
        } else {
            Disposition::Handler(handler)
        };
        sched::current().sigactions.lock().set(
            sig,
            SigAction {
                disposition,
                mask: 0,
                flags: 0,
            },
        );
        Ok(0)
    })();
    encode_sysret(res)
}

fn sys_sigreturn(frame: &mut TrapFrame) -> isize {
    signal::sigreturn(frame);
    frame.eax as isize
}

const NR_HALT: usize = 1;
const NR_EXECUTE: usize = 2;
const NR_READ: usize = 3;
const NR_WRITE: usize = 4;
const NR_OPEN: usize = 5;
const NR_CLOSE: usize = 6;
const NR_GETARGS: usize = 7;
const NR_VIDMAP: usize = 8;
const NR_SET_HANDLER: usize = 9;
const NR_SIGRETURN: usize = 10;

pub(super) fn register_all() {
    use Abi::Legacy;
    register(Legacy, NR_HALT, sys_halt);
    register(Legacy, NR_EXECUTE, sys_execute);
    register(Legacy, NR_READ, sys_read);
    register(Legacy, NR_WRITE, sys_write);
    register(Legacy, NR_OPEN, sys_open);
    register(Legacy, NR_CLOSE, sys_close);
    register(Legacy, NR_GETARGS, sys_getargs);
    register(Legacy, NR_VIDMAP, sys_vidmap);
    register(Legacy, NR_SET_HANDLER, sys_set_handler);
    register(Legacy, NR_SIGRETURN, sys_sigreturn);
}
