//! Process, signal and identity syscalls for the rich ABI.

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::x86::context::TrapFrame;
use crate::arch::x86::gdt;
use crate::error::{encode_sysret, Errno, KernelResult};
use crate::mm::{self, user, Gfp};
use crate::task::clone::{do_clone, CloneEntry, CloneFlags};
use crate::task::signal::{self, Disposition, Sig, SigAction, SigInfo};
use crate::task::{self, exec, exit, sched, session, Abi, UserDesc};
use crate::time::{self, Timespec};

use super::register;

fn sys_exit(frame: &mut TrapFrame) -> isize {
    let status = frame.ebx as i32;
    exit::do_exit(status.clamp(0, 255))
}

fn sys_exit_group(frame: &mut TrapFrame) -> isize {
    // One task per thread group for now; same as exit.
    sys_exit(frame)
}

fn sys_fork(frame: &mut TrapFrame) -> isize {
    let res = do_clone(
        CloneFlags::empty(),
        CloneEntry::UserFrame(frame as *const TrapFrame),
        0,
    );
    match res {
        Ok(child) => child.as_ref().pid() as isize,
        Err(e) => e.sysret(),
    }
}

/// Read a NULL-terminated user array of string pointers.
fn user_str_array(ptr: usize) -> KernelResult<Vec<String>> {
    let mut out = Vec::new();
    if ptr == 0 {
        return Ok(out);
    }
    let count = user::safe_arr_null_term(ptr, core::mem::size_of::<u32>(), false);
    for i in 0..count {
        let str_ptr: u32 = user::read_user(ptr + i * core::mem::size_of::<u32>())?;
        out.push(user::user_cstr(str_ptr as usize)?);
    }
    Ok(out)
}

fn sys_execve(frame: &mut TrapFrame) -> isize {
    let res = (|| -> KernelResult<usize> {
        let path = user::user_cstr(frame.ebx as usize)?;
        let argv = user_str_array(frame.ecx as usize)?;
        let envp = user_str_array(frame.edx as usize)?;
        exec::do_execve(frame, &path, argv, envp)
    })();
    encode_sysret(res)
}

// <uapi/linux/wait.h>
const WNOHANG: u32 = 1;

fn do_waitpid(pid: i32, wstatus: usize, options: u32) -> KernelResult<usize> {
    let block = options & WNOHANG == 0;

    let (child_pid, status) = if pid < 1 {
        let pgid = match pid {
            -1 => 0,
            0 => task::current().pgid(),
            p => (-p) as task::Pid,
        };
        exit::do_waitpg(pgid, block)?
    } else {
        let target = task::get_task(pid as task::Pid)?;
        if target.as_ref().state() != task::TaskState::Zombie && !block {
            return Ok(0);
        }
        let status = exit::do_wait(target)?;
        (pid as task::Pid, status)
    };

    if wstatus != 0 {
        // Best effort, as ever: a bad status pointer loses the status but
        // not the reaped child.
        let _ = user::write_user(wstatus, status);
    }
    Ok(child_pid as usize)
}

fn sys_waitpid(frame: &mut TrapFrame) -> isize {
    encode_sysret(do_waitpid(
        frame.ebx as i32,
        frame.ecx as usize,
        frame.edx,
    ))
}

fn sys_wait4(frame: &mut TrapFrame) -> isize {
    // rusage (esi) is accepted and ignored.
    encode_sysret(do_waitpid(
        frame.ebx as i32,
        frame.ecx as usize,
        frame.edx,
    ))
}

fn sys_getpid(_frame: &mut TrapFrame) -> isize {
    sched::current().pid() as isize
}

fn sys_getppid(_frame: &mut TrapFrame) -> isize {
    sched::current().ppid() as isize
}

fn sys_setsid(_frame: &mut TrapFrame) -> isize {
    encode_sysret(session::do_setsid())
}

fn sys_kill(frame: &mut TrapFrame) -> isize {
    let res = (|| -> KernelResult<usize> {
        let pid = frame.ebx as i32;
        let sig = Sig::new(frame.ecx).ok_or(Errno::EINVAL)?;
        let info = SigInfo {
            sig,
            pid: sched::current().pid(),
            status: 0,
        };
        if pid > 0 {
            let target = task::get_task(pid as task::Pid)?;
            signal::send_sig_info(target.as_ref(), info);
            Ok(0)
        } else {
            let pgid = match pid {
                0 => sched::current().pgid(),
                -1 => return Err(Errno::EPERM),
                p => (-p) as task::Pid,
            };
            signal::send_sig_pg(pgid, info)?;
            Ok(0)
        }
    })();
    encode_sysret(res)
}

fn sys_brk(frame: &mut TrapFrame) -> isize {
    let addr = frame.ebx as usize;
    let cur = sched::current();
    let mm = match cur.mm.lock().clone() {
        Some(mm) => mm,
        None => return Errno::ENOMEM.sysret(),
    };

    use core::sync::atomic::Ordering;
    let cur_brk = mm.brk.load(Ordering::Acquire);
    if addr == 0 {
        return cur_brk as isize;
    }

    let brk_page = |a: usize| (a.saturating_sub(1) >> 12) + 1;
    let new_idx = brk_page(addr);
    let cur_idx = brk_page(cur_brk);

    if new_idx > cur_idx {
        if mm::request_pages(cur_idx << 12, new_idx - cur_idx, Gfp::USER).is_err() {
            // brk reports failure by returning the old break.
            return cur_brk as isize;
        }
    } else if addr < cur_brk {
        mm::free_pages(new_idx << 12, cur_idx - new_idx, Gfp::USER);
    }

    mm.brk.store(addr, Ordering::Release);
    addr as isize
}

// Classic sigaction constants.
const SIG_DFL: u32 = 0;
const SIG_IGN: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy)]
struct LinuxSigaction {
    handler: u32,
    flags: u32,
    restorer: u32,
    mask: u32,
}

fn sys_rt_sigaction(frame: &mut TrapFrame) -> isize {
    let res = (|| -> KernelResult<usize> {
        let sig = Sig::new(frame.ebx).ok_or(Errno::EINVAL)?;
        if sig == Sig::KILL || sig == Sig::STOP {
            return Err(Errno::EINVAL);
        }
        let act_ptr = frame.ecx as usize;
        let oldact_ptr = frame.edx as usize;

        let actions = sched::current().sigactions.lock().clone();

        if oldact_ptr != 0 {
            let old = actions.get(sig);
            let handler = match old.disposition {
                Disposition::Default => SIG_DFL,
                Disposition::Ignore => SIG_IGN,
                Disposition::Handler(h) => h as u32,
            };
            user::write_user(
                oldact_ptr,
                LinuxSigaction {
                    handler,
                    flags: old.flags,
                    restorer: 0,
                    mask: old.mask,
                },
            )?;
        }

        if act_ptr != 0 {
            let act: LinuxSigaction = user::read_user(act_ptr)?;
            let disposition = match act.handler {
                SIG_DFL => Disposition::Default,
                SIG_IGN => Disposition::Ignore,
                handler => Disposition::Handler(handler as usize),
            };
            actions.set(
                sig,
                SigAction {
                    disposition,
                    mask: act.mask,
                    flags: act.flags,
                },
            );
        }
        Ok(0)
    })();
    encode_sysret(res)
}

fn sys_sigreturn(frame: &mut TrapFrame) -> isize {
    signal::sigreturn(frame);
    frame.eax as isize
}

fn sys_nanosleep(frame: &mut TrapFrame) -> isize {
    let res = (|| -> KernelResult<usize> {
        let req: Timespec = user::read_user(frame.ebx as usize)?;
        let rem_ptr = frame.ecx as usize;

        let mut rem = Timespec::default();
        let res = time::nanosleep(req, Some(&mut rem));
        if rem_ptr != 0 {
            let _ = user::write_user(rem_ptr, rem);
        }
        res.map(|_| 0)
    })();
    encode_sysret(res)
}

fn sys_time(frame: &mut TrapFrame) -> isize {
    let now = time::wall_time();
    if frame.ebx != 0 && user::write_user(frame.ebx as usize, now).is_err() {
        return Errno::EFAULT.sysret();
    }
    now as isize
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Utsname {
    sysname: [u8; 65],
    nodename: [u8; 65],
    release: [u8; 65],
    version: [u8; 65],
    machine: [u8; 65],
    domainname: [u8; 65],
}

fn uts_field(s: &str) -> [u8; 65] {
    let mut field = [0u8; 65];
    field[..s.len().min(64)].copy_from_slice(&s.as_bytes()[..s.len().min(64)]);
    field
}

fn sys_uname(frame: &mut TrapFrame) -> isize {
    // Certain user programs check these strings before doing anything.
    let uts = Utsname {
        sysname: uts_field("Linux"),
        nodename: uts_field("localhost"),
        release: uts_field("5.0-cinder"),
        version: uts_field("#1"),
        machine: uts_field("i686"),
        domainname: uts_field("localdomain"),
    };
    encode_sysret(user::write_user(frame.ebx as usize, uts).map(|_| 0))
}

// Everything runs as root; nonzero ids are not a thing yet.
fn sys_getuid(_frame: &mut TrapFrame) -> isize {
    0
}

fn sys_setuid(frame: &mut TrapFrame) -> isize {
    if frame.ebx != 0 {
        Errno::EINVAL.sysret()
    } else {
        0
    }
}

/// The user descriptor set_thread_area exchanges.
#[repr(C)]
#[derive(Clone, Copy)]
struct RawUserDesc {
    entry_number: i32,
    base_addr: u32,
    limit: u32,
    flags: u32,
}

const UD_LIMIT_IN_PAGES: u32 = 1 << 1;

fn sys_set_thread_area(frame: &mut TrapFrame) -> isize {
    let res = (|| -> KernelResult<usize> {
        let ptr = frame.ebx as usize;
        let mut desc: RawUserDesc = user::read_user(ptr)?;

        let tls_entry = (gdt::TLS_SELECTOR.bits() >> 3) as i32;
        if desc.entry_number == -1 {
            desc.entry_number = tls_entry;
        } else if desc.entry_number != tls_entry {
            // One slot only.
            return Err(Errno::EINVAL);
        }

        let user_desc = UserDesc {
            base: desc.base_addr,
            limit: desc.limit,
            limit_in_pages: desc.flags & UD_LIMIT_IN_PAGES != 0,
        };
        *sched::current().tls.lock() = Some(user_desc);
        gdt::set_tls(user_desc.base, user_desc.limit, user_desc.limit_in_pages);

        user::write_user(ptr, desc)?;
        Ok(0)
    })();
    encode_sysret(res)
}

// i386 syscall numbers.
const NR_EXIT: usize = 1;
const NR_FORK: usize = 2;
const NR_WAITPID: usize = 7;
const NR_EXECVE: usize = 11;
const NR_TIME: usize = 13;
const NR_GETPID: usize = 20;
const NR_KILL: usize = 37;
const NR_BRK: usize = 45;
const NR_GETPPID: usize = 64;
const NR_SETSID: usize = 66;
const NR_WAIT4: usize = 114;
const NR_SIGRETURN: usize = 119;
const NR_UNAME: usize = 122;
const NR_NANOSLEEP: usize = 162;
const NR_RT_SIGRETURN: usize = 173;
const NR_RT_SIGACTION: usize = 174;
const NR_GETUID32: usize = 199;
const NR_GETGID32: usize = 200;
const NR_GETEUID32: usize = 201;
const NR_GETEGID32: usize = 202;
const NR_SETUID32: usize = 213;
const NR_SETGID32: usize = 214;
const NR_SET_THREAD_AREA: usize = 243;
const NR_EXIT_GROUP: usize = 252;

pub(super) fn register_all() {
    use Abi::Linux;
    register(Linux, NR_EXIT, sys_exit);
    register(Linux, NR_FORK, sys_fork);
    register(Linux, NR_WAITPID, sys_waitpid);
    register(Linux, NR_EXECVE, sys_execve);
    register(Linux, NR_TIME, sys_time);
    register(Linux, NR_GETPID, sys_getpid);
    register(Linux, NR_KILL, sys_kill);
    register(Linux, NR_BRK, sys_brk);
    register(Linux, NR_GETPPID, sys_getppid);
    register(Linux, NR_SETSID, sys_setsid);
    register(Linux, NR_WAIT4, sys_wait4);
    register(Linux, NR_SIGRETURN, sys_sigreturn);
    register(Linux, NR_UNAME, sys_uname);
    register(Linux, NR_NANOSLEEP, sys_nanosleep);
    register(Linux, NR_RT_SIGRETURN, sys_sigreturn);
    register(Linux, NR_RT_SIGACTION, sys_rt_sigaction);
    register(Linux, NR_GETUID32, sys_getuid);
    register(Linux, NR_GETGID32, sys_getuid);
    register(Linux, NR_GETEUID32, sys_getuid);
    register(Linux, NR_GETEGID32, sys_getuid);
    register(Linux, NR_SETUID32, sys_setuid);
    register(Linux, NR_SETGID32, sys_setuid);
    register(Linux, NR_SET_THREAD_AREA, sys_set_thread_area);
    register(Linux, NR_EXIT_GROUP, sys_exit_group);
}
