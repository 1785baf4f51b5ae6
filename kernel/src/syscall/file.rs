//! File syscalls for the rich ABI.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::x86::context::TrapFrame;
use crate::error::{encode_sysret, Errno, KernelResult};
use crate::fs::fd_table::FdTable;
use crate::fs::file::{File, Whence};
use crate::fs::poll::{PollEvents, PollTable};
use crate::fs::{mount, pipe, socket, Mode, OpenFlags, Path};
use crate::mm::user;
use crate::task::{self, Abi};
use crate::time::{self, Timespec};

use super::register;
use crate::task::sched;

pub(super) const AT_FDCWD: i32 = -100;

fn current_files() -> KernelResult<Arc<FdTable>> {
    task::current().files.lock().clone().ok_or(Errno::EBADF)
}

fn fd_file(fd: usize) -> KernelResult<Arc<File>> {
    current_files()?.get(fd)
}

pub(super) fn do_read(fd: usize, buf: usize, nbytes: usize) -> KernelResult<usize> {
    let file = fd_file(fd)?;
    let safe = user::safe_buf(buf, nbytes, true);
    if safe == 0 && nbytes != 0 {
        return Err(Errno::EFAULT);
    }
    // SAFETY: the prefix was validated writable; CoW pages were split.
    let slice = unsafe { core::slice::from_raw_parts_mut(buf as *mut u8, safe) };
    file.read(slice)
}

pub(super) fn do_write(fd: usize, buf: usize, nbytes: usize) -> KernelResult<usize> {
    let file = fd_file(fd)?;
    let safe = user::safe_buf(buf, nbytes, false);
    if safe == 0 && nbytes != 0 {
        return Err(Errno::EFAULT);
    }
    // SAFETY: validated readable.
    let slice = unsafe { core::slice::from_raw_parts(buf as *const u8, safe) };
    file.write(slice)
}

pub(super) fn do_openat(
    dfd: i32,
    path_ptr: usize,
    flags: OpenFlags,
    mode: Mode,
) -> KernelResult<usize> {
    let path = user::user_cstr(path_ptr)?;
    let start = if dfd == AT_FDCWD {
        None
    } else {
        Some(fd_file(dfd as usize)?)
    };
    let file = File::open_at(start, &path, flags, mode)?;
    let files = current_files()?;
    let fd = files.install(file)?;
    if flags.contains(OpenFlags::CLOEXEC) {
        files.set_cloexec(fd, true)?;
    }
    Ok(fd)
}

pub(super) fn do_close(fd: usize) -> KernelResult<usize> {
    current_files()?.close(fd)?;
    Ok(0)
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
    encode_sysret(do_openat(
        AT_FDCWD,
        frame.ebx as usize,
        OpenFlags::from_bits_truncate(frame.ecx),
        Mode::from_bits(frame.edx as u16),
    ))
}

fn sys_openat(frame: &mut TrapFrame) -> isize {
    encode_sysret(do_openat(
        frame.ebx as i32,
        frame.ecx as usize,
        OpenFlags::from_bits_truncate(frame.edx),
        Mode::from_bits(frame.esi as u16),
    ))
}

fn sys_close(frame: &mut TrapFrame) -> isize {
    encode_sysret(do_close(frame.ebx as usize))
}

fn sys_llseek(frame: &mut TrapFrame) -> isize {
    let fd = frame.ebx as usize;
    let offset_high = frame.ecx;
    let offset_low = frame.edx;
    let result_ptr = frame.esi as usize;
    let whence = frame.edi;

    let res = (|| -> KernelResult<usize> {
        if offset_high != 0 && offset_high != u32::MAX {
            return Err(Errno::EINVAL);
        }
        let file = fd_file(fd)?;
        let pos = file.seek(offset_low as i32, Whence::from_raw(whence)?)?;
        user::write_user(result_ptr, pos as u64)?;
        Ok(0)
    })();
    encode_sysret(res)
}

fn sys_ioctl(frame: &mut TrapFrame) -> isize {
    let res = (|| -> KernelResult<usize> {
        let file = fd_file(frame.ebx as usize)?;
        file.ioctl(frame.ecx, frame.edx as usize, true)
    })();
    encode_sysret(res)
}

fn sys_dup2(frame: &mut TrapFrame) -> isize {
    let res = (|| -> KernelResult<usize> {
        let oldfd = frame.ebx as usize;
        let newfd = frame.ecx as usize;
        let files = current_files()?;
        let file = files.get(oldfd)?;
        if oldfd == newfd {
            return Ok(newfd);
        }
        let _ = files.close(newfd);
        files.install_at(newfd, file)
    })();
    encode_sysret(res)
}

// fcntl commands
const F_DUPFD: u32 = 0;
const F_GETFD: u32 = 1;
const F_SETFD: u32 = 2;
const F_GETFL: u32 = 3;
const FD_CLOEXEC: u32 = 1;

fn sys_fcntl64(frame: &mut TrapFrame) -> isize {
    let fd = frame.ebx as usize;
    let res = (|| -> KernelResult<usize> {
        let files = current_files()?;
        match frame.ecx {
            F_DUPFD => {
                let file = files.get(fd)?;
                files.install(file)
            }
            F_GETFD => Ok(files.get_cloexec(fd)? as usize),
            F_SETFD => {
                files.set_cloexec(fd, frame.edx & FD_CLOEXEC != 0)?;
                Ok(0)
            }
            F_GETFL => {
                let file = files.get(fd)?;
                let flags = *file.flags.lock();
                Ok(flags.bits() as usize)
            }
            _ => Err(Errno::EINVAL),
        }
    })();
    encode_sysret(res)
}

fn sys_chdir(frame: &mut TrapFrame) -> isize {
    let res = (|| -> KernelResult<usize> {
        let path = user::user_cstr(frame.ebx as usize)?;
        let dir = File::open(&path, OpenFlags::empty())?;
        if !dir.inode.mode.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        *task::current().cwd.lock() = Some(dir);
        Ok(0)
    })();
    encode_sysret(res)
}

fn sys_getcwd(frame: &mut TrapFrame) -> isize {
    let res = (|| -> KernelResult<usize> {
        let cwd = task::current().cwd.lock().clone().ok_or(Errno::ENOENT)?;
        let mut rendered = cwd.path.to_string();
        rendered.push('\0');
        let buf = frame.ebx as usize;
        let len = frame.ecx as usize;
        if rendered.len() > len {
            return Err(Errno::ERANGE);
        }
        user::copy_to_user(buf, rendered.as_bytes())?;
        Ok(rendered.len())
    })();
    encode_sysret(res)
}

fn sys_readlink(frame: &mut TrapFrame) -> isize {
    let res = (|| -> KernelResult<usize> {
        let path = user::user_cstr(frame.ebx as usize)?;
        let file = File::open(&path, OpenFlags::NOFOLLOW)?;
        let target = file.inode.ops.readlink(&file.inode)?;
        let buf = frame.ecx as usize;
        let len = (frame.edx as usize).min(target.len());
        user::copy_to_user(buf, &target.as_bytes()[..len])?;
        Ok(len)
    })();
    encode_sysret(res)
}

fn do_access(path_ptr: usize) -> KernelResult<usize> {
    let path = user::user_cstr(path_ptr)?;
    // Everything runs as root; existence is the whole check.
    File::open(&path, OpenFlags::empty())?;
    Ok(0)
}

fn sys_access(frame: &mut TrapFrame) -> isize {
    encode_sysret(do_access(frame.ebx as usize))
}

fn sys_faccessat(frame: &mut TrapFrame) -> isize {
    // (dirfd, path, mode, flags); only AT_FDCWD resolution is interesting.
    let res = (|| -> KernelResult<usize> {
        let dfd = frame.ebx as i32;
        let path = user::user_cstr(frame.ecx as usize)?;
        let start = if dfd == AT_FDCWD {
            None
        } else {
            Some(fd_file(dfd as usize)?)
        };
        File::open_at(start, &path, OpenFlags::empty(), Mode::from_bits(0))?;
        Ok(0)
    })();
    encode_sysret(res)
}

/// The fixed-layout stat record the rich ABI hands to userspace.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Stat64 {
    st_dev: u64,
    _pad0: u32,
    st_ino_lo: u32,
    st_mode: u32,
    st_nlink: u32,
    st_uid: u32,
    st_gid: u32,
    st_rdev: u64,
    _pad1: u32,
    st_size: i64,
    st_blksize: u32,
    st_blocks: u64,
    st_atime: u32,
    st_atime_nsec: u32,
    st_mtime: u32,
    st_mtime_nsec: u32,
    st_ctime: u32,
    st_ctime_nsec: u32,
    st_ino: u64,
}

fn stat_from_inode(inode: &crate::fs::Inode) -> Stat64 {
    Stat64 {
        st_ino_lo: inode.ino,
        st_ino: inode.ino as u64,
        st_mode: inode.mode.bits() as u32,
        st_nlink: inode.nlink.load(core::sync::atomic::Ordering::Relaxed),
        st_rdev: inode.rdev.0 as u64,
        st_size: inode.size() as i64,
        st_blksize: 4096,
        st_blocks: (inode.size() as u64).div_ceil(512),
        ..Stat64::default()
    }
}

fn do_stat(path_ptr: usize, statbuf: usize, follow: bool) -> KernelResult<usize> {
    let path = user::user_cstr(path_ptr)?;
    let flags = if follow {
        OpenFlags::empty()
    } else {
        OpenFlags::NOFOLLOW
    };
    let file = File::open(&path, flags)?;
    user::write_user(statbuf, stat_from_inode(&file.inode))?;
    Ok(0)
}

fn sys_stat64(frame: &mut TrapFrame) -> isize {
    encode_sysret(do_stat(frame.ebx as usize, frame.ecx as usize, true))
}

fn sys_lstat64(frame: &mut TrapFrame) -> isize {
    encode_sysret(do_stat(frame.ebx as usize, frame.ecx as usize, false))
}

fn sys_fstat64(frame: &mut TrapFrame) -> isize {
    let res = (|| -> KernelResult<usize> {
        let file = fd_file(frame.ebx as usize)?;
        user::write_user(frame.ecx as usize, stat_from_inode(&file.inode))?;
        Ok(0)
    })();
    encode_sysret(res)
}

// getdents64 record header; the name follows inline. Packed because the
// on-wire layout puts the name at byte 19.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct Dirent64Head {
    d_ino: u64,
    d_off: i64,
    d_reclen: u16,
    d_type: u8,
}

fn dirent_type(mode: Mode) -> u8 {
    match mode.file_type() {
        Mode::FIFO => 1,
        Mode::CHAR => 2,
        Mode::DIR => 4,
        Mode::BLOCK => 6,
        Mode::REG => 8,
        Mode::LINK => 10,
        Mode::SOCK => 12,
        _ => 0,
    }
}

fn sys_getdents64(frame: &mut TrapFrame) -> isize {
    let fd = frame.ebx as usize;
    let dirp = frame.ecx as usize;
    let nbytes = frame.edx as usize;

    let res = (|| -> KernelResult<usize> {
        let file = fd_file(fd)?;
        if user::safe_buf(dirp, nbytes, true) != nbytes {
            return Err(Errno::EFAULT);
        }

        let mut written = 0usize;
        let mut io_err = None;
        file.readdir(&mut |name, off, ino, mode| {
            let head_len = core::mem::size_of::<Dirent64Head>();
            let reclen = (head_len + name.len() + 1 + 7) & !7;
            if written + reclen > nbytes {
                return false;
            }
            let head = Dirent64Head {
                d_ino: ino as u64,
                d_off: off as i64,
                d_reclen: reclen as u16,
                d_type: dirent_type(mode),
            };
            let base = dirp + written;
            if user::write_user(base, head).is_err()
                || user::copy_to_user(base + head_len, name.as_bytes()).is_err()
                || user::copy_to_user(base + head_len + name.len(), &[0u8]).is_err()
            {
                io_err = Some(Errno::EFAULT);
                return false;
            }
            written += reclen;
            true
        })?;

        match io_err {
            Some(e) => Err(e),
            None => Ok(written),
        }
    })();
    encode_sysret(res)
}

#[repr(C)]
#[derive(Clone, Copy)]
struct PollFd {
    fd: i32,
    events: i16,
    revents: i16,
}

fn sys_poll(frame: &mut TrapFrame) -> isize {
    let fds_ptr = frame.ebx as usize;
    let nfds = frame.ecx as usize;
    let timeout_ms = frame.edx as i32;

    let res = (|| -> KernelResult<usize> {
        let cur = sched::current();

        let mut pollfds: Vec<PollFd> = Vec::with_capacity(nfds);
        for i in 0..nfds {
            pollfds.push(user::read_user(
                fds_ptr + i * core::mem::size_of::<PollFd>(),
            )?);
        }

        let files: Vec<Option<Arc<File>>> = pollfds
            .iter()
            .map(|p| {
                if p.fd < 0 {
                    None
                } else {
                    fd_file(p.fd as usize).ok()
                }
            })
            .collect();

        let sleeper = if timeout_ms > 0 {
            let deadline = time::uptime().add(&Timespec {
                sec: timeout_ms as u32 / 1000,
                nsec: (timeout_ms as u32 % 1000) * 1_000_000,
            });
            Some(time::add_sleeper(deadline))
        } else {
            None
        };

        let result = loop {
            if crate::task::signal::signal_pending(cur) {
                break Err(Errno::EINTR);
            }

            let mut table = PollTable::new();
            let mut ready = 0usize;
            for (pollfd, file) in pollfds.iter_mut().zip(files.iter()) {
                pollfd.revents = 0;
                match file {
                    None => {
                        if pollfd.fd >= 0 {
                            pollfd.revents = PollEvents::NVAL.bits() as i16;
                        }
                    }
                    Some(file) => {
                        let events = file.poll(&mut table);
                        let interesting = PollEvents::from_bits_truncate(pollfd.events as u16)
                            | PollEvents::ERR
                            | PollEvents::HUP
                            | PollEvents::NVAL;
                        pollfd.revents = (events & interesting).bits() as i16;
                    }
                }
                if pollfd.revents != 0 {
                    ready += 1;
                }
            }

            if ready > 0 || timeout_ms == 0 {
                break Ok(ready);
            }
            if let Some(sleeper) = &sleeper {
                if sleeper.expired() {
                    break Ok(0);
                }
            }

            cur.set_state(crate::task::TaskState::Interruptible);
            sched::schedule();
            cur.set_state(crate::task::TaskState::Running);
            // The PollTable drop unregistered us; the next pass
            // re-registers before sleeping again.
        };

        if let Some(sleeper) = sleeper {
            time::remove_sleeper(&sleeper);
        }

        for (i, pollfd) in pollfds.iter().enumerate() {
            user::write_user(fds_ptr + i * core::mem::size_of::<PollFd>(), *pollfd)?;
        }

        result
    })();
    encode_sysret(res)
}

fn sys_pipe(frame: &mut TrapFrame) -> isize {
    let res = (|| -> KernelResult<usize> {
        let out_ptr = frame.ebx as usize;
        let (read_end, write_end) = pipe::create_pipe()?;
        let files = current_files()?;
        let rfd = files.install(read_end)?;
        let wfd = match files.install(write_end) {
            Ok(fd) => fd,
            Err(e) => {
                let _ = files.close(rfd);
                return Err(e);
            }
        };
        user::write_user(out_ptr, [rfd as i32, wfd as i32])?;
        Ok(0)
    })();
    encode_sysret(res)
}

fn sys_socket(frame: &mut TrapFrame) -> isize {
    let res = (|| -> KernelResult<usize> {
        let file = socket::create_socket(frame.ebx as u16, frame.ecx, frame.edx)?;
        current_files()?.install(file)
    })();
    encode_sysret(res)
}

fn read_sockaddr(ptr: usize, len: usize) -> KernelResult<Vec<u8>> {
    if len > 128 {
        return Err(Errno::EINVAL);
    }
    let mut addr = alloc::vec![0u8; len];
    user::copy_from_user(&mut addr, ptr)?;
    Ok(addr)
}

fn sys_bind(frame: &mut TrapFrame) -> isize {
    let res = (|| -> KernelResult<usize> {
        let file = fd_file(frame.ebx as usize)?;
        let addr = read_sockaddr(frame.ecx as usize, frame.edx as usize)?;
        socket::bind(&file, &addr)
    })();
    encode_sysret(res)
}

fn sys_connect(frame: &mut TrapFrame) -> isize {
    let res = (|| -> KernelResult<usize> {
        let file = fd_file(frame.ebx as usize)?;
        let addr = read_sockaddr(frame.ecx as usize, frame.edx as usize)?;
        socket::connect(&file, &addr)
    })();
    encode_sysret(res)
}

fn sys_mount(frame: &mut TrapFrame) -> isize {
    let res = (|| -> KernelResult<usize> {
        let dev_path = user::user_cstr(frame.ebx as usize)?;
        let target = user::user_cstr(frame.ecx as usize)?;
        let fs_name = user::user_cstr(frame.edx as usize)?;

        let sb_ops = crate::fs::get_sb_ops(&fs_name).ok_or(Errno::ENODEV)?;
        let dev = if dev_path.is_empty() {
            None
        } else {
            Some(File::open(&dev_path, OpenFlags::empty())?)
        };
        mount::do_mount(dev, sb_ops, Path::parse(&target))?;
        Ok(0)
    })();
    encode_sysret(res)
}

fn sys_umount(frame: &mut TrapFrame) -> isize {
    let res = (|| -> KernelResult<usize> {
        let target = user::user_cstr(frame.ebx as usize)?;
        mount::do_umount(&Path::parse(&target))?;
        Ok(0)
    })();
    encode_sysret(res)
}

// i386 syscall numbers for the rich ABI.
const NR_READ: usize = 3;
const NR_WRITE: usize = 4;
const NR_OPEN: usize = 5;
const NR_CLOSE: usize = 6;
const NR_CHDIR: usize = 12;
const NR_MOUNT: usize = 21;
const NR_UMOUNT: usize = 22;
const NR_ACCESS: usize = 33;
const NR_PIPE: usize = 42;
const NR_IOCTL: usize = 54;
const NR_DUP2: usize = 63;
const NR_READLINK: usize = 85;
const NR_LLSEEK: usize = 140;
const NR_POLL: usize = 168;
const NR_GETCWD: usize = 183;
const NR_STAT64: usize = 195;
const NR_LSTAT64: usize = 196;
const NR_FSTAT64: usize = 197;
const NR_GETDENTS64: usize = 220;
const NR_FCNTL64: usize = 221;
const NR_OPENAT: usize = 295;
const NR_FACCESSAT: usize = 307;
const NR_SOCKET: usize = 359;
const NR_BIND: usize = 361;
const NR_CONNECT: usize = 362;

pub(super) fn register_all() {
    use Abi::Linux;
    register(Linux, NR_READ, sys_read);
    register(Linux, NR_WRITE, sys_write);
    register(Linux, NR_OPEN, sys_open);
    register(Linux, NR_CLOSE, sys_close);
    register(Linux, NR_CHDIR, sys_chdir);
    register(Linux, NR_MOUNT, sys_mount);
    register(Linux, NR_UMOUNT, sys_umount);
    register(Linux, NR_ACCESS, sys_access);
    register(Linux, NR_PIPE, sys_pipe);
    register(Linux, NR_IOCTL, sys_ioctl);
    register(Linux, NR_DUP2, sys_dup2);
    register(Linux, NR_READLINK, sys_readlink);
    register(Linux, NR_LLSEEK, sys_llseek);
    register(Linux, NR_POLL, sys_poll);
    register(Linux, NR_GETCWD, sys_getcwd);
    register(Linux, NR_STAT64, sys_stat64);
    register(Linux, NR_LSTAT64, sys_lstat64);
    register(Linux, NR_FSTAT64, sys_fstat64);
    register(Linux, NR_GETDENTS64, sys_getdents64);
    register(Linux, NR_FCNTL64, sys_fcntl64);
    register(Linux, NR_OPENAT, sys_openat);
    register(Linux, NR_FACCESSAT, sys_faccessat);
    register(Linux, NR_SOCKET, sys_socket);
    register(Linux, NR_BIND, sys_bind);
    register(Linux, NR_CONNECT, sys_connect);
}
