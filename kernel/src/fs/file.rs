//! Open files and the file-operations capability set.
//!
//! A `File` pairs an inode with a position, flags and the capability set
//! chosen at open time (by the filesystem, or by the device registry for
//! device inodes). Multiple descriptors may point at one `File` via dup
//! and clone; the `Arc` count is the open-file reference count and the
//! drop runs the driver's release hook.

use alloc::sync::Arc;

use spin::Mutex;

use super::device::{self, DevId};
use super::mount;
use super::path::Path;
use super::poll::{PollEvents, PollTable};
use super::{Inode, Mode, OpenFlags};
use crate::error::{Errno, KernelResult};
use crate::task::{self, Abi};

/// Seek origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    pub fn from_raw(raw: u32) -> KernelResult<Whence> {
        match raw {
            0 => Ok(Whence::Set),
            1 => Ok(Whence::Cur),
            2 => Ok(Whence::End),
            _ => Err(Errno::EINVAL),
        }
    }
}

/// Directory-iteration callback: `(name, offset, ino, type)`. Returning
/// `false` stops the iteration.
pub type FillDir<'a> = &'a mut dyn FnMut(&str, u32, u32, Mode) -> bool;

/// Driver-private per-open state.
pub enum Private {
    Tty(Arc<super::tty::Tty>),
    Pipe(Arc<super::pipe::Pipe>),
    Socket(Arc<dyn super::socket::Socket>),
    /// Memory-backed image (initrd block device).
    Slice(&'static [u8]),
}

/// File operations. Every method has the default the VFS promises when a
/// driver leaves the slot empty.
pub trait FileOps: Send + Sync {
    /// Called once when the file is opened.
    fn open(&self, _file: &Arc<File>, _inode: &Arc<Inode>) -> KernelResult<()> {
        Ok(())
    }

    /// Called when the last reference goes away.
    fn release(&self, _file: &File) {}

    fn read(&self, _file: &File, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(Errno::EINVAL)
    }

    fn write(&self, _file: &File, _buf: &[u8]) -> KernelResult<usize> {
        Err(Errno::EINVAL)
    }

    fn seek(&self, file: &File, offset: i32, whence: Whence) -> KernelResult<i32> {
        default_seek(file, offset, whence)
    }

    fn readdir(&self, _file: &File, _filldir: FillDir) -> KernelResult<usize> {
        Err(Errno::ENOTDIR)
    }

    fn ioctl(&self, _file: &File, _request: u32, _arg: usize, _arg_user: bool) -> KernelResult<usize> {
        Err(Errno::ENOTTY)
    }

    /// Poll is always available: absent a driver implementation, a file
    /// reports ready exactly for the directions it implements.
    fn poll(&self, _file: &File, _wait: &mut PollTable) -> PollEvents {
        let mut events = PollEvents::empty();
        if self.supports_read() {
            events |= PollEvents::IN;
        }
        if self.supports_write() {
            events |= PollEvents::OUT;
        }
        events
    }

    /// Whether this capability set implements `read` (drives default poll).
    fn supports_read(&self) -> bool {
        false
    }

    /// Whether this capability set implements `write`.
    fn supports_write(&self) -> bool {
        false
    }
}

/// The all-defaults capability set.
pub struct DefaultFileOps;

impl FileOps for DefaultFileOps {}

static DEFAULT_FILE_OPS: spin::Once<Arc<DefaultFileOps>> = spin::Once::new();

pub fn default_file_ops() -> Arc<dyn FileOps> {
    let ops = DEFAULT_FILE_OPS
        .call_once(|| Arc::new(DefaultFileOps))
        .clone();
    ops
}

/// The default seek: SEEK_SET/CUR/END with a size clamp. A resolved
/// position strictly beyond the size is invalid; landing exactly on the
/// size is meaningful only as "end" (`SEEK_END`), not as a byte position.
pub fn default_seek(file: &File, offset: i32, whence: Whence) -> KernelResult<i32> {
    if !file.inode.mode.is_regular() {
        return Err(Errno::ESPIPE);
    }
    let size = file.inode.size() as i32;
    let new_pos = match whence {
        Whence::Set => offset,
        Whence::Cur => file.pos.lock().checked_add(offset).ok_or(Errno::EINVAL)?,
        Whence::End => size.checked_add(offset).ok_or(Errno::EINVAL)?,
    };
    if new_pos < 0 || new_pos > size {
        return Err(Errno::EINVAL);
    }
    if new_pos == size && whence != Whence::End {
        return Err(Errno::EINVAL);
    }
    *file.pos.lock() = new_pos;
    Ok(new_pos)
}

/// An open file.
pub struct File {
    pub inode: Arc<Inode>,
    pub ops: Arc<dyn FileOps>,
    pub path: Path,
    pub flags: Mutex<OpenFlags>,
    pub pos: Mutex<i32>,
    pub private: Mutex<Option<Private>>,
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("File")
            .field("ino", &self.inode.ino)
            .finish_non_exhaustive()
    }
}

impl File {
    fn build(
        inode: Arc<Inode>,
        ops: Arc<dyn FileOps>,
        path: Path,
        flags: OpenFlags,
    ) -> KernelResult<Arc<File>> {
        let file = Arc::new(File {
            inode: inode.clone(),
            ops: ops.clone(),
            path,
            flags: Mutex::new(flags),
            pos: Mutex::new(0),
            private: Mutex::new(None),
        });
        ops.open(&file, &inode)?;
        Ok(file)
    }

    /// Open by path, relative to the current task's working directory.
    pub fn open(path: &str, flags: OpenFlags) -> KernelResult<Arc<File>> {
        Self::open_at(None, path, flags, Mode::from_bits(0))
    }

    /// Open by path relative to `start` (`openat`); `None` means the CWD.
    pub fn open_at(
        start: Option<Arc<File>>,
        path_str: &str,
        flags: OpenFlags,
        mode: Mode,
    ) -> KernelResult<Arc<File>> {
        Self::open_depth(start, path_str, flags, mode, 0)
    }

    fn open_depth(
        start: Option<Arc<File>>,
        path_str: &str,
        flags: OpenFlags,
        mode: Mode,
        depth: u8,
    ) -> KernelResult<Arc<File>> {
        const MAX_SYMLINK_DEPTH: u8 = 8;
        if depth > MAX_SYMLINK_DEPTH {
            return Err(Errno::ENOENT);
        }
        if path_str.is_empty() {
            return Err(Errno::ENOENT);
        }

        let rel = Path::parse(path_str);
        let premount = if rel.absolute {
            rel
        } else {
            let base = match start {
                Some(file) => file.path.clone(),
                None => match task::try_current().and_then(|t| t.cwd.lock().clone()) {
                    Some(cwd) => cwd.path.clone(),
                    None => Path::empty(),
                },
            };
            Path::join(&base, &rel)
        };

        // Longest-prefix mount match, then walk the remainder from that
        // mount's root inode.
        let dest = mount::resolve(premount)?;
        let mnt = dest.mount.clone().ok_or(Errno::EINVAL)?;

        // The file keeps its global path; the walk uses the mount-relative
        // remainder.
        let mut full_path = Path {
            mount: dest.mount.clone(),
            absolute: true,
            components: mnt
                .path
                .components
                .iter()
                .chain(dest.components.iter())
                .cloned()
                .collect(),
        };

        let mut inode = mnt.root.clone();
        let mut created = false;
        let last_idx = dest.components.len().wrapping_sub(1);

        for (i, component) in dest.components.iter().enumerate() {
            let is_last = i == last_idx;
            let next = match inode.ops.lookup(&inode, component, flags) {
                Ok(next) => next,
                Err(Errno::ENOENT) if is_last && flags.contains(OpenFlags::CREAT) => {
                    created = true;
                    inode.ops.create(&inode, component, flags, mode)?
                }
                Err(e) => return Err(e),
            };
            inode = next;
        }

        if flags.contains(OpenFlags::EXCL) && !created {
            return Err(Errno::EEXIST);
        }

        // Follow a trailing symlink unless asked not to.
        if inode.mode.is_symlink() && !flags.contains(OpenFlags::NOFOLLOW) {
            let target = inode.ops.readlink(&inode)?;
            full_path.components.pop();
            let base_file = File::build(
                inode.clone(),
                default_file_ops(),
                full_path,
                OpenFlags::empty(),
            )?;
            return Self::open_depth(Some(base_file), &target, flags, mode, depth + 1);
        }

        let ops: Arc<dyn FileOps> = if inode.mode.is_device() {
            device::get_dev_ops(inode.mode, inode.rdev).ok_or(Errno::ENXIO)?
        } else {
            inode.ops.file_ops()
        };

        if task::try_current().map(|t| t.abi()) == Some(Abi::Linux)
            && inode.mode.is_dir()
            && flags.writable()
        {
            return Err(Errno::EISDIR);
        }

        Self::build(inode, ops, full_path, flags)
    }

    /// Open a device by `(type, dev)` directly, bypassing path resolution.
    /// Kernel-side clients (the console) use this before any filesystem is
    /// mounted.
    pub fn open_anon_device(dev: DevId, mode: Mode, flags: OpenFlags) -> KernelResult<Arc<File>> {
        let ops = device::get_dev_ops(mode, dev).ok_or(Errno::ENXIO)?;
        let inode = Inode::anonymous(mode, dev);
        Self::build(inode, ops, Path::empty(), flags)
    }

    /// Build a file over an anonymous inode with explicit operations
    /// (pipes, sockets).
    pub fn anonymous(
        mode: Mode,
        ops: Arc<dyn FileOps>,
        flags: OpenFlags,
    ) -> KernelResult<Arc<File>> {
        Self::build(Inode::anonymous(mode, DevId::default()), ops, Path::empty(), flags)
    }

    pub fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let flags = *self.flags.lock();
        if !flags.readable() {
            return Err(Errno::EINVAL);
        }
        if self.inode.mode.is_dir() {
            return match task::try_current().map(|t| t.abi()) {
                Some(Abi::Legacy) => self.legacy_dir_read(buf),
                _ => Err(Errno::EISDIR),
            };
        }
        self.ops.read(self, buf)
    }

    pub fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        let flags = *self.flags.lock();
        if !flags.writable() {
            return Err(Errno::EINVAL);
        }
        if self.inode.mode.is_dir() {
            return Err(Errno::EISDIR);
        }
        if flags.contains(OpenFlags::APPEND) {
            let _ = self.seek(0, Whence::End);
        }
        self.ops.write(self, buf)
    }

    pub fn seek(&self, offset: i32, whence: Whence) -> KernelResult<i32> {
        if self.inode.mode.is_dir() {
            return Err(Errno::EISDIR);
        }
        self.ops.seek(self, offset, whence)
    }

    pub fn readdir(&self, filldir: FillDir) -> KernelResult<usize> {
        if !self.inode.mode.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        self.ops.readdir(self, filldir)
    }

    pub fn ioctl(&self, request: u32, arg: usize, arg_user: bool) -> KernelResult<usize> {
        self.ops.ioctl(self, request, arg, arg_user)
    }

    pub fn poll(&self, wait: &mut PollTable) -> PollEvents {
        self.ops.poll(self, wait)
    }

    /// The legacy ABI reads directories one entry per call, returning the
    /// entry name.
    fn legacy_dir_read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let target = *self.pos.lock() as u32;
        let mut copied = 0usize;
        let mut seen = 0u32;
        self.ops.readdir(self, &mut |name, _off, _ino, _mode| {
            if seen == target {
                let n = name.len().min(buf.len());
                buf[..n].copy_from_slice(&name.as_bytes()[..n]);
                copied = n;
                seen += 1;
                false
            } else {
                seen += 1;
                true
            }
        })?;
        if copied > 0 {
            *self.pos.lock() += 1;
        }
        Ok(copied)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.ops.release(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InodePayload;

    fn regular_file(size: usize) -> Arc<File> {
        let inode = Inode::anonymous(Mode::REG | Mode::from_bits(0o644), DevId::default());
        inode.set_size(size);
        File::build(inode, default_file_ops(), Path::empty(), OpenFlags::empty()).unwrap()
    }

    #[test]
    fn default_read_write_are_einval() {
        let file = regular_file(16);
        let mut buf = [0u8; 4];
        assert_eq!(file.read(&mut buf), Err(Errno::EINVAL));
        let wfile = File::build(
            file.inode.clone(),
            default_file_ops(),
            Path::empty(),
            OpenFlags::RDWR,
        )
        .unwrap();
        assert_eq!(wfile.write(&buf), Err(Errno::EINVAL));
    }

    #[test]
    fn seek_boundaries() {
        let file = regular_file(0x7c000);
        // SEEK_END - 16 on a 0x7c000-byte image lands at 0x7bff0.
        assert_eq!(file.seek(-16, Whence::End), Ok(0x7bff0));
        // SEEK_END + 0 returns the size.
        assert_eq!(file.seek(0, Whence::End), Ok(0x7c000));
        // SEEK_END + k (k > 0) is invalid.
        assert_eq!(file.seek(1, Whence::End), Err(Errno::EINVAL));
        // SEEK_SET exactly at the size is invalid: past-end reads are
        // disallowed for byte positions.
        assert_eq!(file.seek(0x7c000, Whence::Set), Err(Errno::EINVAL));
        assert_eq!(file.seek(-1, Whence::Set), Err(Errno::EINVAL));
        assert_eq!(file.seek(0, Whence::Set), Ok(0));
    }

    #[test]
    fn seek_non_regular_is_espipe() {
        let inode = Inode::anonymous(Mode::FIFO, DevId::default());
        let file =
            File::build(inode, default_file_ops(), Path::empty(), OpenFlags::empty()).unwrap();
        assert_eq!(file.seek(0, Whence::Set), Err(Errno::ESPIPE));
    }

    #[test]
    fn readdir_non_directory_is_enotdir() {
        let file = regular_file(4);
        let res = file.readdir(&mut |_, _, _, _| true);
        assert_eq!(res, Err(Errno::ENOTDIR));
    }

    #[test]
    fn default_poll_reports_no_directions() {
        let file = regular_file(4);
        let mut table = PollTable::new();
        assert_eq!(file.poll(&mut table), PollEvents::empty());
    }

    #[test]
    fn payload_slot_is_usable() {
        let file = regular_file(4);
        *file.inode.payload.lock() = Some(InodePayload::Cookie(7));
        let payload = file.inode.payload.lock();
        match *payload {
            Some(InodePayload::Cookie(7)) => {}
            _ => panic!("payload lost"),
        }
    }
}
