//! Virtual filesystem.
//!
//! One object model unifies regular files, directories, devices, pipes and
//! TTYs: a reference-counted [`Inode`] carries identity and metadata and
//! points at an [`InodeOps`] capability set; an open [`file::File`] pairs
//! an inode with a position and a [`file::FileOps`] capability set chosen
//! by inode type and device registration. Every hole in a capability set
//! is filled by a default that returns the appropriate error.

pub mod device;
pub mod fd_table;
pub mod file;
pub mod initrd;
pub mod mount;
pub mod path;
pub mod pipe;
pub mod poll;
pub mod socket;
pub mod tty;

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::error::{Errno, KernelResult};

pub use device::DevId;
pub use path::Path;

/// POSIX file mode: top four bits type, low nine permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode(pub u16);

impl Mode {
    pub const TYPE_MASK: Mode = Mode(0xf000);
    pub const REG: Mode = Mode(0x8000);
    pub const DIR: Mode = Mode(0x4000);
    pub const CHAR: Mode = Mode(0x2000);
    pub const BLOCK: Mode = Mode(0x6000);
    pub const FIFO: Mode = Mode(0x1000);
    pub const LINK: Mode = Mode(0xa000);
    pub const SOCK: Mode = Mode(0xc000);

    pub const fn from_bits(bits: u16) -> Mode {
        Mode(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn file_type(self) -> Mode {
        Mode(self.0 & Self::TYPE_MASK.0)
    }

    pub fn is_dir(self) -> bool {
        self.file_type() == Self::DIR
    }

    pub fn is_regular(self) -> bool {
        self.file_type() == Self::REG
    }

    pub fn is_device(self) -> bool {
        matches!(self.file_type(), Self::CHAR | Self::BLOCK)
    }

    pub fn is_symlink(self) -> bool {
        self.file_type() == Self::LINK
    }
}

impl core::ops::BitOr for Mode {
    type Output = Mode;

    fn bitor(self, rhs: Mode) -> Mode {
        Mode(self.0 | rhs.0)
    }
}

bitflags::bitflags! {
    /// Open flags, numerically the rich ABI's values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY = 0x1;
        const RDWR = 0x2;
        const CREAT = 0x40;
        const EXCL = 0x80;
        const NOCTTY = 0x100;
        const TRUNC = 0x200;
        const APPEND = 0x400;
        const NOFOLLOW = 0x20000;
        const CLOEXEC = 0x80000;
    }
}

impl OpenFlags {
    pub fn readable(self) -> bool {
        !self.contains(OpenFlags::WRONLY)
    }

    pub fn writable(self) -> bool {
        self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    }
}

/// Inode operations: the filesystem-level capability set. Defaults return
/// the error a filesystem without the capability should produce.
pub trait InodeOps: Send + Sync {
    /// Look up `name` inside directory `dir`.
    fn lookup(&self, _dir: &Inode, _name: &str, _flags: OpenFlags) -> KernelResult<Arc<Inode>> {
        Err(Errno::ENOENT)
    }

    /// Create `name` inside directory `dir`.
    fn create(
        &self,
        _dir: &Inode,
        _name: &str,
        _flags: OpenFlags,
        _mode: Mode,
    ) -> KernelResult<Arc<Inode>> {
        Err(Errno::EROFS)
    }

    fn link(&self, _dir: &Inode, _target: &Inode, _name: &str) -> KernelResult<()> {
        Err(Errno::EROFS)
    }

    fn unlink(&self, _dir: &Inode, _name: &str) -> KernelResult<()> {
        Err(Errno::EROFS)
    }

    fn readlink(&self, _inode: &Inode) -> KernelResult<String> {
        Err(Errno::EINVAL)
    }

    fn truncate(&self, _inode: &Inode) -> KernelResult<()> {
        Ok(())
    }

    /// File operations for regular opens of this filesystem's inodes.
    /// Device inodes never consult this; the registry decides instead.
    fn file_ops(&self) -> Arc<dyn file::FileOps> {
        file::default_file_ops()
    }
}

/// The nothing-implemented inode capability set.
pub struct DefaultInodeOps;

impl InodeOps for DefaultInodeOps {}

/// Filesystem-level identity of a file.
pub struct Inode {
    pub ino: u32,
    pub mode: Mode,
    pub nlink: AtomicU32,
    pub size: AtomicUsize,
    /// Device identity, for device inodes.
    pub rdev: DevId,
    pub ops: Arc<dyn InodeOps>,
    pub sb: Option<Arc<SuperBlock>>,
    /// Opaque per-filesystem payload.
    pub payload: spin::Mutex<Option<InodePayload>>,
}

/// Per-filesystem private inode data.
pub enum InodePayload {
    /// Byte range into a memory-backed image.
    Slice(&'static [u8]),
    /// Small integer cookie (block index, table slot).
    Cookie(usize),
}

impl Inode {
    /// An inode with no filesystem behind it (anonymous device opens).
    pub fn anonymous(mode: Mode, rdev: DevId) -> Arc<Inode> {
        Arc::new(Inode {
            ino: 0,
            mode,
            nlink: AtomicU32::new(1),
            size: AtomicUsize::new(0),
            rdev,
            ops: Arc::new(DefaultInodeOps),
            sb: None,
            payload: spin::Mutex::new(None),
        })
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size(&self, size: usize) {
        self.size.store(size, Ordering::Release);
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        // Last reference: write back, then let the superblock retire it.
        if let Some(sb) = &self.sb {
            let _ = sb.ops.write_inode(self);
            sb.ops.put_inode(self);
        }
    }
}

/// A mounted filesystem instance.
pub struct SuperBlock {
    pub ops: Arc<dyn SuperBlockOps>,
    /// Backing device, if the filesystem has one.
    pub dev: Option<Arc<file::File>>,
}

/// Superblock operations; defaults describe a read-only, inode-less
/// filesystem.
pub trait SuperBlockOps: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Build a superblock over `dev`.
    fn make_super(
        self: Arc<Self>,
        dev: Option<Arc<file::File>>,
    ) -> KernelResult<Arc<SuperBlock>>
    where
        Self: Sized,
    {
        Ok(Arc::new(SuperBlock { ops: self, dev }))
    }

    /// Produce the root inode.
    fn read_root(&self, sb: &Arc<SuperBlock>) -> KernelResult<Arc<Inode>>;

    /// Load an inode by number.
    fn read_inode(&self, _sb: &Arc<SuperBlock>, _ino: u32) -> KernelResult<Arc<Inode>> {
        Err(Errno::ENOENT)
    }

    /// Flush one inode.
    fn write_inode(&self, _inode: &Inode) -> KernelResult<()> {
        Err(Errno::EROFS)
    }

    /// Retire one inode (the Arc itself is already being destroyed).
    fn put_inode(&self, _inode: &Inode) {}

    /// Flush superblock metadata.
    fn write_super(&self, _sb: &SuperBlock) -> KernelResult<()> {
        Err(Errno::EROFS)
    }

    /// Release the superblock.
    fn put_super(&self, _sb: &SuperBlock) {}
}

use crate::sync::IrqLock;
use alloc::vec::Vec;

/// Registry of filesystem types by name.
static SB_OPS_REGISTRY: IrqLock<Vec<Arc<dyn SuperBlockOps>>> = IrqLock::new(Vec::new());

pub fn register_sb_ops(ops: Arc<dyn SuperBlockOps>) {
    SB_OPS_REGISTRY.lock().push(ops);
}

pub fn get_sb_ops(name: &str) -> Option<Arc<dyn SuperBlockOps>> {
    SB_OPS_REGISTRY
        .lock()
        .iter()
        .find(|ops| ops.name() == name)
        .cloned()
}

/// Wire up the built-in VFS clients.
pub fn init() {
    tty::init();
    initrd::init();
    log::info!("vfs: device registry and tty subsystem up");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_type_bits() {
        let mode = Mode::CHAR | Mode::from_bits(0o666);
        assert!(mode.is_device());
        assert!(!mode.is_dir());
        assert_eq!(mode.file_type(), Mode::CHAR);
        assert_eq!(mode.bits() & 0o777, 0o666);
    }

    #[test]
    fn open_flags_accessors() {
        assert!(OpenFlags::empty().readable());
        assert!(!OpenFlags::empty().writable());
        assert!(!OpenFlags::WRONLY.readable());
        assert!(OpenFlags::WRONLY.writable());
        assert!(OpenFlags::RDWR.readable() && OpenFlags::RDWR.writable());
    }
}
