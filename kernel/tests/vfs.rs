//! VFS integration: an in-memory filesystem mounted at the root, driven
//! through the same open/read/seek/readdir paths syscalls use.
//!
//! Runs on the build host; everything here is hardware-free.

#![cfg(not(target_os = "none"))]

use std::sync::atomic::{AtomicU32, AtomicUsize};
use std::sync::Arc;

use cinder_kernel::error::Errno;
use cinder_kernel::fs::file::{File, FileOps, Whence};
use cinder_kernel::fs::poll::PollTable;
use cinder_kernel::fs::{
    mount, Inode, InodeOps, InodePayload, Mode, OpenFlags, Path, SuperBlockOps,
};

// A flat, read-only filesystem: a root directory with static files.

const MOTD: &[u8] = b"welcome to cinder\n";
const IMAGE: &[u8] = &[
    0x11, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00, 0x3b, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00,
];

fn entries() -> &'static [(&'static str, &'static [u8])] {
    &[("motd", MOTD), ("image", IMAGE)]
}

struct MemDirOps;

impl InodeOps for MemDirOps {
    fn lookup(
        &self,
        _dir: &Inode,
        name: &str,
        _flags: OpenFlags,
    ) -> Result<Arc<Inode>, Errno> {
        for (i, (entry_name, data)) in entries().iter().enumerate() {
            if *entry_name == name {
                return Ok(mem_file_inode(i as u32 + 2, data));
            }
        }
        Err(Errno::ENOENT)
    }

    fn file_ops(&self) -> Arc<dyn FileOps> {
        Arc::new(MemDirFileOps)
    }
}

struct MemDirFileOps;

impl FileOps for MemDirFileOps {
    fn readdir(
        &self,
        _file: &File,
        filldir: cinder_kernel::fs::file::FillDir,
    ) -> Result<usize, Errno> {
        for (i, (name, _)) in entries().iter().enumerate() {
            if !filldir(name, i as u32, i as u32 + 2, Mode::REG) {
                break;
            }
        }
        Ok(0)
    }
}

struct MemFileOps;

impl FileOps for MemFileOps {
    fn read(&self, file: &File, buf: &mut [u8]) -> Result<usize, Errno> {
        let data = match &*file.inode.payload.lock() {
            Some(InodePayload::Slice(data)) => *data,
            _ => return Err(Errno::EIO),
        };
        let mut pos = file.pos.lock();
        let start = (*pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        *pos += n as i32;
        Ok(n)
    }

    fn supports_read(&self) -> bool {
        true
    }
}

fn mem_file_inode(ino: u32, data: &'static [u8]) -> Arc<Inode> {
    let inode = Arc::new(Inode {
        ino,
        mode: Mode::REG | Mode::from_bits(0o444),
        nlink: AtomicU32::new(1),
        size: AtomicUsize::new(data.len()),
        rdev: Default::default(),
        ops: Arc::new(MemFileOps2),
        sb: None,
        payload: spin::Mutex::new(Some(InodePayload::Slice(data))),
    });
    inode
}

/// Inode ops for regular files: no children, our file ops.
struct MemFileOps2;

impl InodeOps for MemFileOps2 {
    fn file_ops(&self) -> Arc<dyn FileOps> {
        Arc::new(MemFileOps)
    }
}

struct MemFsSbOps;

impl SuperBlockOps for MemFsSbOps {
    fn name(&self) -> &'static str {
        "memfs"
    }

    fn read_root(
        &self,
        _sb: &Arc<cinder_kernel::fs::SuperBlock>,
    ) -> Result<Arc<Inode>, Errno> {
        Ok(Arc::new(Inode {
            ino: 1,
            mode: Mode::DIR | Mode::from_bits(0o755),
            nlink: AtomicU32::new(2),
            size: AtomicUsize::new(0),
            rdev: Default::default(),
            ops: Arc::new(MemDirOps),
            sb: None,
            payload: spin::Mutex::new(None),
        }))
    }
}

// One test body: the mount table is process-global state.
#[test]
fn vfs_end_to_end() {
    mount::do_mount(None, Arc::new(MemFsSbOps), Path::parse("/")).unwrap();

    // Path resolution: messy spellings land on the same inode as the
    // canonical one.
    let canonical = File::open("/motd", OpenFlags::empty()).unwrap();
    let messy = File::open("//motd/", OpenFlags::empty()).unwrap();
    assert_eq!(canonical.inode.ino, messy.inode.ino);

    // Reading returns the file contents through the driver ops.
    let mut buf = [0u8; 64];
    let n = canonical.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], MOTD);

    // S1-style image access: first 16 bytes are the known header.
    let image = File::open("/image", OpenFlags::empty()).unwrap();
    let mut header = [0u8; 16];
    assert_eq!(image.read(&mut header).unwrap(), 16);
    assert_eq!(header, IMAGE[..16]);

    // Boundary seeks on a regular file.
    let size = IMAGE.len() as i32;
    assert_eq!(image.seek(0, Whence::End).unwrap(), size);
    assert_eq!(image.seek(1, Whence::End), Err(Errno::EINVAL));
    assert_eq!(image.seek(size, Whence::Set), Err(Errno::EINVAL));
    assert_eq!(image.seek(-16, Whence::End).unwrap(), 0);

    // Missing names propagate ENOENT; O_EXCL on an existing file EEXIST.
    assert_eq!(
        File::open("/nonesuch", OpenFlags::empty()).unwrap_err(),
        Errno::ENOENT
    );
    assert_eq!(
        File::open("/motd", OpenFlags::CREAT | OpenFlags::EXCL).unwrap_err(),
        Errno::EEXIST
    );

    // Directory iteration through the fill callback, with early stop.
    let root = File::open("/", OpenFlags::empty()).unwrap();
    let mut names = Vec::new();
    root.readdir(&mut |name, _off, _ino, mode| {
        assert_eq!(mode, Mode::REG);
        names.push(name.to_string());
        true
    })
    .unwrap();
    assert_eq!(names, ["motd", "image"]);

    let mut first = None;
    root.readdir(&mut |name, _off, _ino, _mode| {
        first = Some(name.to_string());
        false
    })
    .unwrap();
    assert_eq!(first.as_deref(), Some("motd"));

    // Default fallbacks: readdir on a non-directory, seek on the
    // directory, write on a read-only capability set.
    assert_eq!(
        canonical.readdir(&mut |_, _, _, _| true).unwrap_err(),
        Errno::ENOTDIR
    );
    assert_eq!(root.seek(0, Whence::Set).unwrap_err(), Errno::EISDIR);
    let writable = File::open("/motd", OpenFlags::RDWR).unwrap();
    assert_eq!(writable.write(b"nope").unwrap_err(), Errno::EINVAL);

    // Poll is always available; this driver only claims the read side.
    let mut table = PollTable::new();
    let events = image.poll(&mut table);
    assert!(events.contains(cinder_kernel::fs::poll::PollEvents::IN));
    assert!(!events.contains(cinder_kernel::fs::poll::PollEvents::OUT));

    // The root mount cannot be unmounted.
    assert_eq!(mount::do_umount(&Path::parse("/")), Err(Errno::EBUSY));
}
