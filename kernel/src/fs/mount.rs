//! Mount table.
//!
//! A mount is a `(root inode, path)` pair spliced into the namespace. Path
//! resolution picks the mount with the longest matching prefix and
//! truncates the path relative to that mount's root. After bring-up the
//! table always contains at least the root mount.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::file::File;
use super::path::Path;
use super::{Inode, SuperBlockOps};
use crate::error::{Errno, KernelResult};
use crate::sync::IrqLock;

/// A mounted filesystem root spliced in at `path`.
pub struct Mount {
    pub root: Arc<Inode>,
    pub path: Path,
}

static MOUNT_TABLE: IrqLock<Vec<Arc<Mount>>> = IrqLock::new(Vec::new());

/// Mount a filesystem: build the superblock over `dev`, read its root
/// inode, record the pair.
pub fn do_mount(
    dev: Option<Arc<File>>,
    sb_ops: Arc<dyn SuperBlockOps>,
    path: Path,
) -> KernelResult<()> {
    let sb = Arc::new(super::SuperBlock {
        ops: sb_ops.clone(),
        dev,
    });
    let root = sb.ops.read_root(&sb)?;
    if !root.mode.is_dir() {
        return Err(Errno::ENOTDIR);
    }

    let mut table = MOUNT_TABLE.lock();
    if table
        .iter()
        .any(|m| m.path.components == path.components)
    {
        return Err(Errno::EBUSY);
    }
    table.push(Arc::new(Mount { root, path }));
    Ok(())
}

/// Unmount. The path must resolve exactly to a mount root; the root mount
/// itself stays.
pub fn do_umount(path: &Path) -> KernelResult<()> {
    let mut table = MOUNT_TABLE.lock();
    let idx = table
        .iter()
        .position(|m| m.path.components == path.components)
        .ok_or(Errno::EINVAL)?;
    if table[idx].path.is_root() {
        return Err(Errno::EBUSY);
    }
    table.remove(idx);
    Ok(())
}

/// Resolve a fully joined absolute path against the mount table: pick the
/// longest-prefix mount and truncate. The result's `mount` is set and its
/// components are relative to the mount's root.
pub fn resolve(path: Path) -> KernelResult<Path> {
    let table = MOUNT_TABLE.lock();
    let mut best: Option<&Arc<Mount>> = None;
    for mount in table.iter() {
        if path.starts_with(&mount.path) {
            let better = match best {
                Some(b) => mount.path.components.len() > b.path.components.len(),
                None => true,
            };
            if better {
                best = Some(mount);
            }
        }
    }
    let mount = best.ok_or(Errno::ENOENT)?;
    let mut stripped = path.strip_prefix(&mount.path);
    stripped.mount = Some(mount.clone());
    Ok(stripped)
}

/// Number of active mounts (diagnostics).
pub fn mount_count() -> usize {
    MOUNT_TABLE.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{DefaultInodeOps, Mode};
    use core::sync::atomic::{AtomicU32, AtomicUsize};

    fn dir_inode() -> Arc<Inode> {
        Arc::new(Inode {
            ino: 1,
            mode: Mode::DIR | Mode::from_bits(0o755),
            nlink: AtomicU32::new(1),
            size: AtomicUsize::new(0),
            rdev: Default::default(),
            ops: Arc::new(DefaultInodeOps),
            sb: None,
            payload: spin::Mutex::new(None),
        })
    }

    fn push_mount(at: &str) {
        MOUNT_TABLE.lock().push(Arc::new(Mount {
            root: dir_inode(),
            path: Path::parse(at),
        }));
    }

    // One test body: the mount table is process-global and the harness
    // runs tests concurrently.
    #[test]
    fn resolution_and_umount() {
        MOUNT_TABLE.lock().clear();
        push_mount("/");
        push_mount("/mnt/usb");

        let resolved = resolve(Path::parse("/mnt/usb/docs/a.txt")).unwrap();
        assert_eq!(resolved.components, ["docs", "a.txt"]);
        assert_eq!(
            resolved.mount.as_ref().unwrap().path.components,
            ["mnt", "usb"]
        );

        // Trailing and repeated slashes resolve like the canonical form.
        let canon = resolve(Path::parse("/mnt/usb/docs")).unwrap();
        let messy = resolve(Path::parse("/mnt//usb/docs/")).unwrap();
        assert_eq!(canon.components, messy.components);

        let resolved = resolve(Path::parse("/mnt/other")).unwrap();
        assert!(resolved.mount.as_ref().unwrap().path.is_root());
        assert_eq!(resolved.components, ["mnt", "other"]);

        push_mount("/data");
        assert_eq!(do_umount(&Path::parse("/data/sub")), Err(Errno::EINVAL));
        assert_eq!(do_umount(&Path::parse("/")), Err(Errno::EBUSY));
        assert!(do_umount(&Path::parse("/data")).is_ok());
        assert_eq!(mount_count(), 2);
        MOUNT_TABLE.lock().clear();
    }
}
