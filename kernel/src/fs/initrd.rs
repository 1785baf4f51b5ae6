//! Initial ramdisk block device.
//!
//! Serves raw byte ranges of the first boot module as block device
//! `(major 1, minor 0)`. The on-disk formats inside the image belong to
//! filesystem parsers, which mount on top of this device; the core only
//! hands out bytes.

use alloc::sync::Arc;

use crate::error::{Errno, KernelResult};

use super::device::{self, DevId};
use super::file::{File, FileOps, Private, Whence};
use super::{Inode, Mode};

/// The ramdisk device identity.
pub const INITRD_DEV: DevId = DevId::new(1, 0);

struct InitrdOps;

impl InitrdOps {
    fn image(file: &File) -> KernelResult<&'static [u8]> {
        match &*file.private.lock() {
            Some(Private::Slice(image)) => Ok(*image),
            _ => Err(Errno::ENXIO),
        }
    }
}

impl FileOps for InitrdOps {
    fn open(&self, file: &Arc<File>, inode: &Arc<Inode>) -> KernelResult<()> {
        let module = crate::boot::boot_info()
            .and_then(|info| info.initrd())
            .ok_or(Errno::ENXIO)?;
        let image = module.as_slice();
        inode.set_size(image.len());
        *file.private.lock() = Some(Private::Slice(image));
        Ok(())
    }

    fn read(&self, file: &File, buf: &mut [u8]) -> KernelResult<usize> {
        let image = Self::image(file)?;
        let mut pos = file.pos.lock();
        let start = (*pos as usize).min(image.len());
        let n = buf.len().min(image.len() - start);
        buf[..n].copy_from_slice(&image[start..start + n]);
        *pos += n as i32;
        Ok(n)
    }

    fn seek(&self, file: &File, offset: i32, whence: Whence) -> KernelResult<i32> {
        // Same clamp rules as the regular-file default, against the image
        // size; the inode is a block device, so the default would ESPIPE.
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

    fn write(&self, _file: &File, _buf: &[u8]) -> KernelResult<usize> {
        Err(Errno::EROFS)
    }

    fn supports_read(&self) -> bool {
        true
    }
}

/// Register the ramdisk in the device registry.
pub fn init() {
    device::register_dev(Mode::BLOCK, INITRD_DEV, Arc::new(InitrdOps));
}
