//! Socket surface.
//!
//! Protocol families are external collaborators: a network stack registers
//! a [`SocketFamily`] for its address family and hands back [`Socket`]
//! objects, which the VFS wraps into ordinary pollable files. With no
//! family registered, `socket()` fails with `EAFNOSUPPORT`.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{Errno, KernelResult};
use crate::sync::IrqLock;

use super::file::{File, FileOps, Private};
use super::poll::{PollEvents, PollTable};
use super::{Mode, OpenFlags};

/// One endpoint, implemented by a protocol family.
pub trait Socket: Send + Sync {
    fn bind(&self, _addr: &[u8]) -> KernelResult<usize> {
        Err(Errno::EINVAL)
    }

    fn connect(&self, _addr: &[u8]) -> KernelResult<usize> {
        Err(Errno::EINVAL)
    }

    fn read(&self, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(Errno::EINVAL)
    }

    fn write(&self, _buf: &[u8]) -> KernelResult<usize> {
        Err(Errno::EINVAL)
    }

    fn poll(&self, _wait: &mut PollTable) -> PollEvents {
        PollEvents::empty()
    }
}

/// A protocol family (AF_INET and friends), registered by its stack.
pub trait SocketFamily: Send + Sync {
    fn family(&self) -> u16;
    fn socket(&self, sock_type: u32, protocol: u32) -> KernelResult<Arc<dyn Socket>>;
}

static FAMILIES: IrqLock<Vec<Arc<dyn SocketFamily>>> = IrqLock::new(Vec::new());

/// Registration surface for protocol stacks.
pub fn register_family(family: Arc<dyn SocketFamily>) {
    FAMILIES.lock().push(family);
}

struct SocketFileOps;

fn socket_of(file: &File) -> KernelResult<Arc<dyn Socket>> {
    match &*file.private.lock() {
        Some(Private::Socket(sock)) => Ok(sock.clone()),
        _ => Err(Errno::ENOTSOCK),
    }
}

impl FileOps for SocketFileOps {
    fn read(&self, file: &File, buf: &mut [u8]) -> KernelResult<usize> {
        socket_of(file)?.read(buf)
    }

    fn write(&self, file: &File, buf: &[u8]) -> KernelResult<usize> {
        socket_of(file)?.write(buf)
    }

    fn seek(&self, _file: &File, _offset: i32, _whence: super::file::Whence) -> KernelResult<i32> {
        Err(Errno::ESPIPE)
    }

    fn poll(&self, file: &File, wait: &mut PollTable) -> PollEvents {
        match socket_of(file) {
            Ok(sock) => sock.poll(wait),
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

/// Create a socket file for `(family, type, protocol)`.
pub fn create_socket(family: u16, sock_type: u32, protocol: u32) -> KernelResult<Arc<File>> {
    let handler = FAMILIES
        .lock()
        .iter()
        .find(|f| f.family() == family)
        .cloned()
        .ok_or(Errno::EAFNOSUPPORT)?;
    let sock = handler.socket(sock_type, protocol)?;

    let file = File::anonymous(Mode::SOCK, Arc::new(SocketFileOps), OpenFlags::RDWR)?;
    *file.private.lock() = Some(Private::Socket(sock));
    Ok(file)
}

/// `bind` on an open descriptor; `ENOTSOCK` on anything else.
pub fn bind(file: &File, addr: &[u8]) -> KernelResult<usize> {
    socket_of(file)?.bind(addr)
}

/// `connect` on an open descriptor.
pub fn connect(file: &File, addr: &[u8]) -> KernelResult<usize> {
    socket_of(file)?.connect(addr)
}
