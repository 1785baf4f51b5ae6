//! Kernel error type.
//!
//! Every fallible operation in the kernel returns `Result<T, Errno>`. The
//! numeric values follow the classic Unix errno assignments so the syscall
//! boundary can negate them straight into `eax`.

use core::fmt;

/// Unix-style error numbers.
///
/// The discriminants are the positive errno values; syscall return paths
/// negate them. Keep this list in sync with the user-space `errno.h` the
/// toolchain ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
#[repr(i32)]
pub enum Errno {
    /// Operation not permitted
    EPERM = 1,
    /// No such file or directory
    ENOENT = 2,
    /// No such process
    ESRCH = 3,
    /// Interrupted system call
    EINTR = 4,
    /// I/O error
    EIO = 5,
    /// No such device or address
    ENXIO = 6,
    /// Exec format error
    ENOEXEC = 8,
    /// Bad file number
    EBADF = 9,
    /// No child processes
    ECHILD = 10,
    /// Try again
    EAGAIN = 11,
    /// Out of memory
    ENOMEM = 12,
    /// Permission denied
    EACCES = 13,
    /// Bad address
    EFAULT = 14,
    /// Device or resource busy
    EBUSY = 16,
    /// File exists
    EEXIST = 17,
    /// No such device
    ENODEV = 19,
    /// Not a directory
    ENOTDIR = 20,
    /// Is a directory
    EISDIR = 21,
    /// Invalid argument
    EINVAL = 22,
    /// File table overflow
    ENFILE = 23,
    /// Too many open files
    EMFILE = 24,
    /// Not a typewriter
    ENOTTY = 25,
    /// No space left on device
    ENOSPC = 28,
    /// Illegal seek
    ESPIPE = 29,
    /// Read-only file system
    EROFS = 30,
    /// Broken pipe
    EPIPE = 32,
    /// Math argument out of domain of func
    EDOM = 33,
    /// Math result not representable
    ERANGE = 34,
    /// Function not implemented
    ENOSYS = 38,
    /// Directory not empty
    ENOTEMPTY = 39,
    /// Socket operation on non-socket
    ENOTSOCK = 88,
    /// Address family not supported by protocol
    EAFNOSUPPORT = 97,
}

impl Errno {
    /// The negated value this error produces in a syscall return register.
    pub const fn sysret(self) -> isize {
        -(self as i32 as isize)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EPERM => "EPERM",
            Self::ENOENT => "ENOENT",
            Self::ESRCH => "ESRCH",
            Self::EINTR => "EINTR",
            Self::EIO => "EIO",
            Self::ENXIO => "ENXIO",
            Self::ENOEXEC => "ENOEXEC",
            Self::EBADF => "EBADF",
            Self::ECHILD => "ECHILD",
            Self::EAGAIN => "EAGAIN",
            Self::ENOMEM => "ENOMEM",
            Self::EACCES => "EACCES",
            Self::EFAULT => "EFAULT",
            Self::EBUSY => "EBUSY",
            Self::EEXIST => "EEXIST",
            Self::ENODEV => "ENODEV",
            Self::ENOTDIR => "ENOTDIR",
            Self::EISDIR => "EISDIR",
            Self::EINVAL => "EINVAL",
            Self::ENFILE => "ENFILE",
            Self::EMFILE => "EMFILE",
            Self::ENOTTY => "ENOTTY",
            Self::ENOSPC => "ENOSPC",
            Self::ESPIPE => "ESPIPE",
            Self::EROFS => "EROFS",
            Self::EPIPE => "EPIPE",
            Self::EDOM => "EDOM",
            Self::ERANGE => "ERANGE",
            Self::ENOSYS => "ENOSYS",
            Self::ENOTEMPTY => "ENOTEMPTY",
            Self::ENOTSOCK => "ENOTSOCK",
            Self::EAFNOSUPPORT => "EAFNOSUPPORT",
        };
        write!(f, "{}", name)
    }
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, Errno>;

/// Fold a `KernelResult<usize>` into the register encoding of the syscall
/// ABI: non-negative payload on success, negated errno on failure.
pub fn encode_sysret(res: KernelResult<usize>) -> isize {
    match res {
        Ok(v) => v as isize,
        Err(e) => e.sysret(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_match_unix() {
        assert_eq!(Errno::EPERM as i32, 1);
        assert_eq!(Errno::EINTR as i32, 4);
        assert_eq!(Errno::EBADF as i32, 9);
        assert_eq!(Errno::EINVAL as i32, 22);
        assert_eq!(Errno::ESPIPE as i32, 29);
        assert_eq!(Errno::ENOSYS as i32, 38);
    }

    #[test]
    fn sysret_encoding() {
        assert_eq!(encode_sysret(Ok(42)), 42);
        assert_eq!(encode_sysret(Err(Errno::ENOENT)), -2);
        assert_eq!(Errno::EFAULT.sysret(), -14);
    }
}
