//! File-descriptor tables.
//!
//! A sparse array of open-file handles with a parallel close-on-exec flag
//! array. The table is reference-counted (`Arc`) and shared wholesale by
//! `clone` when the file-sharing flag is set; otherwise the child gets a
//! slot-by-slot copy with every file's count bumped.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::file::File;
use crate::error::{Errno, KernelResult};

/// Hard per-task descriptor cap.
pub const MAX_FDS: usize = 256;

struct Inner {
    files: Vec<Option<Arc<File>>>,
    cloexec: Vec<bool>,
}

pub struct FdTable {
    inner: Mutex<Inner>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                files: Vec::new(),
                cloexec: Vec::new(),
            }),
        }
    }

    /// Install a file at the lowest free descriptor.
    pub fn install(&self, file: Arc<File>) -> KernelResult<usize> {
        let mut inner = self.inner.lock();
        for (fd, slot) in inner.files.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                inner.cloexec[fd] = false;
                return Ok(fd);
            }
        }
        if inner.files.len() >= MAX_FDS {
            return Err(Errno::EMFILE);
        }
        inner.files.push(Some(file));
        inner.cloexec.push(false);
        Ok(inner.files.len() - 1)
    }

    /// Install at a specific descriptor, closing whatever was there
    /// (dup2).
    pub fn install_at(&self, fd: usize, file: Arc<File>) -> KernelResult<usize> {
        if fd >= MAX_FDS {
            return Err(Errno::EBADF);
        }
        let mut inner = self.inner.lock();
        while inner.files.len() <= fd {
            inner.files.push(None);
            inner.cloexec.push(false);
        }
        inner.files[fd] = Some(file);
        inner.cloexec[fd] = false;
        Ok(fd)
    }

    pub fn get(&self, fd: usize) -> KernelResult<Arc<File>> {
        self.inner
            .lock()
            .files
            .get(fd)
            .and_then(Clone::clone)
            .ok_or(Errno::EBADF)
    }

    pub fn close(&self, fd: usize) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        match inner.files.get_mut(fd) {
            Some(slot @ Some(_)) => {
                *slot = None;
                inner.cloexec[fd] = false;
                Ok(())
            }
            _ => Err(Errno::EBADF),
        }
    }

    pub fn set_cloexec(&self, fd: usize, value: bool) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        if inner.files.get(fd).map_or(true, Option::is_none) {
            return Err(Errno::EBADF);
        }
        inner.cloexec[fd] = value;
        Ok(())
    }

    pub fn get_cloexec(&self, fd: usize) -> KernelResult<bool> {
        let inner = self.inner.lock();
        if inner.files.get(fd).map_or(true, Option::is_none) {
            return Err(Errno::EBADF);
        }
        Ok(inner.cloexec[fd])
    }

    /// Exec: drop every descriptor marked close-on-exec.
    pub fn close_cloexec(&self) {
        let mut inner = self.inner.lock();
        for fd in 0..inner.files.len() {
            if inner.cloexec[fd] {
                inner.files[fd] = None;
                inner.cloexec[fd] = false;
            }
        }
    }

    /// Slot-by-slot copy for clone without file sharing. The `Arc` clones
    /// are the per-file count bumps.
    pub fn clone_table(&self) -> FdTable {
        let inner = self.inner.lock();
        FdTable {
            inner: Mutex::new(Inner {
                files: inner.files.clone(),
                cloexec: inner.cloexec.clone(),
            }),
        }
    }

    /// Number of live descriptors.
    pub fn count(&self) -> usize {
        self.inner
            .lock()
            .files
            .iter()
            .filter(|f| f.is_some())
            .count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::file::default_file_ops;
    use crate::fs::{Mode, OpenFlags};

    fn dummy_file() -> Arc<File> {
        File::anonymous(Mode::REG, default_file_ops(), OpenFlags::empty()).unwrap()
    }

    #[test]
    fn install_reuses_lowest_free_slot() {
        let table = FdTable::new();
        assert_eq!(table.install(dummy_file()).unwrap(), 0);
        assert_eq!(table.install(dummy_file()).unwrap(), 1);
        assert_eq!(table.install(dummy_file()).unwrap(), 2);
        table.close(1).unwrap();
        assert_eq!(table.install(dummy_file()).unwrap(), 1);
    }

    #[test]
    fn cloexec_filtering() {
        let table = FdTable::new();
        let keep = table.install(dummy_file()).unwrap();
        let drop_fd = table.install(dummy_file()).unwrap();
        table.set_cloexec(drop_fd, true).unwrap();
        table.close_cloexec();
        assert!(table.get(keep).is_ok());
        assert_eq!(table.get(drop_fd).unwrap_err(), Errno::EBADF);
    }

    #[test]
    fn clone_table_shares_files_not_slots() {
        let table = FdTable::new();
        let fd = table.install(dummy_file()).unwrap();
        let copy = table.clone_table();
        copy.close(fd).unwrap();
        // Original still holds its descriptor.
        assert!(table.get(fd).is_ok());
    }

    #[test]
    fn bad_fd_is_ebadf() {
        let table = FdTable::new();
        assert_eq!(table.get(3).unwrap_err(), Errno::EBADF);
        assert_eq!(table.close(3).unwrap_err(), Errno::EBADF);
        assert_eq!(table.get_cloexec(0).unwrap_err(), Errno::EBADF);
    }
}
