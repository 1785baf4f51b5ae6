//! Kernel pipes.
//!
//! A unidirectional byte stream between a writer end and a reader end,
//! surfaced as two `File`s over one shared ring. Reads block until data or
//! writer hang-up (then EOF); writes block while full and fail with
//! `EPIPE` (plus `SIGPIPE` to the writer) once every reader is gone.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::error::{Errno, KernelResult};
use crate::sync::IrqLock;
use crate::task::signal::{force_sig_current, Sig};

use super::file::{File, FileOps, Private};
use super::poll::{PollEvents, PollTable, WaitQueue};
use super::{Mode, OpenFlags};

/// Pipe capacity in bytes.
pub const PIPE_CAPACITY: usize = 64 * 1024;

struct PipeInner {
    buffer: VecDeque<u8>,
    readers: usize,
    writers: usize,
}

/// Shared pipe object; both ends hold an `Arc`.
pub struct Pipe {
    inner: IrqLock<PipeInner>,
    /// Serializes writers so concurrent writes never interleave.
    write_mutex: crate::sync::Mutex,
    /// Readers sleeping for data, pollers included.
    read_wait: Arc<WaitQueue>,
    /// Writers sleeping for room.
    write_wait: Arc<WaitQueue>,
}

impl Pipe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: IrqLock::new(PipeInner {
                buffer: VecDeque::new(),
                readers: 1,
                writers: 1,
            }),
            write_mutex: crate::sync::Mutex::new(),
            read_wait: Arc::new(WaitQueue::new()),
            write_wait: Arc::new(WaitQueue::new()),
        })
    }

    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut inner = self.inner.lock();
                if !inner.buffer.is_empty() {
                    let n = buf.len().min(inner.buffer.len());
                    for byte in buf.iter_mut().take(n) {
                        *byte = inner.buffer.pop_front().unwrap_or(0);
                    }
                    drop(inner);
                    self.write_wait.wake_all();
                    return Ok(n);
                }
                if inner.writers == 0 {
                    return Ok(0); // EOF
                }
            }
            self.read_wait.wait_interruptible(|| {
                let inner = self.inner.lock();
                !inner.buffer.is_empty() || inner.writers == 0
            })?;
        }
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        let _writer = self.write_mutex.lock_interruptible()?;
        let mut written = 0;
        while written < buf.len() {
            {
                let mut inner = self.inner.lock();
                if inner.readers == 0 {
                    // Nobody will ever read this.
                    force_sig_current(Sig::PIPE);
                    return if written > 0 { Ok(written) } else { Err(Errno::EPIPE) };
                }
                while written < buf.len() && inner.buffer.len() < PIPE_CAPACITY {
                    inner.buffer.push_back(buf[written]);
                    written += 1;
                }
            }
            self.read_wait.wake_all();
            if written < buf.len() {
                self.write_wait.wait_interruptible(|| {
                    let inner = self.inner.lock();
                    inner.buffer.len() < PIPE_CAPACITY || inner.readers == 0
                })?;
            }
        }
        Ok(written)
    }

    fn poll(&self, reader: bool, wait: &mut PollTable) -> PollEvents {
        wait.wait_on(if reader {
            &self.read_wait
        } else {
            &self.write_wait
        });
        let inner = self.inner.lock();
        let mut events = PollEvents::empty();
        if reader {
            if !inner.buffer.is_empty() {
                events |= PollEvents::IN;
            }
            if inner.writers == 0 {
                events |= PollEvents::HUP;
            }
        } else {
            if inner.buffer.len() < PIPE_CAPACITY {
                events |= PollEvents::OUT;
            }
            if inner.readers == 0 {
                events |= PollEvents::ERR;
            }
        }
        events
    }
}

fn pipe_of(file: &File) -> Option<Arc<Pipe>> {
    match &*file.private.lock() {
        Some(Private::Pipe(pipe)) => Some(pipe.clone()),
        _ => None,
    }
}

struct PipeReadOps;

impl FileOps for PipeReadOps {
    fn read(&self, file: &File, buf: &mut [u8]) -> KernelResult<usize> {
        pipe_of(file).ok_or(Errno::EBADF)?.read(buf)
    }

    fn seek(&self, _file: &File, _offset: i32, _whence: super::file::Whence) -> KernelResult<i32> {
        Err(Errno::ESPIPE)
    }

    fn poll(&self, file: &File, wait: &mut PollTable) -> PollEvents {
        match pipe_of(file) {
            Some(pipe) => pipe.poll(true, wait),
            None => PollEvents::NVAL,
        }
    }

    fn release(&self, file: &File) {
        if let Some(pipe) = pipe_of(file) {
            pipe.inner.lock().readers -= 1;
            pipe.write_wait.wake_all();
        }
    }

    fn supports_read(&self) -> bool {
        true
    }
}

struct PipeWriteOps;

impl FileOps for PipeWriteOps {
    fn write(&self, file: &File, buf: &[u8]) -> KernelResult<usize> {
        pipe_of(file).ok_or(Errno::EBADF)?.write(buf)
    }

    fn seek(&self, _file: &File, _offset: i32, _whence: super::file::Whence) -> KernelResult<i32> {
        Err(Errno::ESPIPE)
    }

    fn poll(&self, file: &File, wait: &mut PollTable) -> PollEvents {
        match pipe_of(file) {
            Some(pipe) => pipe.poll(false, wait),
            None => PollEvents::NVAL,
        }
    }

    fn release(&self, file: &File) {
        if let Some(pipe) = pipe_of(file) {
            pipe.inner.lock().writers -= 1;
            pipe.read_wait.wake_all();
        }
    }

    fn supports_write(&self) -> bool {
        true
    }
}

/// Create a connected pipe pair `(read_end, write_end)`.
pub fn create_pipe() -> KernelResult<(Arc<File>, Arc<File>)> {
    let pipe = Pipe::new();

    let read_end = File::anonymous(Mode::FIFO, Arc::new(PipeReadOps), OpenFlags::empty())?;
    *read_end.private.lock() = Some(Private::Pipe(pipe.clone()));

    let write_end = File::anonymous(Mode::FIFO, Arc::new(PipeWriteOps), OpenFlags::WRONLY)?;
    *write_end.private.lock() = Some(Private::Pipe(pipe));

    Ok((read_end, write_end))
}
