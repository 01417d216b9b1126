//! Byte streams layered on the readiness poller.
//!
//! [`FdStream`] wraps a file descriptor, switches it to non-blocking mode
//! and turns every would-block condition into a fiber-friendly
//! [`poll::wait`]. Other fibers keep running while this one waits for the
//! descriptor; deadlines bound the whole read or write attempt.

use std::io::{self, Read, Write};
use std::mem::forget;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

use crate::clock::Deadline;
use crate::error::Error;
use crate::poll::{self, FdEvents};

/// Uses the fiber poller to wait out would-block conditions on the wrapped
/// descriptor.
pub struct FdStream {
    fd: RawFd,
}

impl FdStream {
    /// Take ownership of an fd-like object and switch it to non-blocking
    /// mode.
    pub fn new<T>(inner: T) -> Result<FdStream, io::Error>
    where
        T: IntoRawFd,
    {
        let fd = inner.into_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(FdStream { fd })
        }
    }

    /// Pull some bytes from the descriptor into `buf`, waiting for
    /// readability until the absolute `deadline`.
    pub fn read_deadline(
        &mut self,
        buf: &mut [u8],
        deadline: impl Into<Deadline>,
    ) -> io::Result<usize> {
        let deadline = deadline.into();
        loop {
            let rc = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
            poll::wait(self.fd, FdEvents::IN, deadline).map_err(into_io_error)?;
        }
    }

    /// Write a buffer into the descriptor, waiting for writability until
    /// the absolute `deadline`. Returns how many bytes were written.
    pub fn write_deadline(
        &mut self,
        buf: &[u8],
        deadline: impl Into<Deadline>,
    ) -> io::Result<usize> {
        let deadline = deadline.into();
        loop {
            let rc = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
            poll::wait(self.fd, FdEvents::OUT, deadline).map_err(into_io_error)?;
        }
    }
}

fn into_io_error(e: Error) -> io::Error {
    let kind = match e {
        Error::TimedOut => io::ErrorKind::TimedOut,
        Error::Cancelled => io::ErrorKind::Interrupted,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, e)
}

impl Read for FdStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_deadline(buf, Deadline::NEVER)
    }
}

impl Write for FdStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_deadline(buf, Deadline::NEVER)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for FdStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for FdStream {
    /// Release the descriptor without closing it. The poller entry is
    /// dropped; the caller is responsible for the descriptor from here on.
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        poll::clean(fd);
        forget(self);
        fd
    }
}

impl Drop for FdStream {
    fn drop(&mut self) {
        poll::clean(self.fd);
        unsafe { libc::close(self.fd) };
    }
}
