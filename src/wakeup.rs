//! Self-pipe used to break the transport wait when work arrives.
//!
//! Submitters post a single byte per empty-to-non-empty transition of the
//! submission queue; the worker includes the read side in the transport's
//! wait set and drains it whenever the wait reports readability.

#![allow(unsafe_code)]

use curl::multi::WaitFd;
use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    time::Duration,
};

/// Create a connected wakeup channel.
///
/// Both ends are non-blocking: writers never stall, and a full pipe just
/// means a wakeup is already pending.
pub(crate) fn pair() -> io::Result<(Reader, Writer)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let (reader, writer) = unsafe {
        (
            OwnedFd::from_raw_fd(fds[0]),
            OwnedFd::from_raw_fd(fds[1]),
        )
    };
    set_nonblocking_cloexec(reader.as_raw_fd())?;
    set_nonblocking_cloexec(writer.as_raw_fd())?;

    Ok((Reader { fd: reader }, Writer { fd: writer }))
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Write side, held by the agent handle while a worker is running.
#[derive(Debug)]
pub(crate) struct Writer {
    fd: OwnedFd,
}

impl Writer {
    /// Post one wakeup byte.
    ///
    /// Wakeups coalesce: if the pipe is full, one is already pending and the
    /// write is dropped.
    pub(crate) fn notify(&self) {
        let buf = [1u8];
        let _ = unsafe { libc::write(self.fd.as_raw_fd(), buf.as_ptr().cast(), 1) };
    }
}

/// Read side, exclusively owned by the worker for its lifetime.
#[derive(Debug)]
pub(crate) struct Reader {
    fd: OwnedFd,
}

impl Reader {
    /// Consume any pending wakeup bytes.
    ///
    /// A leftover byte only makes the next wait return immediately, so a
    /// partial drain is harmless.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n < buf.len() as isize {
                break;
            }
        }
    }

    /// Block for up to `timeout` waiting for a wakeup. Returns whether one
    /// arrived.
    pub(crate) fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
            if rc >= 0 {
                return Ok(rc > 0);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// A descriptor for including this channel in the transport's wait set.
    pub(crate) fn wait_fd(&self) -> WaitFd {
        let mut fd = WaitFd::new();
        fd.set_fd(self.fd.as_raw_fd());
        fd.poll_on_read(true);
        fd
    }
}
