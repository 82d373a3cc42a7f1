//! Thin Unix syscall layer for the readiness machinery.
//!
//! Everything in this crate that touches the kernel goes through here:
//! pipe creation, the one-byte arm/disarm reads and writes, and the
//! `poll(2)` wait. All pipe ends are created `O_NONBLOCK` and
//! `FD_CLOEXEC`. `EINTR` is retried exactly once per syscall;
//! `EAGAIN`/`EWOULDBLOCK` is reported as a distinct non-error outcome.
//!
//! This is the only module in the crate that contains `unsafe` code.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// The single byte carried by every signalling pipe in the crate.
pub(crate) const SIGNAL_BYTE: u8 = b'0';

/// Outcome of a non-blocking one-byte read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// One byte was read.
    Byte(u8),
    /// Nothing buffered; the pipe is disarmed.
    WouldBlock,
    /// The write end is closed and the buffer is drained.
    Eof,
}

/// Outcome of a non-blocking one-byte write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    /// The byte was buffered.
    Written,
    /// The pipe buffer is full; the pipe is already armed.
    WouldBlock,
}

/// Outcome of a readable-wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// The primary fd became readable.
    Ready,
    /// The interrupt fd became readable first.
    Interrupted,
    /// The timeout expired.
    TimedOut,
}

fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

fn is_eintr(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINTR)
}

fn is_eagain(err: &io::Error) -> bool {
    // EWOULDBLOCK aliases EAGAIN on Linux but not on every platform.
    err.raw_os_error() == Some(libc::EAGAIN) || err.raw_os_error() == Some(libc::EWOULDBLOCK)
}

/// Creates a pipe with both ends `O_NONBLOCK` and `FD_CLOEXEC`.
///
/// Returns `(read_end, write_end)`.
pub(crate) fn pipe_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: `fds` is a valid out-pointer for two descriptors.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(last_os_error());
    }
    // SAFETY: on success both descriptors are open and owned by us.
    let rd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let wr = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    for fd in [&rd, &wr] {
        set_cloexec_nonblock(fd.as_raw_fd())?;
    }
    Ok((rd, wr))
}

fn set_cloexec_nonblock(fd: RawFd) -> io::Result<()> {
    // SAFETY: `fd` is an open descriptor owned by the caller.
    unsafe {
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) != 0 {
            return Err(last_os_error());
        }
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) != 0 {
            return Err(last_os_error());
        }
    }
    Ok(())
}

/// Reads at most one byte from `fd`, retrying once on `EINTR`.
pub(crate) fn read_byte(fd: BorrowedFd<'_>) -> io::Result<ReadOutcome> {
    let mut buf = [0u8; 1];
    let mut retried = false;
    loop {
        // SAFETY: `buf` is a valid one-byte buffer and `fd` is open.
        let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), 1) };
        return match n {
            1 => Ok(ReadOutcome::Byte(buf[0])),
            0 => Ok(ReadOutcome::Eof),
            _ => {
                let err = last_os_error();
                if is_eagain(&err) {
                    Ok(ReadOutcome::WouldBlock)
                } else if is_eintr(&err) && !retried {
                    retried = true;
                    continue;
                } else {
                    Err(err)
                }
            }
        };
    }
}

/// Writes the signal byte to `fd`, retrying once on `EINTR`.
pub(crate) fn write_byte(fd: BorrowedFd<'_>) -> io::Result<WriteOutcome> {
    let buf = [SIGNAL_BYTE];
    let mut retried = false;
    loop {
        // SAFETY: `buf` is a valid one-byte buffer and `fd` is open.
        let n = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), 1) };
        return if n == 1 {
            Ok(WriteOutcome::Written)
        } else {
            let err = last_os_error();
            if is_eagain(&err) {
                Ok(WriteOutcome::WouldBlock)
            } else if is_eintr(&err) && !retried {
                retried = true;
                continue;
            } else {
                Err(err)
            }
        };
    }
}

fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            // Round up so a sub-millisecond deadline still sleeps.
            let millis = d
                .as_millis()
                .saturating_add(u128::from(d.subsec_nanos() % 1_000_000 != 0));
            libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX)
        }
    }
}

/// Waits for `fd` to become readable, up to `timeout`.
///
/// When `interrupt` is given it is polled alongside `fd`; readability of
/// the interrupt fd wins over readability of the primary fd so that
/// cancellation is observed even when both fire in the same wakeup.
/// `None` blocks indefinitely; `Some(Duration::ZERO)` is a non-blocking
/// check. `EINTR` is retried once.
pub(crate) fn wait_readable(
    fd: RawFd,
    interrupt: Option<RawFd>,
    timeout: Option<Duration>,
) -> io::Result<WaitOutcome> {
    let mut fds = [
        libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: interrupt.unwrap_or(-1),
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    let nfds = if interrupt.is_some() { 2 } else { 1 };
    let millis = timeout_millis(timeout);

    let mut retried = false;
    loop {
        // SAFETY: `fds` is a valid array of `nfds` pollfd entries.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), nfds as libc::nfds_t, millis) };
        return match rc {
            0 => Ok(WaitOutcome::TimedOut),
            n if n > 0 => {
                let fired = |pfd: &libc::pollfd| {
                    pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
                };
                if interrupt.is_some() && fired(&fds[1]) {
                    Ok(WaitOutcome::Interrupted)
                } else if fired(&fds[0]) {
                    Ok(WaitOutcome::Ready)
                } else {
                    // Only POLLNVAL-class noise; treat as an error.
                    Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "poll reported an invalid descriptor",
                    ))
                }
            }
            _ => {
                let err = last_os_error();
                if is_eintr(&err) && !retried {
                    retried = true;
                    continue;
                }
                Err(err)
            }
        };
    }
}
