//! Worker threads running isolated script bodies.
//!
//! A [`Thread`] owns one OS worker thread. The worker runs a compiled
//! script body (see [`spawn`]) against its own [`WorkerContext`], fully
//! isolated from the host interpreter; the only shared state is the set
//! of queue references bound at spawn time.
//!
//! # Lifecycle
//!
//! ```text
//!            spawn
//!              │
//!              ▼
//!          RUNNING ──── body returns Ok ─────▶ TERMINATED
//!              │ ────── body returns Err ────▶ FAILED (message kept)
//!              │ ────── hard cancel ─────────▶ CANCELLED
//!              ▼
//!       join() reads the terminator byte, reaps the OS thread
//! ```
//!
//! The transition is made by a termination guard inside the worker that
//! runs on every exit path. It records the terminal state, then writes
//! exactly one byte `'0'` to the termination pipe, then lets the worker
//! state drop. The read end of that pipe is exposed through
//! [`Thread::fd`], so a host event loop can `poll(2)` for worker exit
//! the same way it polls sockets.
//!
//! # Cancellation
//!
//! Two forms, both idempotent:
//!
//! - [`CancelKind::Notify`]: delivers one byte on the cancellation pipe
//!   and closes its write end. The worker observes it cooperatively via
//!   [`WorkerContext::is_cancelled`] and exits normally (TERMINATED).
//! - [`CancelKind::Hard`]: additionally raises the hard-cancel flag.
//!   Every blocking wait inside the crate doubles as a cancellation
//!   point on worker threads; the next one the worker reaches unwinds
//!   it and the guard records CANCELLED. A worker spinning in pure
//!   computation is only cancelled at its next cancellation point.
//!
//! Dropping an unjoined `Thread` hard-cancels and reaps the worker.

pub mod spawn;
mod worker;

pub use spawn::{
    register_engine, registered_engine, spawn_from_file, spawn_from_function, spawn_from_source,
    spawn_program, spawn_program_with, unregister_engine, CompileError, ScriptEngine, ScriptError,
    ScriptProgram, SourceUnit, SpawnError, SpawnOptions,
};
pub use worker::WorkerContext;

use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, ErrorKind, Result};
use crate::poller;
use crate::sys::{self, ReadOutcome};
use crate::time::Deadline;

/// Upper bound, in bytes, of a captured worker error message
/// (including the implicit terminator of the original C layout).
pub const ERRMSG_MAX: usize = 1024;

/// Which cancellation protocol [`Thread::cancel`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    /// Unwind the worker at its next cancellation point.
    Hard,
    /// Deliver a cooperative notice; the worker exits on its own terms.
    Notify,
}

/// Host-visible thread state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Not yet joined.
    Running,
    /// The body returned normally.
    Terminated,
    /// The worker was unwound by a hard cancel.
    Cancelled,
    /// The body raised; the message is truncated to
    /// [`ERRMSG_MAX`]` - 1` bytes.
    Failed {
        /// The captured error message.
        message: String,
    },
}

impl ThreadStatus {
    /// The status label: `"running"`, `"terminated"`, `"cancelled"` or
    /// `"failed"`.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Terminated => "terminated",
            Self::Cancelled => "cancelled",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Outcome of [`Thread::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The worker terminated and was reaped.
    Joined,
    /// The bounded wait expired; the worker is still running.
    TimedOut,
}

/// Terminal state recorded by the worker's termination guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Terminal {
    Terminated,
    Cancelled,
    Failed(String),
}

impl Terminal {
    fn to_status(&self) -> ThreadStatus {
        match self {
            Self::Terminated => ThreadStatus::Terminated,
            Self::Cancelled => ThreadStatus::Cancelled,
            Self::Failed(message) => ThreadStatus::Failed {
                message: message.clone(),
            },
        }
    }
}

/// Shared cell the worker records its terminal state into.
///
/// Recording happens before the terminator byte is written; the reader
/// locks the same mutex after seeing the byte, which establishes the
/// happens-before edge.
pub(crate) struct StatusCell {
    recorded: Mutex<Option<Terminal>>,
}

impl StatusCell {
    pub(crate) const fn new() -> Self {
        Self {
            recorded: parking_lot::const_mutex(None),
        }
    }

    pub(crate) fn record(&self, terminal: Terminal) {
        let terminal = match terminal {
            Terminal::Failed(message) => Terminal::Failed(truncate_message(message)),
            other => other,
        };
        let mut slot = self.recorded.lock();
        // First writer wins; the guard only records once per worker.
        if slot.is_none() {
            tracing::debug!(terminal = ?terminal, "worker terminal state recorded");
            *slot = Some(terminal);
        }
    }

    fn get(&self) -> Option<Terminal> {
        self.recorded.lock().clone()
    }
}

/// Truncates a message to `ERRMSG_MAX - 1` bytes on a char boundary.
fn truncate_message(mut message: String) -> String {
    const LIMIT: usize = ERRMSG_MAX - 1;
    if message.len() > LIMIT {
        let mut end = LIMIT;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}

/// Handle to a spawned worker thread.
///
/// Created by the [`spawn`] functions. See the
/// [module documentation](self) for the lifecycle contract.
pub struct Thread {
    handle: Option<std::thread::JoinHandle<()>>,
    term_rd: Option<OwnedFd>,
    cancel_wr: Option<OwnedFd>,
    hard_cancel: Arc<AtomicBool>,
    status: Arc<StatusCell>,
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("status", &self.status())
            .field("fd", &self.fd())
            .finish_non_exhaustive()
    }
}

impl Thread {
    pub(crate) fn new(
        handle: std::thread::JoinHandle<()>,
        term_rd: OwnedFd,
        cancel_wr: OwnedFd,
        hard_cancel: Arc<AtomicBool>,
        status: Arc<StatusCell>,
    ) -> Self {
        Self {
            handle: Some(handle),
            term_rd: Some(term_rd),
            cancel_wr: Some(cancel_wr),
            hard_cancel,
            status,
        }
    }

    /// Waits up to `timeout` for the worker to terminate, then reaps
    /// it.
    ///
    /// Exactly one join consumes the terminator byte; further calls
    /// return [`JoinOutcome::Joined`] immediately. `Some(Duration::ZERO)`
    /// performs a single non-blocking check.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Internal`] if the termination pipe violates its
    /// one-byte protocol (closed without a byte, or a byte other than
    /// `'0'`); [`ErrorKind::Resource`] on descriptor failures.
    pub fn join(&mut self, timeout: Option<Duration>) -> Result<JoinOutcome> {
        let deadline = Deadline::from_timeout(timeout);
        loop {
            let Some(term_rd) = self.term_rd.as_ref() else {
                return Ok(JoinOutcome::Joined);
            };
            match sys::read_byte(term_rd.as_fd()) {
                Ok(ReadOutcome::Byte(sys::SIGNAL_BYTE)) => break,
                Ok(ReadOutcome::Byte(other)) => {
                    return Err(Error::new(ErrorKind::Internal)
                        .with_context(format!("invalid termination byte: {other:#x}")));
                }
                Ok(ReadOutcome::Eof) => {
                    return Err(Error::new(ErrorKind::Internal)
                        .with_context("termination pipe closed without a terminator byte"));
                }
                Ok(ReadOutcome::WouldBlock) => {
                    match poller::wait_readable(term_rd.as_raw_fd(), deadline)? {
                        poller::WaitStatus::Ready => {}
                        poller::WaitStatus::TimedOut => return Ok(JoinOutcome::TimedOut),
                    }
                }
                Err(err) if err.raw_os_error() == Some(libc::EBADF) => {
                    // Someone closed the descriptor out from under us.
                    // If the worker already recorded its exit, reap it
                    // anyway instead of reporting a protocol error.
                    if self.status.get().is_some() {
                        break;
                    }
                    return Err(Error::from_io(err).with_context("termination pipe unreadable"));
                }
                Err(err) => {
                    return Err(Error::from_io(err).with_context("termination pipe read failed"));
                }
            }
        }

        self.reap()?;
        self.term_rd = None;
        tracing::debug!(status = self.status().label(), "worker joined");
        Ok(JoinOutcome::Joined)
    }

    fn reap(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| {
                Error::new(ErrorKind::Internal).with_context("worker escaped its harness")
            })?;
        }
        Ok(())
    }

    /// Requests cancellation. Idempotent in either form; cancelling an
    /// already-terminated worker succeeds and does nothing.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Resource`] if the cancellation pipe write fails.
    pub fn cancel(&mut self, kind: CancelKind) -> Result<()> {
        if kind == CancelKind::Hard {
            // Raise the flag before arming the pipe so a waiting worker
            // cannot observe the wakeup without the flag.
            self.hard_cancel.store(true, Ordering::SeqCst);
        }
        if let Some(cancel_wr) = self.cancel_wr.take() {
            sys::write_byte(cancel_wr.as_fd())
                .map_err(|e| Error::from_io(e).with_context("cancellation pipe write failed"))?;
            // Dropping the descriptor closes the write end; the read
            // end then stays permanently poll-readable in the worker.
            tracing::debug!(?kind, "cancellation delivered");
        }
        Ok(())
    }

    /// Reports the thread status.
    ///
    /// `Running` until a successful [`join`](Thread::join); afterwards
    /// the terminal state the worker recorded, including the captured
    /// message for failed workers.
    #[must_use]
    pub fn status(&self) -> ThreadStatus {
        if self.term_rd.is_some() {
            return ThreadStatus::Running;
        }
        // The terminator byte is only written after recording, so a
        // joined thread always has a terminal state; the fallback is
        // the forced-unwind sentinel.
        self.status
            .get()
            .as_ref()
            .map_or(ThreadStatus::Cancelled, Terminal::to_status)
    }

    /// Read end of the termination pipe for external event loops, or
    /// `-1` once the thread has been joined.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.term_rd.as_ref().map_or(-1, |fd| fd.as_raw_fd())
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            // Unjoined handle going away: cancel and reap so the worker
            // cannot outlive every reference to it.
            let _ = self.cancel(CancelKind::Hard);
            let _ = self.reap();
        }
    }
}
