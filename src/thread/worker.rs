//! Worker-thread entry point and the self handle exposed to bodies.
//!
//! The entry installs two guards before the body runs:
//!
//! 1. a [`TerminationGuard`] that records the terminal state and writes
//!    the single terminator byte on every exit path, including unwinds
//! 2. the wait interrupt that turns every in-crate blocking wait on
//!    this thread into a cancellation point
//!
//! The body runs under `catch_unwind`, so a worker can fail, panic, or
//! be unwound by a hard cancel without ever taking the process down.

use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::Channel;
use crate::poller::{self, CancelUnwind, WaitStatus};
use crate::sys::{self, ReadOutcome};
use crate::thread::spawn::ScriptProgram;
use crate::thread::{StatusCell, Terminal};
use crate::time::Deadline;

/// The worker's own handle: bound channels plus its cancellation
/// endpoint.
///
/// Passed to the script body as its first and only argument. The
/// channels appear in the order they were supplied to the spawn call;
/// [`take_channel`](WorkerContext::take_channel) transfers ownership of
/// one into the body.
pub struct WorkerContext {
    channels: Vec<Option<Channel>>,
    cancel_rd: OwnedFd,
    cancel_observed: std::cell::Cell<bool>,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("channels", &self.channels.len())
            .field("fd_cancel", &self.fd_cancel())
            .finish_non_exhaustive()
    }
}

impl WorkerContext {
    pub(crate) fn new(channels: Vec<Channel>, cancel_rd: OwnedFd) -> Self {
        Self {
            channels: channels.into_iter().map(Some).collect(),
            cancel_rd,
            cancel_observed: std::cell::Cell::new(false),
        }
    }

    /// Number of channel slots bound at spawn time (taken or not).
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Borrows the channel bound at `index`, if still present.
    #[must_use]
    pub fn channel(&self, index: usize) -> Option<&Channel> {
        self.channels.get(index).and_then(Option::as_ref)
    }

    /// Takes ownership of the channel bound at `index`.
    ///
    /// Returns `None` for an out-of-range index or a slot already
    /// taken.
    pub fn take_channel(&mut self, index: usize) -> Option<Channel> {
        self.channels.get_mut(index).and_then(Option::take)
    }

    /// Read end of the cancellation pipe, for workers that integrate
    /// their own `select(2)` loop.
    #[must_use]
    pub fn fd_cancel(&self) -> RawFd {
        self.cancel_rd.as_raw_fd()
    }

    /// Non-blocking check for a cooperative cancellation notice.
    ///
    /// Sticky: once a notice has been observed this keeps returning
    /// true.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        if self.cancel_observed.get() {
            return true;
        }
        match sys::read_byte(self.cancel_rd.as_fd()) {
            // A byte, or a closed write end after the byte was drained,
            // both mean the owner asked us to stop.
            Ok(ReadOutcome::Byte(_) | ReadOutcome::Eof) => {
                self.cancel_observed.set(true);
                true
            }
            Ok(ReadOutcome::WouldBlock) => false,
            Err(err) => {
                tracing::warn!(error = %err, "cancellation pipe read failed");
                false
            }
        }
    }

    /// Sleeps up to `duration`, waking early when a cancellation notice
    /// arrives. Returns true on early wake.
    ///
    /// Like every blocking wait on a worker thread, this is a
    /// cancellation point for hard cancels.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Deadline::from_timeout(Some(duration));
        match poller::wait_readable(self.cancel_rd.as_raw_fd(), deadline) {
            Ok(WaitStatus::Ready) => true,
            Ok(WaitStatus::TimedOut) => false,
            Err(err) => {
                tracing::warn!(error = %err, "worker sleep wait failed");
                false
            }
        }
    }
}

/// Writes the terminator byte and records the terminal state exactly
/// once, no matter how the worker exits.
struct TerminationGuard {
    status: Arc<StatusCell>,
    term_wr: Option<OwnedFd>,
}

impl TerminationGuard {
    fn new(status: Arc<StatusCell>, term_wr: OwnedFd) -> Self {
        Self {
            status,
            term_wr: Some(term_wr),
        }
    }

    fn complete(mut self, terminal: Terminal) {
        self.finish(terminal);
    }

    fn finish(&mut self, terminal: Terminal) {
        let Some(term_wr) = self.term_wr.take() else {
            return;
        };
        self.status.record(terminal);
        // The byte announces termination to pollers and joiners; it is
        // written unconditionally, before any worker state is dropped.
        if let Err(err) = sys::write_byte(term_wr.as_fd()) {
            tracing::error!(error = %err, "termination byte write failed");
        }
        // Dropping the write end afterwards means a joiner that reads
        // EOF knows the protocol was violated.
    }
}

impl Drop for TerminationGuard {
    fn drop(&mut self) {
        // Reached without `complete`: the worker was unwound before the
        // protected call could report, which is the cancelled sentinel.
        self.finish(Terminal::Cancelled);
    }
}

/// Worker thread main: guard installation, protected call, teardown.
pub(crate) fn run(
    program: Box<dyn ScriptProgram>,
    mut ctx: WorkerContext,
    status: Arc<StatusCell>,
    term_wr: OwnedFd,
    hard_cancel: Arc<AtomicBool>,
) {
    let guard = TerminationGuard::new(status, term_wr);
    let interrupt = poller::install_interrupt(ctx.fd_cancel(), hard_cancel);

    let result = panic::catch_unwind(AssertUnwindSafe(|| program.run(&mut ctx)));

    let terminal = match result {
        Ok(Ok(())) => Terminal::Terminated,
        Ok(Err(err)) => Terminal::Failed(err.into_message()),
        Err(payload) => match payload.downcast::<CancelUnwind>() {
            Ok(_) => Terminal::Cancelled,
            Err(payload) => Terminal::Failed(panic_message(payload.as_ref())),
        },
    };

    drop(interrupt);
    guard.complete(terminal);
    // The worker's interpreter-side state (its channel handles) is torn
    // down only after the terminator byte is on the wire.
    drop(ctx);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_owned()
    }
}
