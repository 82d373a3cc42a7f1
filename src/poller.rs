//! Waiting on readiness descriptors: blocking by default, cooperative
//! when the host injects a poller.
//!
//! The crate never hard-codes a concurrency runtime. Every bounded wait
//! (channel push/pop, thread join, worker sleep) funnels through
//! [`wait_readable`], which picks one of three strategies:
//!
//! 1. **Worker threads** always use a blocking `poll(2)` that watches
//!    the cancellation descriptor alongside the target descriptor, so
//!    every wait doubles as a cancellation point.
//! 2. **Host threads with a registered [`EventPoller`]** delegate the
//!    wait to the host event loop, which may suspend a cooperative task
//!    instead of parking the OS thread.
//! 3. **Everything else** parks in `poll(2)` directly.
//!
//! The injected poller only needs `wait_readable`; the event-handle API
//! (`new_event`/`wait_event`/`dispose_event`) is optional and defaults
//! to fd-keyed passthrough. [`CachedEvent`] lets long-lived owners such
//! as channels reuse one event handle per descriptor.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result, ResultExt};
use crate::sys::{self, WaitOutcome};
use crate::time::Deadline;

/// Outcome of a bounded readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitStatus {
    /// The descriptor became readable.
    Ready,
    /// The deadline expired first.
    TimedOut,
}

/// Handle to a poller-managed event source.
///
/// The default event API keys events by descriptor, so the identifier
/// is just the fd bits; a real cooperative poller may return arbitrary
/// identifiers from [`EventPoller::new_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub u64);

/// A cooperative readiness poller injected by the host event loop.
///
/// Implementations must be callable from any thread. A poller that
/// reports `is_pollable() == false` is ignored and the crate falls back
/// to blocking `poll(2)`.
pub trait EventPoller: Send + Sync {
    /// Whether the poller is currently able to service waits.
    fn is_pollable(&self) -> bool {
        true
    }

    /// Waits until `fd` is readable or `timeout` expires.
    ///
    /// Returns `Ok(true)` on readiness, `Ok(false)` on timeout. `None`
    /// waits without bound.
    ///
    /// # Errors
    ///
    /// Any I/O error from the underlying readiness mechanism.
    fn wait_readable(&self, fd: RawFd, timeout: Option<Duration>) -> std::io::Result<bool>;

    /// Creates a reusable event handle for `fd`.
    ///
    /// # Errors
    ///
    /// Any I/O error from event-source registration.
    #[allow(clippy::cast_sign_loss)]
    fn new_event(&self, fd: RawFd) -> std::io::Result<EventId> {
        Ok(EventId(fd as u64))
    }

    /// Waits on a handle created by [`new_event`](Self::new_event).
    ///
    /// # Errors
    ///
    /// Any I/O error from the underlying readiness mechanism.
    #[allow(clippy::cast_possible_truncation)]
    fn wait_event(&self, event: EventId, timeout: Option<Duration>) -> std::io::Result<bool> {
        self.wait_readable(event.0 as RawFd, timeout)
    }

    /// Releases a handle created by [`new_event`](Self::new_event).
    fn dispose_event(&self, event: EventId) {
        let _ = event;
    }
}

static POLLER: RwLock<Option<Arc<dyn EventPoller>>> = parking_lot::const_rwlock(None);

/// Registers the process-wide cooperative poller.
///
/// Replaces any previously registered poller.
pub fn register(poller: Arc<dyn EventPoller>) {
    *POLLER.write() = Some(poller);
}

/// Removes the process-wide cooperative poller, restoring blocking
/// waits.
pub fn unregister() {
    *POLLER.write() = None;
}

/// Returns the registered poller, if any.
#[must_use]
pub fn registered() -> Option<Arc<dyn EventPoller>> {
    POLLER.read().clone()
}

/// True if a registered poller is currently servicing waits.
#[must_use]
pub fn is_pollable() -> bool {
    registered().is_some_and(|p| p.is_pollable())
}

// ── Worker-side cancellation points ─────────────────────────────────

/// Panic payload used to unwind a worker at a cancellation point.
///
/// Raised only on worker threads whose owner requested a hard cancel;
/// the worker harness catches it and records the cancelled status.
/// Worker bodies must let it propagate.
pub(crate) struct CancelUnwind;

#[derive(Clone)]
struct WaitInterrupt {
    fd: RawFd,
    hard: Arc<AtomicBool>,
}

thread_local! {
    static INTERRUPT: RefCell<Option<WaitInterrupt>> = const { RefCell::new(None) };
}

/// Clears the thread's wait interrupt when the worker body finishes.
pub(crate) struct InterruptGuard {
    _priv: (),
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        INTERRUPT.with(|slot| slot.borrow_mut().take());
    }
}

/// Marks the current thread as a worker whose waits watch `fd` for
/// cancellation. `hard` is the owner's hard-cancel flag.
pub(crate) fn install_interrupt(fd: RawFd, hard: Arc<AtomicBool>) -> InterruptGuard {
    INTERRUPT.with(|slot| {
        *slot.borrow_mut() = Some(WaitInterrupt { fd, hard });
    });
    InterruptGuard { _priv: () }
}

fn current_interrupt() -> Option<WaitInterrupt> {
    INTERRUPT.with(|slot| slot.borrow().clone())
}

// ── The wait primitive ──────────────────────────────────────────────

/// Waits for `fd` to become readable, honoring the strategy order in
/// the [module documentation](self).
pub(crate) fn wait_readable(fd: RawFd, deadline: Deadline) -> Result<WaitStatus> {
    wait_inner(fd, deadline, None)
}

fn wait_inner(fd: RawFd, deadline: Deadline, cache: Option<&CachedEvent>) -> Result<WaitStatus> {
    if let Some(interrupt) = current_interrupt() {
        return wait_with_interrupt(fd, &interrupt, deadline);
    }

    if let Some(poller) = registered() {
        if poller.is_pollable() {
            return wait_cooperative(fd, deadline, cache, &*poller);
        }
    }

    blocking_wait(fd, None, deadline).map(|outcome| match outcome {
        WaitOutcome::Ready | WaitOutcome::Interrupted => WaitStatus::Ready,
        WaitOutcome::TimedOut => WaitStatus::TimedOut,
    })
}

/// Blocking wait on a worker thread; doubles as a cancellation point.
fn wait_with_interrupt(
    fd: RawFd,
    interrupt: &WaitInterrupt,
    deadline: Deadline,
) -> Result<WaitStatus> {
    let mut watch_cancel = true;
    loop {
        let extra = watch_cancel.then_some(interrupt.fd);
        match blocking_wait(fd, extra, deadline)? {
            WaitOutcome::Ready => return Ok(WaitStatus::Ready),
            WaitOutcome::TimedOut => return Ok(WaitStatus::TimedOut),
            WaitOutcome::Interrupted => {
                if interrupt.hard.load(Ordering::SeqCst) {
                    tracing::debug!(fd, "wait interrupted by hard cancel");
                    std::panic::panic_any(CancelUnwind);
                }
                // Cooperative notice only. The cancellation descriptor
                // stays armed until the worker consumes it, so stop
                // watching it for the rest of this wait.
                watch_cancel = false;
            }
        }
    }
}

fn wait_cooperative(
    fd: RawFd,
    deadline: Deadline,
    cache: Option<&CachedEvent>,
    poller: &dyn EventPoller,
) -> Result<WaitStatus> {
    let ready = match cache {
        Some(cache) => {
            let event = cache.event_for(fd, poller)?;
            poller
                .wait_event(event, deadline.remaining())
                .context("cooperative wait_event failed")?
        }
        None => poller
            .wait_readable(fd, deadline.remaining())
            .context("cooperative wait_readable failed")?,
    };
    Ok(if ready {
        WaitStatus::Ready
    } else {
        WaitStatus::TimedOut
    })
}

fn blocking_wait(fd: RawFd, extra: Option<RawFd>, deadline: Deadline) -> Result<WaitOutcome> {
    sys::wait_readable(fd, extra, deadline.remaining()).map_err(Error::from_io)
}

// ── Cached event handles ────────────────────────────────────────────

/// A lazily created, reusable poller event handle for one descriptor.
///
/// Channels keep one per readiness endpoint so repeated timed waits do
/// not re-register the fd with the cooperative poller every time.
#[derive(Default)]
pub(crate) struct CachedEvent {
    id: Mutex<Option<EventId>>,
}

impl CachedEvent {
    pub(crate) const fn new() -> Self {
        Self {
            id: parking_lot::const_mutex(None),
        }
    }

    /// Waits for `fd` through this cache.
    pub(crate) fn wait(&self, fd: RawFd, deadline: Deadline) -> Result<WaitStatus> {
        wait_inner(fd, deadline, Some(self))
    }

    fn event_for(&self, fd: RawFd, poller: &dyn EventPoller) -> Result<EventId> {
        let mut slot = self.id.lock();
        if let Some(id) = *slot {
            return Ok(id);
        }
        let id = poller.new_event(fd).context("poller new_event failed")?;
        *slot = Some(id);
        Ok(id)
    }

    /// Releases the cached handle, if one was created.
    pub(crate) fn dispose(&self) {
        if let Some(id) = self.id.lock().take() {
            if let Some(poller) = registered() {
                poller.dispose_event(id);
            }
        }
    }
}
