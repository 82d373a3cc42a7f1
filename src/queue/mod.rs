//! The cross-thread FIFO primitive with pollable readiness.
//!
//! A [`Queue`] is a reference-counted bounded FIFO shared by any number
//! of threads. What sets it apart from an ordinary mutex-guarded deque
//! is that its readability and writability are individually observable
//! through OS file descriptors, so a queue endpoint can sit in the same
//! `select(2)`/`poll(2)`/`epoll(7)` set as sockets and timers.
//!
//! # Readiness signalling
//!
//! The queue owns two pipes, one per direction:
//!
//! ```text
//!              ┌──────────────────────────────┐
//!   pollers ──▶│ read end   P_read   write end│◀── armed on 0 → 1 items
//!              ├──────────────────────────────┤
//!   pollers ──▶│ read end   P_write  write end│◀── armed on full → spare
//!              └──────────────────────────────┘
//! ```
//!
//! Each pipe carries at most one in-flight byte. A pipe is *armed* by
//! writing one byte and *disarmed* by reading it back, always inside the
//! queue's critical section and only on the state transition itself:
//!
//! - push onto an empty queue arms `P_read`; push that fills the queue
//!   disarms `P_write`
//! - pop that empties the queue disarms `P_read`; pop from a full queue
//!   arms `P_write`
//!
//! The result is that [`Queue::fd_readable`] is level-readable exactly
//! while the queue holds items, and [`Queue::fd_writable`] exactly while
//! it has spare capacity. External event loops need no wake-up protocol
//! of their own.
//!
//! # Lifetime
//!
//! Handles are cheap clones; cloning is the `ref`, dropping the `unref`.
//! When the last handle drops, the deleter (if any) runs over every
//! still-queued payload and both pipes are closed.

use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, ErrorKind, Result, ResultExt};
use crate::sys::{self, ReadOutcome};

/// Callback invoked on every payload still queued at final unreference.
///
/// Runs with the queue's exclusion held: it must not block and must not
/// touch the queue it is cleaning up.
pub type Deleter<T> = Box<dyn FnMut(T) + Send>;

/// Identity token of a pushed item, used to revoke it with
/// [`Queue::pop_match`] while it is still queued.
///
/// Tickets are unique per queue for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

/// Outcome of [`Queue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome<T> {
    /// The item was enqueued; the ticket identifies it until popped.
    Pushed(Ticket),
    /// The queue is at capacity; the payload is handed back untouched.
    Full(T),
}

struct Item<T> {
    ticket: Ticket,
    payload: T,
    size: usize,
}

struct State<T> {
    items: VecDeque<Item<T>>,
    /// Accounted bytes: payload sizes plus per-item overhead.
    total_size: usize,
    next_ticket: u64,
    /// Mirror of "one byte is in flight on `P_read`".
    readable: bool,
    /// Mirror of "one byte is in flight on `P_write`".
    writable: bool,
    deleter: Option<Deleter<T>>,
}

struct Shared<T> {
    max_items: usize,
    /// `(read end, write end)` of the pipe armed while items are queued.
    read_pipe: (OwnedFd, OwnedFd),
    /// `(read end, write end)` of the pipe armed while capacity is spare.
    write_pipe: (OwnedFd, OwnedFd),
    state: Mutex<State<T>>,
}

/// A thread-safe bounded FIFO with pollable readiness endpoints.
///
/// See the [module documentation](self) for the signalling contract.
pub struct Queue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("Queue")
            .field("max_items", &self.shared.max_items)
            .field("len", &st.items.len())
            .field("readable", &st.readable)
            .field("writable", &st.writable)
            .field("nref", &Arc::strong_count(&self.shared))
            .finish_non_exhaustive()
    }
}

impl<T: Send> Queue<T> {
    /// Creates a queue holding at most `max_items` items.
    ///
    /// `max_items` of 0 or 1 yields a rendezvous queue of capacity 1.
    /// The fresh queue is empty, so its writable endpoint starts armed.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Resource`] if pipe creation fails (e.g. out of file
    /// descriptors).
    pub fn new(max_items: usize) -> Result<Self> {
        Self::build(max_items, None)
    }

    /// Creates a queue with a deleter run over payloads still queued at
    /// final unreference.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Queue::new`].
    pub fn with_deleter(max_items: usize, deleter: Deleter<T>) -> Result<Self> {
        Self::build(max_items, Some(deleter))
    }

    fn build(max_items: usize, deleter: Option<Deleter<T>>) -> Result<Self> {
        let read_pipe = sys::pipe_pair().context("readable-signal pipe")?;
        let write_pipe = sys::pipe_pair().context("writable-signal pipe")?;

        let shared = Shared {
            max_items: max_items.max(1),
            read_pipe,
            write_pipe,
            state: Mutex::new(State {
                items: VecDeque::new(),
                total_size: 0,
                next_ticket: 0,
                readable: false,
                writable: false,
                deleter,
            }),
        };

        // A fresh queue has spare capacity; arm the writable endpoint.
        {
            let mut st = shared.state.lock();
            shared.arm_writable(&mut st)?;
        }

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    /// Returns true if no items are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().items.is_empty()
    }

    /// Accounted memory use: payload sizes plus per-item overhead.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.state.lock().total_size
    }

    /// Maximum number of items the queue holds.
    #[must_use]
    pub fn max_items(&self) -> usize {
        self.shared.max_items
    }

    /// Number of live handles to this queue.
    #[must_use]
    pub fn nref(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    /// Descriptor that is poll-readable exactly while the queue holds
    /// items. Owned by the queue; do not close it.
    #[must_use]
    pub fn fd_readable(&self) -> RawFd {
        self.shared.read_pipe.0.as_raw_fd()
    }

    /// Descriptor that is poll-readable exactly while the queue has
    /// spare capacity. Owned by the queue; do not close it.
    #[must_use]
    pub fn fd_writable(&self) -> RawFd {
        self.shared.write_pipe.0.as_raw_fd()
    }

    /// Enqueues `payload` at the tail.
    ///
    /// `size` is the caller-declared payload byte count used for the
    /// [`size`](Queue::size) accounting.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Resource`] or [`ErrorKind::Internal`] if the
    /// readiness pipes fail; the queue itself is not modified in that
    /// case beyond the failed transition.
    pub fn push(&self, payload: T, size: usize) -> Result<PushOutcome<T>> {
        let shared = &*self.shared;
        let mut st = shared.state.lock();

        if st.items.len() >= shared.max_items {
            // The writable endpoint must already be quiet; make it so if
            // an earlier transition failed halfway.
            if st.writable {
                shared.disarm_writable(&mut st)?;
            }
            return Ok(PushOutcome::Full(payload));
        }

        let was_empty = st.items.is_empty();
        let ticket = Ticket(st.next_ticket);
        st.next_ticket += 1;
        st.items.push_back(Item {
            ticket,
            payload,
            size,
        });
        st.total_size += size + std::mem::size_of::<Item<T>>();

        if was_empty {
            shared.arm_readable(&mut st)?;
        }
        if st.items.len() == shared.max_items {
            shared.disarm_writable(&mut st)?;
        }
        tracing::trace!(len = st.items.len(), ?ticket, "queue push");
        Ok(PushOutcome::Pushed(ticket))
    }

    /// Dequeues the head item, or returns `None` when empty.
    ///
    /// # Errors
    ///
    /// Same pipe failure conditions as [`Queue::push`].
    pub fn pop(&self) -> Result<Option<T>> {
        let shared = &*self.shared;
        let mut st = shared.state.lock();

        let Some(item) = st.items.pop_front() else {
            if st.readable {
                shared.disarm_readable(&mut st)?;
            }
            return Ok(None);
        };
        shared.settle_after_removal(&mut st, &item)?;
        tracing::trace!(len = st.items.len(), ticket = ?item.ticket, "queue pop");
        Ok(Some(item.payload))
    }

    /// Removes the item identified by `ticket` if it is still queued.
    ///
    /// Returns the payload when found, `None` when another thread
    /// already consumed it. Order among the remaining items is
    /// preserved. This is how a rendezvous push revokes its own
    /// unconsumed item on timeout.
    ///
    /// # Errors
    ///
    /// Same pipe failure conditions as [`Queue::push`].
    pub fn pop_match(&self, ticket: Ticket) -> Result<Option<T>> {
        let shared = &*self.shared;
        let mut st = shared.state.lock();

        let Some(idx) = st.items.iter().position(|item| item.ticket == ticket) else {
            return Ok(None);
        };
        let Some(item) = st.items.remove(idx) else {
            return Ok(None);
        };
        shared.settle_after_removal(&mut st, &item)?;
        tracing::trace!(len = st.items.len(), ?ticket, "queue pop_match");
        Ok(Some(item.payload))
    }
}

impl<T> Shared<T> {
    /// Readiness bookkeeping shared by [`Queue::pop`] and
    /// [`Queue::pop_match`] after one item left the queue.
    fn settle_after_removal(&self, st: &mut State<T>, removed: &Item<T>) -> Result<()> {
        st.total_size = st
            .total_size
            .saturating_sub(removed.size + std::mem::size_of::<Item<T>>());

        let was_full = st.items.len() + 1 == self.max_items;
        if was_full {
            self.arm_writable(st)?;
        }
        if st.items.is_empty() {
            self.disarm_readable(st)?;
        }
        Ok(())
    }

    fn arm_readable(&self, st: &mut State<T>) -> Result<()> {
        if !st.readable {
            arm(&self.read_pipe.1, "readable")?;
            st.readable = true;
        }
        Ok(())
    }

    fn disarm_readable(&self, st: &mut State<T>) -> Result<()> {
        if st.readable {
            disarm(&self.read_pipe.0, "readable")?;
            st.readable = false;
        }
        Ok(())
    }

    fn arm_writable(&self, st: &mut State<T>) -> Result<()> {
        if !st.writable {
            arm(&self.write_pipe.1, "writable")?;
            st.writable = true;
        }
        Ok(())
    }

    fn disarm_writable(&self, st: &mut State<T>) -> Result<()> {
        if st.writable {
            disarm(&self.write_pipe.0, "writable")?;
            st.writable = false;
        }
        Ok(())
    }
}

/// Puts the single in-flight byte onto a signal pipe.
///
/// `WouldBlock` means the byte is already buffered, which only happens
/// if a previous disarm failed; the pipe is armed either way.
fn arm(write_end: &OwnedFd, which: &str) -> Result<()> {
    sys::write_byte(write_end.as_fd())
        .map(|_| ())
        .map_err(|e| Error::from_io(e).with_context(format!("arming {which} endpoint")))
}

/// Takes the in-flight byte back off a signal pipe.
///
/// `WouldBlock` means no byte was buffered; the pipe is disarmed either
/// way. Reading EOF here is impossible while the queue is alive because
/// the queue owns both ends.
fn disarm(read_end: &OwnedFd, which: &str) -> Result<()> {
    match sys::read_byte(read_end.as_fd()) {
        Ok(ReadOutcome::Byte(_) | ReadOutcome::WouldBlock) => Ok(()),
        Ok(ReadOutcome::Eof) => Err(Error::new(ErrorKind::Internal)
            .with_context(format!("{which} signal pipe closed while queue alive"))),
        Err(e) => Err(Error::from_io(e).with_context(format!("disarming {which} endpoint"))),
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // Last handle gone: run the deleter over every remaining
        // payload. The pipes close when the OwnedFds drop.
        let st = self.state.get_mut();
        if let Some(mut deleter) = st.deleter.take() {
            for item in st.items.drain(..) {
                deleter(item.payload);
            }
        }
    }
}
