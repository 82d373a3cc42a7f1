//! The host-facing value channel over a [`Queue`].
//!
//! A [`Channel`] pairs 1:1 with a queue of encoded values and adds the
//! pieces a host binding needs:
//!
//! - value encoding/decoding through the fixed wire format in [`codec`]
//! - blocking, timed, and non-blocking push/pop driven by the queue's
//!   readiness descriptors
//! - Go-style rendezvous for capacity-1 channels: `push` returns only
//!   once the value has been consumed, and revokes its own item with
//!   [`Queue::pop_match`] when the wait times out
//! - idempotent [`close`](Channel::close) that releases the queue
//!   reference and any cached poller events
//!
//! A channel handle is exclusively owned by one interpreter instance.
//! Handing a channel to a spawned worker clones the underlying queue
//! reference, never the `Channel` itself.
//!
//! # Timeouts
//!
//! `timeout: None` waits without bound. `Some(Duration::ZERO)` performs
//! one non-blocking attempt, reporting [`ErrorKind::Full`] /
//! [`ErrorKind::Empty`]. Any other duration bounds the wait and reports
//! [`ErrorKind::TimedOut`] on expiry. A rendezvous push that times out
//! revokes the unconsumed value, so a timeout never half-delivers.

use std::os::fd::RawFd;
use std::time::Duration;

use parking_lot::RwLock;

use crate::codec;
use crate::error::{Error, ErrorKind, Result};
use crate::poller::{CachedEvent, WaitStatus};
use crate::queue::{PushOutcome, Queue, Ticket};
use crate::time::Deadline;
use crate::value::Value;

/// Payload type stored in channel queues: one encoded value.
pub(crate) type Encoded = Box<[u8]>;

/// A pollable, bounded value channel between interpreter instances.
///
/// See the [module documentation](self) for semantics.
pub struct Channel {
    queue: RwLock<Option<Queue<Encoded>>>,
    readable_event: CachedEvent,
    writable_event: CachedEvent,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.queue.read() {
            Some(q) => f
                .debug_struct("Channel")
                .field("len", &q.len())
                .field("max_items", &q.max_items())
                .field("nref", &q.nref())
                .finish_non_exhaustive(),
            None => f.debug_struct("Channel").field("closed", &true).finish(),
        }
    }
}

fn closed() -> Error {
    Error::new(ErrorKind::Closed).with_context("queue is closed")
}

impl Channel {
    /// Creates a channel holding at most `max_items` values.
    ///
    /// `None`, `Some(0)` and `Some(1)` all yield a rendezvous channel of
    /// capacity 1.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Resource`] if the readiness pipes cannot be created.
    pub fn new(max_items: Option<usize>) -> Result<Self> {
        let queue = Queue::new(max_items.unwrap_or(1))?;
        Ok(Self::from_queue(queue))
    }

    pub(crate) fn from_queue(queue: Queue<Encoded>) -> Self {
        Self {
            queue: RwLock::new(Some(queue)),
            readable_event: CachedEvent::new(),
            writable_event: CachedEvent::new(),
        }
    }

    /// Clones the underlying queue reference into a fresh channel
    /// handle for a spawned worker.
    pub(crate) fn duplicate(&self) -> Result<Self> {
        let guard = self.queue.read();
        let queue = guard.as_ref().ok_or_else(closed)?;
        Ok(Self::from_queue(queue.clone()))
    }

    /// Pushes a value, waiting up to `timeout` for room (and, on a
    /// rendezvous channel, for the value to be consumed).
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::Full`]: non-blocking push on a full channel
    /// - [`ErrorKind::TimedOut`]: the bounded wait expired; on a
    ///   rendezvous channel the value has been revoked
    /// - [`ErrorKind::Closed`]: the channel was closed
    /// - [`ErrorKind::Resource`] / [`ErrorKind::Internal`]: readiness
    ///   pipe failure
    pub fn push(&self, value: &Value, timeout: Option<Duration>) -> Result<()> {
        let deadline = Deadline::from_timeout(timeout);
        let nonblocking = timeout == Some(Duration::ZERO);
        let guard = self.queue.read();
        let queue = guard.as_ref().ok_or_else(closed)?;

        let mut payload = codec::encode(value);
        let size = payload.len();
        loop {
            match queue.push(payload, size)? {
                PushOutcome::Pushed(ticket) => {
                    if queue.max_items() == 1 {
                        return self.rendezvous_wait(queue, ticket, deadline, nonblocking);
                    }
                    return Ok(());
                }
                PushOutcome::Full(returned) => {
                    payload = returned;
                    match self.writable_event.wait(queue.fd_writable(), deadline)? {
                        WaitStatus::Ready => {}
                        WaitStatus::TimedOut => {
                            return Err(Error::new(if nonblocking {
                                ErrorKind::Full
                            } else {
                                ErrorKind::TimedOut
                            }));
                        }
                    }
                }
            }
        }
    }

    /// Waits until the pushed rendezvous value is consumed, revoking it
    /// if the deadline passes first.
    fn rendezvous_wait(
        &self,
        queue: &Queue<Encoded>,
        ticket: Ticket,
        deadline: Deadline,
        nonblocking: bool,
    ) -> Result<()> {
        match self.writable_event.wait(queue.fd_writable(), deadline)? {
            // Capacity 1: spare room means our value left the queue.
            WaitStatus::Ready => Ok(()),
            WaitStatus::TimedOut => match queue.pop_match(ticket)? {
                Some(_) => Err(Error::new(if nonblocking {
                    ErrorKind::Full
                } else {
                    ErrorKind::TimedOut
                })),
                // Gone already: a consumer took it between the timeout
                // and the revoke, which counts as delivery.
                None => Ok(()),
            },
        }
    }

    /// Pops the next value, waiting up to `timeout` for one to arrive.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::Empty`]: non-blocking pop on an empty channel
    /// - [`ErrorKind::TimedOut`]: the bounded wait expired
    /// - [`ErrorKind::Closed`]: the channel was closed
    /// - [`ErrorKind::Internal`]: a queue item failed to decode
    pub fn pop(&self, timeout: Option<Duration>) -> Result<Value> {
        let deadline = Deadline::from_timeout(timeout);
        let nonblocking = timeout == Some(Duration::ZERO);
        let guard = self.queue.read();
        let queue = guard.as_ref().ok_or_else(closed)?;

        loop {
            if let Some(payload) = queue.pop()? {
                return codec::decode(&payload).map_err(|e| {
                    Error::new(ErrorKind::Internal)
                        .with_context("queue item failed to decode")
                        .with_source(e)
                });
            }
            match self.readable_event.wait(queue.fd_readable(), deadline)? {
                WaitStatus::Ready => {}
                WaitStatus::TimedOut => {
                    return Err(Error::new(if nonblocking {
                        ErrorKind::Empty
                    } else {
                        ErrorKind::TimedOut
                    }));
                }
            }
        }
    }

    /// Closes the channel, releasing the queue reference and any cached
    /// poller events. Idempotent; later operations fail with
    /// [`ErrorKind::Closed`].
    pub fn close(&self) {
        let taken = self.queue.write().take();
        if taken.is_some() {
            self.readable_event.dispose();
            self.writable_event.dispose();
            tracing::debug!("channel closed");
        }
    }

    /// Returns true if [`close`](Channel::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.queue.read().is_none()
    }

    /// Number of queued values.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Closed`] if the channel was closed.
    pub fn len(&self) -> Result<usize> {
        self.with_queue(Queue::len)
    }

    /// Returns true if no values are queued.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Closed`] if the channel was closed.
    pub fn is_empty(&self) -> Result<bool> {
        self.with_queue(Queue::is_empty)
    }

    /// Accounted memory use of queued values.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Closed`] if the channel was closed.
    pub fn size(&self) -> Result<usize> {
        self.with_queue(Queue::size)
    }

    /// Maximum number of queued values.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Closed`] if the channel was closed.
    pub fn max_items(&self) -> Result<usize> {
        self.with_queue(Queue::max_items)
    }

    /// Number of live references to the underlying queue.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Closed`] if the channel was closed.
    pub fn nref(&self) -> Result<usize> {
        self.with_queue(Queue::nref)
    }

    /// Descriptor that polls readable while values are queued.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Closed`] if the channel was closed.
    pub fn fd_readable(&self) -> Result<RawFd> {
        self.with_queue(Queue::fd_readable)
    }

    /// Descriptor that polls readable while capacity is spare.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Closed`] if the channel was closed.
    pub fn fd_writable(&self) -> Result<RawFd> {
        self.with_queue(Queue::fd_writable)
    }

    fn with_queue<R>(&self, f: impl FnOnce(&Queue<Encoded>) -> R) -> Result<R> {
        let guard = self.queue.read();
        let queue = guard.as_ref().ok_or_else(closed)?;
        Ok(f(queue))
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn push_pop_round_trips_every_value_kind() {
        init_test("push_pop_round_trips_every_value_kind");
        let ch = Channel::new(Some(16)).expect("channel");
        let values = [
            Value::Bool(true),
            Value::Bool(false),
            Value::Integer(-42),
            Value::Number(2.75),
            Value::from(""),
            Value::from("hello"),
            Value::from(vec![0u8, 1, 255]),
            Value::LightPtr(0xdead_beef),
        ];
        for v in &values {
            ch.push(v, None).expect("push");
        }
        for v in &values {
            let popped = ch.pop(None).expect("pop");
            crate::assert_with_log!(popped == *v, "round trip", v, popped);
        }
        crate::test_complete!("push_pop_round_trips_every_value_kind");
    }

    #[test]
    fn nonblocking_pop_on_empty_is_fast() {
        init_test("nonblocking_pop_on_empty_is_fast");
        let ch = Channel::new(Some(2)).expect("channel");
        let start = Instant::now();
        let err = ch.pop(Some(Duration::ZERO)).expect_err("pop succeeded");
        assert_eq!(err.kind(), ErrorKind::Empty);
        assert!(
            start.elapsed() < Duration::from_millis(1),
            "non-blocking pop blocked"
        );
        crate::test_complete!("nonblocking_pop_on_empty_is_fast");
    }

    #[test]
    fn nonblocking_push_on_full_reports_again() {
        init_test("nonblocking_push_on_full_reports_again");
        let ch = Channel::new(Some(2)).expect("channel");
        ch.push(&Value::Integer(1), None).expect("push 1");
        ch.push(&Value::Integer(2), None).expect("push 2");

        let err = ch
            .push(&Value::Integer(3), Some(Duration::ZERO))
            .expect_err("push succeeded on full channel");
        assert_eq!(err.kind(), ErrorKind::Full);

        assert_eq!(ch.pop(None).expect("pop"), Value::Integer(1));
        ch.push(&Value::Integer(3), None).expect("push 3");
        assert_eq!(ch.pop(None).expect("pop"), Value::Integer(2));
        assert_eq!(ch.pop(None).expect("pop"), Value::Integer(3));
        crate::test_complete!("nonblocking_push_on_full_reports_again");
    }

    #[test]
    fn timed_pop_expires() {
        init_test("timed_pop_expires");
        let ch = Channel::new(Some(2)).expect("channel");
        let start = Instant::now();
        let err = ch
            .pop(Some(Duration::from_millis(30)))
            .expect_err("pop succeeded");
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(25));
        crate::test_complete!("timed_pop_expires");
    }

    #[test]
    fn rendezvous_push_times_out_and_revokes() {
        init_test("rendezvous_push_times_out_and_revokes");
        let ch = Channel::new(None).expect("channel");
        let err = ch
            .push(&Value::from("hello"), Some(Duration::from_millis(50)))
            .expect_err("push reported delivery with no consumer");
        assert_eq!(err.kind(), ErrorKind::TimedOut);

        // The value was revoked; nothing must be left behind.
        let err = ch
            .pop(Some(Duration::from_millis(10)))
            .expect_err("revoked value still delivered");
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert_eq!(ch.len().expect("len"), 0);
        crate::test_complete!("rendezvous_push_times_out_and_revokes");
    }

    #[test]
    fn rendezvous_push_completes_once_consumed() {
        init_test("rendezvous_push_completes_once_consumed");
        let ch = std::sync::Arc::new(Channel::new(Some(1)).expect("channel"));
        let producer = {
            let ch = std::sync::Arc::clone(&ch);
            std::thread::spawn(move || ch.push(&Value::from("hello"), None))
        };

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ch.pop(None).expect("pop"), Value::from("hello"));
        producer
            .join()
            .expect("producer panicked")
            .expect("rendezvous push failed");
        crate::test_complete!("rendezvous_push_completes_once_consumed");
    }

    #[test]
    fn close_is_idempotent_and_poisons_operations() {
        init_test("close_is_idempotent_and_poisons_operations");
        let ch = Channel::new(Some(2)).expect("channel");
        ch.push(&Value::Integer(1), None).expect("push");
        ch.close();
        ch.close();
        assert!(ch.is_closed());

        let err = ch.push(&Value::Integer(2), None).expect_err("push");
        assert_eq!(err.kind(), ErrorKind::Closed);
        assert_eq!(err.to_string(), "Closed: queue is closed");
        let err = ch.pop(None).expect_err("pop");
        assert_eq!(err.kind(), ErrorKind::Closed);
        let err = ch.len().expect_err("len");
        assert_eq!(err.kind(), ErrorKind::Closed);
        crate::test_complete!("close_is_idempotent_and_poisons_operations");
    }

    #[test]
    fn duplicate_shares_the_queue() {
        init_test("duplicate_shares_the_queue");
        let ch = Channel::new(Some(4)).expect("channel");
        assert_eq!(ch.nref().expect("nref"), 1);
        let dup = ch.duplicate().expect("duplicate");
        assert_eq!(ch.nref().expect("nref"), 2);

        ch.push(&Value::Integer(7), None).expect("push");
        assert_eq!(dup.pop(None).expect("pop"), Value::Integer(7));

        dup.close();
        assert_eq!(ch.nref().expect("nref"), 1);
        crate::test_complete!("duplicate_shares_the_queue");
    }

    #[test]
    fn capacity_defaults_to_rendezvous() {
        init_test("capacity_defaults_to_rendezvous");
        for spec in [None, Some(0), Some(1)] {
            let ch = Channel::new(spec).expect("channel");
            assert_eq!(ch.max_items().expect("max_items"), 1);
        }
        crate::test_complete!("capacity_defaults_to_rendezvous");
    }
}
