//! Spindle: pollable inter-thread channels and script-worker threads
//! for embedding hosts.
//!
//! # Overview
//!
//! Spindle is the concurrency substrate for a host scripting
//! environment: it spawns OS worker threads, each running an isolated
//! script-interpreter instance, and moves tagged values between them
//! through bounded blocking channels. What makes it different from an
//! ordinary channel crate is that every blocking primitive is also a
//! first-class citizen of an external event loop: queue readiness and
//! worker termination are exposed as plain file descriptors that
//! `select(2)`, `poll(2)`, `epoll(7)` and `kqueue(2)` understand.
//!
//! # Core Guarantees
//!
//! - **Pollable blocking**: a channel endpoint is level-readable on its
//!   fd exactly while the corresponding operation would not block
//! - **One terminator byte**: every worker announces its exit by
//!   writing exactly one byte to its termination pipe, on every exit
//!   path
//! - **Isolated workers**: no state is shared between interpreter
//!   instances except reference-counted queues
//! - **Revocable rendezvous**: a capacity-1 push either delivers or
//!   revokes; a timeout never half-delivers a value
//! - **Captured failures**: worker script errors land in the thread
//!   status, never in a host panic
//!
//! # Module Structure
//!
//! - [`queue`]: the refcounted FIFO with dual readiness pipes
//! - [`channel`]: the host-facing value façade over a queue
//! - [`value`] / [`codec`]: the tagged value model and its wire format
//! - [`thread`]: worker lifecycle (spawn, join, cancel, status)
//! - [`poller`]: cooperative poller injection and the wait primitive
//! - [`error`]: the error taxonomy
//! - [`time`]: deadline arithmetic for timed waits
//!
//! # Example
//!
//! ```no_run
//! use spindle::{spawn_program, Channel, ScriptError, Value, WorkerContext};
//!
//! let ch = Channel::new(Some(2))?;
//! let mut worker = spawn_program(
//!     |ctx: &mut WorkerContext| {
//!         let ch = ctx.take_channel(0).ok_or_else(|| ScriptError::new("no channel"))?;
//!         ch.push(&Value::from("hello"), None)
//!             .map_err(|e| ScriptError::new(e.to_string()))
//!     },
//!     &[&ch],
//! )?;
//!
//! assert_eq!(ch.pop(None)?, Value::from("hello"));
//! worker.join(None)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![cfg(unix)]

pub mod channel;
pub mod codec;
pub mod error;
pub mod poller;
pub mod queue;
pub mod test_utils;
pub mod thread;
pub mod time;
pub mod value;

mod sys;

// Re-exports for convenient access to core types
pub use channel::Channel;
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use poller::{EventId, EventPoller};
pub use queue::{Deleter, PushOutcome, Queue, Ticket};
pub use thread::{
    register_engine, registered_engine, spawn_from_file, spawn_from_function, spawn_from_source,
    spawn_program, spawn_program_with, unregister_engine, CancelKind, CompileError, JoinOutcome,
    ScriptEngine, ScriptError, ScriptProgram, SourceUnit, SpawnError, SpawnOptions, Thread,
    ThreadStatus, WorkerContext, ERRMSG_MAX,
};
pub use value::{Value, ValueKind};
