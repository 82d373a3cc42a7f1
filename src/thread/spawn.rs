//! Spawn plumbing: from a source unit to a running worker.
//!
//! The embedded script interpreter is an external collaborator. This
//! module fixes the seam: an injected [`ScriptEngine`] compiles a
//! [`SourceUnit`] inside a fresh, isolated interpreter instance (opening
//! its standard libraries and installing a traceback hook along the
//! way) and hands back a [`ScriptProgram`], the runnable worker body.
//! The plumbing here does the rest:
//!
//! 1. duplicate every supplied channel into the worker (each duplicate
//!    holds its own queue reference)
//! 2. create the termination and cancellation pipes
//! 3. start the OS thread; its entry installs the termination guard
//!    and runs the body as a protected call
//!
//! Compile failures are reported before any thread starts. A refusal
//! from the OS to create the thread right now surfaces as
//! [`SpawnError::Again`] so callers can back off and retry.
//!
//! Hosts without an interpreter can skip the engine entirely and pass a
//! closure to [`spawn_program`]; any `FnOnce(&mut WorkerContext) ->
//! Result<(), ScriptError> + Send` is a program.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::channel::Channel;
use crate::sys;
use crate::thread::worker::{self, WorkerContext};
use crate::thread::{StatusCell, Thread};

/// A unit of worker code, in whatever form the host hands it over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceUnit {
    /// Script text to load directly.
    Text(String),
    /// Path of a script file to load.
    File(PathBuf),
    /// A host callable serialized to text by the host itself.
    Function(String),
}

/// Error raised by a worker body.
///
/// Engines format script failures (message plus traceback) into the
/// final text themselves; this type just carries it back to the owner's
/// [`Thread::status`](crate::thread::Thread::status).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ScriptError {
    message: String,
}

impl ScriptError {
    /// Creates a script error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The captured message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn into_message(self) -> String {
        self.message
    }
}

/// Compilation failure inside the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// The source does not parse or load (the `EINVAL` class).
    #[error("invalid source: {0}")]
    InvalidSource(String),
    /// The interpreter ran out of memory (the `ENOMEM` class).
    #[error("out of memory: {0}")]
    OutOfMemory(String),
}

/// A compiled worker body, ready to run once on its own thread.
pub trait ScriptProgram: Send + 'static {
    /// Runs the body to completion against the worker's self handle.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError`] when the script raises; the message ends
    /// up in the owning thread's status.
    fn run(self: Box<Self>, ctx: &mut WorkerContext) -> Result<(), ScriptError>;
}

impl<F> ScriptProgram for F
where
    F: FnOnce(&mut WorkerContext) -> Result<(), ScriptError> + Send + 'static,
{
    fn run(self: Box<Self>, ctx: &mut WorkerContext) -> Result<(), ScriptError> {
        (*self)(ctx)
    }
}

/// The embedded interpreter, seen from the spawn plumbing.
///
/// `compile` must create a *fresh, isolated* interpreter instance per
/// call, open its standard libraries, install a traceback hook, and
/// load the source unit into it. Nothing from the calling interpreter
/// may leak into the new instance; channels are bound separately by the
/// plumbing.
pub trait ScriptEngine: Send + Sync {
    /// Compiles `source` into a runnable worker body.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidSource`] for load/parse failures,
    /// [`CompileError::OutOfMemory`] when the fresh instance cannot be
    /// allocated.
    fn compile(&self, source: &SourceUnit) -> Result<Box<dyn ScriptProgram>, CompileError>;
}

static ENGINE: RwLock<Option<Arc<dyn ScriptEngine>>> = parking_lot::const_rwlock(None);

/// Registers the process-wide script engine used by the `spawn_from_*`
/// functions. Replaces any previous engine.
pub fn register_engine(engine: Arc<dyn ScriptEngine>) {
    *ENGINE.write() = Some(engine);
}

/// Removes the process-wide script engine.
pub fn unregister_engine() {
    *ENGINE.write() = None;
}

/// Returns the registered script engine, if any.
#[must_use]
pub fn registered_engine() -> Option<Arc<dyn ScriptEngine>> {
    ENGINE.read().clone()
}

/// Why a spawn attempt produced no thread.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The OS refused to create a thread right now; back off and retry.
    #[error("thread creation refused, try again")]
    Again,
    /// The engine rejected the source.
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// No engine is registered for the `spawn_from_*` entry points.
    #[error("no script engine registered")]
    NoEngine,
    /// A supplied channel was already closed.
    #[error("channel {index} is closed")]
    ChannelClosed {
        /// Position of the offending channel in the argument list.
        index: usize,
    },
    /// Pipe or thread resources could not be allocated.
    #[error("worker resources unavailable")]
    Resource(#[source] std::io::Error),
}

/// Worker thread configuration.
///
/// The defaults mirror `std::thread`: an unnamed-size stack and a
/// generic worker name.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl SpawnOptions {
    /// Creates the default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the worker thread (visible in debuggers and panics).
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the worker stack size in bytes.
    #[must_use]
    pub const fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }
}

/// Spawns a worker from script text through the registered engine.
///
/// # Errors
///
/// See [`SpawnError`]; notably [`SpawnError::Again`] asks the caller to
/// back off and retry.
pub fn spawn_from_source(text: impl Into<String>, channels: &[&Channel]) -> Result<Thread, SpawnError> {
    spawn_from_unit(&SourceUnit::Text(text.into()), channels)
}

/// Spawns a worker from a script file through the registered engine.
///
/// # Errors
///
/// See [`SpawnError`].
pub fn spawn_from_file(path: impl Into<PathBuf>, channels: &[&Channel]) -> Result<Thread, SpawnError> {
    spawn_from_unit(&SourceUnit::File(path.into()), channels)
}

/// Spawns a worker from a host-serialized callable through the
/// registered engine.
///
/// # Errors
///
/// See [`SpawnError`].
pub fn spawn_from_function(
    serialized: impl Into<String>,
    channels: &[&Channel],
) -> Result<Thread, SpawnError> {
    spawn_from_unit(&SourceUnit::Function(serialized.into()), channels)
}

fn spawn_from_unit(source: &SourceUnit, channels: &[&Channel]) -> Result<Thread, SpawnError> {
    let engine = registered_engine().ok_or(SpawnError::NoEngine)?;
    let program = engine.compile(source)?;
    spawn_boxed(&SpawnOptions::default(), program, channels)
}

/// Spawns a worker from an in-process program (typically a closure),
/// bypassing the engine.
///
/// # Errors
///
/// See [`SpawnError`].
pub fn spawn_program(
    program: impl ScriptProgram,
    channels: &[&Channel],
) -> Result<Thread, SpawnError> {
    spawn_boxed(&SpawnOptions::default(), Box::new(program), channels)
}

/// [`spawn_program`] with explicit worker options.
///
/// # Errors
///
/// See [`SpawnError`].
pub fn spawn_program_with(
    options: &SpawnOptions,
    program: impl ScriptProgram,
    channels: &[&Channel],
) -> Result<Thread, SpawnError> {
    spawn_boxed(options, Box::new(program), channels)
}

fn spawn_boxed(
    options: &SpawnOptions,
    program: Box<dyn ScriptProgram>,
    channels: &[&Channel],
) -> Result<Thread, SpawnError> {
    // Bind the channels first: each duplicate owns one queue reference
    // that travels into the worker.
    let mut bound = Vec::with_capacity(channels.len());
    for (index, channel) in channels.iter().enumerate() {
        bound.push(
            channel
                .duplicate()
                .map_err(|_| SpawnError::ChannelClosed { index })?,
        );
    }

    let (term_rd, term_wr) = sys::pipe_pair().map_err(SpawnError::Resource)?;
    let (cancel_rd, cancel_wr) = sys::pipe_pair().map_err(SpawnError::Resource)?;

    let status = Arc::new(StatusCell::new());
    let hard_cancel = Arc::new(AtomicBool::new(false));
    let ctx = WorkerContext::new(bound, cancel_rd);

    let mut builder =
        std::thread::Builder::new().name(options.name.clone().unwrap_or_else(|| "spindle-worker".into()));
    if let Some(bytes) = options.stack_size {
        builder = builder.stack_size(bytes);
    }

    let worker_status = Arc::clone(&status);
    let worker_hard = Arc::clone(&hard_cancel);
    let handle = builder
        .spawn(move || worker::run(program, ctx, worker_status, term_wr, worker_hard))
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EAGAIN)
            {
                SpawnError::Again
            } else {
                SpawnError::Resource(err)
            }
        })?;

    tracing::debug!(channels = channels.len(), "worker spawned");
    Ok(Thread::new(handle, term_rd, cancel_wr, hard_cancel, status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{JoinOutcome, ThreadStatus};
    use crate::value::Value;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    /// Serializes tests that touch the process-global engine slot.
    static ENGINE_TEST_LOCK: Mutex<()> = parking_lot::const_mutex(());

    /// A stand-in interpreter: "compiles" a few known source strings
    /// into closures.
    struct TableEngine;

    impl ScriptEngine for TableEngine {
        fn compile(&self, source: &SourceUnit) -> Result<Box<dyn ScriptProgram>, CompileError> {
            let text = match source {
                SourceUnit::Text(text) | SourceUnit::Function(text) => text.clone(),
                SourceUnit::File(path) => {
                    return Err(CompileError::InvalidSource(format!(
                        "no such file: {}",
                        path.display()
                    )))
                }
            };
            match text.as_str() {
                "push-hello" => Ok(Box::new(|ctx: &mut WorkerContext| {
                    let ch = ctx
                        .take_channel(0)
                        .ok_or_else(|| ScriptError::new("missing channel"))?;
                    ch.push(&Value::from("hello"), None)
                        .map_err(|e| ScriptError::new(e.to_string()))
                })),
                "return" => Ok(Box::new(|_ctx: &mut WorkerContext| Ok(()))),
                other => Err(CompileError::InvalidSource(format!(
                    "syntax error near '{other}'"
                ))),
            }
        }
    }

    #[test]
    fn spawn_from_source_without_engine_fails() {
        init_test("spawn_from_source_without_engine_fails");
        let _guard = ENGINE_TEST_LOCK.lock();
        unregister_engine();
        let err = spawn_from_source("return", &[]).expect_err("spawned without engine");
        assert!(matches!(err, SpawnError::NoEngine));
        crate::test_complete!("spawn_from_source_without_engine_fails");
    }

    #[test]
    fn compile_failure_reports_before_any_thread_starts() {
        init_test("compile_failure_reports_before_any_thread_starts");
        let _guard = ENGINE_TEST_LOCK.lock();
        register_engine(Arc::new(TableEngine));

        let err = spawn_from_source("nonsense %%", &[]).expect_err("compiled garbage");
        let SpawnError::Compile(CompileError::InvalidSource(message)) = err else {
            unreachable!("expected a compile error");
        };
        assert!(message.contains("syntax error"), "message: {message}");

        unregister_engine();
        crate::test_complete!("compile_failure_reports_before_any_thread_starts");
    }

    #[test]
    fn spawn_from_source_runs_through_the_engine() {
        init_test("spawn_from_source_runs_through_the_engine");
        let _guard = ENGINE_TEST_LOCK.lock();
        register_engine(Arc::new(TableEngine));

        let ch = Channel::new(Some(1)).expect("channel");
        let mut thread = spawn_from_source("push-hello", &[&ch]).expect("spawn");
        let value = ch.pop(Some(Duration::from_secs(5))).expect("pop");
        assert_eq!(value, Value::from("hello"));
        assert_eq!(
            thread.join(Some(Duration::from_secs(5))).expect("join"),
            JoinOutcome::Joined
        );
        assert_eq!(thread.status(), ThreadStatus::Terminated);

        unregister_engine();
        crate::test_complete!("spawn_from_source_runs_through_the_engine");
    }

    #[test]
    fn spawning_with_a_closed_channel_fails_fast() {
        init_test("spawning_with_a_closed_channel_fails_fast");
        let ch = Channel::new(Some(1)).expect("channel");
        ch.close();
        let err = spawn_program(|_ctx: &mut WorkerContext| Ok(()), &[&ch])
            .expect_err("spawned with closed channel");
        assert!(matches!(err, SpawnError::ChannelClosed { index: 0 }));
        crate::test_complete!("spawning_with_a_closed_channel_fails_fast");
    }

    #[test]
    fn spawn_binds_channels_in_argument_order() {
        init_test("spawn_binds_channels_in_argument_order");
        let first = Channel::new(Some(1)).expect("channel");
        let second = Channel::new(Some(1)).expect("channel");
        let mut thread = spawn_program(
            |ctx: &mut WorkerContext| {
                assert_eq!(ctx.channel_count(), 2);
                let a = ctx.take_channel(0).ok_or_else(|| ScriptError::new("no 0"))?;
                let b = ctx.take_channel(1).ok_or_else(|| ScriptError::new("no 1"))?;
                a.push(&Value::Integer(1), None)
                    .map_err(|e| ScriptError::new(e.to_string()))?;
                b.push(&Value::Integer(2), None)
                    .map_err(|e| ScriptError::new(e.to_string()))
            },
            &[&first, &second],
        )
        .expect("spawn");

        assert_eq!(
            first.pop(Some(Duration::from_secs(5))).expect("pop"),
            Value::Integer(1)
        );
        assert_eq!(
            second.pop(Some(Duration::from_secs(5))).expect("pop"),
            Value::Integer(2)
        );
        thread.join(Some(Duration::from_secs(5))).expect("join");
        crate::test_complete!("spawn_binds_channels_in_argument_order");
    }

    #[test]
    fn spawn_duplicates_queue_references() {
        init_test("spawn_duplicates_queue_references");
        let ch = Channel::new(Some(4)).expect("channel");
        assert_eq!(ch.nref().expect("nref"), 1);

        let gate = Channel::new(Some(1)).expect("channel");
        let mut thread = spawn_program(
            |ctx: &mut WorkerContext| {
                let gate = ctx.take_channel(1).ok_or_else(|| ScriptError::new("gate"))?;
                let _ = gate.pop(None);
                Ok(())
            },
            &[&ch, &gate],
        )
        .expect("spawn");

        // The worker holds its duplicate while parked on the gate.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ch.nref().expect("nref"), 2);

        gate.push(&Value::Bool(true), None).expect("release");
        thread.join(Some(Duration::from_secs(5))).expect("join");
        assert_eq!(ch.nref().expect("nref"), 1, "worker reference leaked");
        crate::test_complete!("spawn_duplicates_queue_references");
    }

    #[test]
    fn options_name_the_worker_thread() {
        init_test("options_name_the_worker_thread");
        let options = SpawnOptions::new().name("spindle-test-worker").stack_size(256 * 1024);
        let mut thread = spawn_program_with(
            &options,
            |_ctx: &mut WorkerContext| {
                let name = std::thread::current().name().map(str::to_owned);
                if name.as_deref() == Some("spindle-test-worker") {
                    Ok(())
                } else {
                    Err(ScriptError::new(format!("unexpected name: {name:?}")))
                }
            },
            &[],
        )
        .expect("spawn");
        thread.join(Some(Duration::from_secs(5))).expect("join");
        assert_eq!(thread.status(), ThreadStatus::Terminated);
        crate::test_complete!("options_name_the_worker_thread");
    }
}
