//! Error types and error handling strategy for Spindle.
//!
//! This module defines the core error type used throughout the runtime.
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Recoverable conditions (`Full`, `Empty`, `TimedOut`, `Again`) are
//!   ordinary values the caller inspects and retries on
//! - Worker script failures are never promoted to host panics; they are
//!   captured in the thread status and surfaced through
//!   [`Thread::status`](crate::thread::Thread::status)

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Caller mistakes ===
    /// Unsupported argument: bad timeout, missing engine, invalid source.
    InvalidArgument,
    /// Operation on a closed channel.
    Closed,

    // === Resources ===
    /// Allocation failure, out of file descriptors, pipe creation failed.
    Resource,

    // === Queue conditions ===
    /// Queue is full (would block).
    Full,
    /// Queue is empty (would block).
    Empty,
    /// A bounded wait expired before the condition was met.
    TimedOut,

    // === Threads ===
    /// The OS refused to create a thread right now; retry later.
    Again,
    /// The worker script raised an error (message captured in status).
    ScriptFailure,
    /// The operation was interrupted by thread cancellation.
    Cancelled,

    // === Internal / state machine ===
    /// Internal invariant violation (bug); not recoverable.
    Internal,
}

impl ErrorKind {
    /// Returns true if the condition is transient and the caller may
    /// simply retry (possibly after waiting on the matching fd).
    #[must_use]
    pub const fn is_again(self) -> bool {
        matches!(self, Self::Full | Self::Empty | Self::TimedOut | Self::Again)
    }
}

/// The main error type for Spindle operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error represents a transient "try again"
    /// condition rather than a failure.
    #[must_use]
    pub const fn is_again(&self) -> bool {
        self.kind.is_again()
    }

    /// Returns true if a bounded wait expired.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::TimedOut)
    }

    /// Returns true if this error was caused by thread cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Maps an OS-level I/O error onto the taxonomy.
    ///
    /// `EAGAIN`-class errors become [`ErrorKind::Again`]; everything else
    /// is a [`ErrorKind::Resource`] failure carrying the original error.
    #[must_use]
    pub fn from_io(err: std::io::Error) -> Self {
        let kind = if err.kind() == std::io::ErrorKind::WouldBlock
            || err.raw_os_error() == Some(libc::EAGAIN)
        {
            ErrorKind::Again
        } else {
            ErrorKind::Resource
        };
        Self::new(kind).with_source(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err)
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// A specialized Result type for Spindle operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_context() {
        let err = Error::new(ErrorKind::Internal);
        assert_eq!(err.to_string(), "Internal");
    }

    #[test]
    fn display_with_context() {
        let err = Error::new(ErrorKind::Empty).with_context("no messages");
        assert_eq!(err.to_string(), "Empty: no messages");
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::new(ErrorKind::Resource)
            .with_context("outer")
            .with_source(Underlying);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn again_predicate_covers_transient_kinds() {
        for kind in [
            ErrorKind::Full,
            ErrorKind::Empty,
            ErrorKind::TimedOut,
            ErrorKind::Again,
        ] {
            assert!(Error::new(kind).is_again(), "{kind:?} should be transient");
        }
        for kind in [
            ErrorKind::InvalidArgument,
            ErrorKind::Closed,
            ErrorKind::Resource,
            ErrorKind::ScriptFailure,
            ErrorKind::Cancelled,
            ErrorKind::Internal,
        ] {
            assert!(!Error::new(kind).is_again(), "{kind:?} should be terminal");
        }
    }

    #[test]
    fn from_io_maps_eagain_to_again() {
        let err = Error::from_io(std::io::Error::from_raw_os_error(libc::EAGAIN));
        assert_eq!(err.kind(), ErrorKind::Again);

        let err = Error::from_io(std::io::Error::from_raw_os_error(libc::ENOMEM));
        assert_eq!(err.kind(), ErrorKind::Resource);
    }

    #[test]
    fn predicates_match_kind() {
        let cancel = Error::new(ErrorKind::Cancelled);
        assert!(cancel.is_cancelled());
        assert!(!cancel.is_timeout());

        let timeout = Error::new(ErrorKind::TimedOut);
        assert!(!timeout.is_cancelled());
        assert!(timeout.is_timeout());
    }

    #[test]
    fn result_ext_adds_context() {
        let res: core::result::Result<(), std::io::Error> =
            Err(std::io::Error::from_raw_os_error(libc::ENOMEM));
        let err = res.context("pipe setup failed").expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert_eq!(err.to_string(), "Resource: pipe setup failed");
    }
}
