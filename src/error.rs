//! Error types and error handling strategy for jobsync.
//!
//! This module defines the core error types used throughout the crate.
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Cancellation is an expected failure, not a panic
//! - Cause identity is preserved: a cause travels as `Arc<Error>` and a
//!   wrapper keeps the wrapped cause reference-equal via its source chain

use core::fmt;
use std::sync::Arc;

use crate::types::CancelReason;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Cancellation ===
    /// The job was cancelled.
    Cancelled,
    /// Wrapper kind for "the job has failed" produced when querying the
    /// cancellation cause of a job that completed exceptionally.
    JobFailed,
    /// Wrapper kind for "the job has completed normally".
    JobCompleted,

    // === Notification ===
    /// A completion handler panicked during notification.
    CompletionHandlerFailed,
    /// The body proposed a different failure while cancellation was already
    /// in progress; the cancellation cause wins and the proposal is reported
    /// out of band.
    UnexpectedCompletion,

    // === User ===
    /// User-provided failure completing a job exceptionally.
    User,

    // === Programmer errors ===
    /// Invalid use of the API (cause query on an incomplete job, double
    /// parent initialization).
    IllegalState,
}

/// The main error type for jobsync operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<Error>>,
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

    /// Returns true if this error is cancellation-typed.
    ///
    /// Cancellation-typed errors are returned as-is by cause queries; any
    /// other error is wrapped first.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Cancelled | ErrorKind::JobFailed | ErrorKind::JobCompleted
        )
    }

    /// Adds deterministic context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a wrapped cause to the chain, preserving its identity.
    #[must_use]
    pub fn with_cause(mut self, cause: Arc<Self>) -> Self {
        self.source = Some(cause);
        self
    }

    /// Returns the wrapped cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&Arc<Self>> {
        self.source.as_ref()
    }

    /// Creates a cancellation error from a structured reason.
    #[must_use]
    pub fn cancelled(reason: &CancelReason) -> Self {
        Self::new(ErrorKind::Cancelled).with_context(format!("{reason}"))
    }

    /// Creates a user-provided failure for completing a job exceptionally.
    #[must_use]
    pub fn failure(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::User).with_context(ctx)
    }

    /// Creates an illegal-state error.
    #[must_use]
    pub fn illegal_state(ctx: impl Into<String>) -> Self {
        Self::new(ErrorKind::IllegalState).with_context(ctx)
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

/// Returns true if two causes are the same by identity.
///
/// Two causes are "the same" if they are reference-equal, or if one is a
/// wrapped form whose inner cause is reference-equal to the other.
#[must_use]
pub fn same_cause(a: &Arc<Error>, b: &Arc<Error>) -> bool {
    if Arc::ptr_eq(a, b) {
        return true;
    }
    if let Some(inner) = a.cause() {
        if Arc::ptr_eq(inner, b) {
            return true;
        }
    }
    if let Some(inner) = b.cause() {
        if Arc::ptr_eq(inner, a) {
            return true;
        }
    }
    false
}

/// A specialized Result type for jobsync operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn display_without_context() {
        let err = Error::new(ErrorKind::IllegalState);
        assert_eq!(err.to_string(), "IllegalState");
    }

    #[test]
    fn display_with_context() {
        let err = Error::new(ErrorKind::Cancelled).with_context("shutting down");
        assert_eq!(err.to_string(), "Cancelled: shutting down");
    }

    #[test]
    fn cancelled_from_reason() {
        let err = Error::cancelled(&CancelReason::user("stop"));
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(err.is_cancellation());
        assert!(err.to_string().contains("stop"));
    }

    #[test]
    fn source_chain_is_exposed() {
        let inner = Arc::new(Error::failure("boom"));
        let err = Error::new(ErrorKind::Cancelled).with_cause(Arc::clone(&inner));
        let source = err.source().expect("source missing");
        assert!(source.to_string().contains("boom"));
    }

    #[test]
    fn same_cause_by_identity() {
        let a = Arc::new(Error::failure("boom"));
        let b = Arc::new(Error::failure("boom"));
        assert!(same_cause(&a, &Arc::clone(&a)));
        assert!(!same_cause(&a, &b));
    }

    #[test]
    fn same_cause_through_wrapper() {
        let inner = Arc::new(Error::failure("boom"));
        let wrapper = Arc::new(Error::new(ErrorKind::Cancelled).with_cause(Arc::clone(&inner)));
        assert!(same_cause(&wrapper, &inner));
        assert!(same_cause(&inner, &wrapper));
    }

    #[test]
    fn wrapper_kinds_are_cancellation_typed() {
        assert!(Error::new(ErrorKind::JobFailed).is_cancellation());
        assert!(Error::new(ErrorKind::JobCompleted).is_cancellation());
        assert!(!Error::new(ErrorKind::IllegalState).is_cancellation());
    }
}
