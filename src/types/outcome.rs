//! Three-valued terminal outcome with severity lattice.
//!
//! The outcome type represents how a job finished:
//!
//! - `Completed(T)`: normal completion with a value
//! - `Failed(cause)`: the body failed with a non-cancellation error
//! - `Cancelled(cause)`: the job was cancelled
//!
//! These form a severity lattice: `Completed < Failed < Cancelled`.
//! Causes travel as `Arc<Error>` so that identity survives aggregation.

use crate::error::Error;
use core::fmt;
use std::sync::Arc;

/// The terminal outcome of a job.
///
/// Forms a severity lattice where worse outcomes dominate:
/// `Completed < Failed < Cancelled`
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// Normal completion with a value.
    Completed(T),
    /// The body failed with a non-cancellation error.
    Failed(Arc<Error>),
    /// The job was cancelled.
    Cancelled(Arc<Error>),
}

impl<T> Outcome<T> {
    /// Returns the severity level of this outcome (0 = Completed, 2 = Cancelled).
    #[must_use]
    pub const fn severity(&self) -> u8 {
        match self {
            Self::Completed(_) => 0,
            Self::Failed(_) => 1,
            Self::Cancelled(_) => 2,
        }
    }

    /// Returns true if this outcome is `Completed`.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Returns true if this outcome is `Failed`.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Returns true if this outcome is `Cancelled`.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns the failure or cancellation cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&Arc<Error>> {
        match self {
            Self::Completed(_) => None,
            Self::Failed(cause) | Self::Cancelled(cause) => Some(cause),
        }
    }

    /// Maps the completion value using the provided function.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Self::Completed(v) => Outcome::Completed(f(v)),
            Self::Failed(cause) => Outcome::Failed(cause),
            Self::Cancelled(cause) => Outcome::Cancelled(cause),
        }
    }

    /// Converts this outcome to a standard Result, with failure and
    /// cancellation as errors.
    pub fn into_result(self) -> Result<T, OutcomeError> {
        match self {
            Self::Completed(v) => Ok(v),
            Self::Failed(cause) => Err(OutcomeError::Failed(cause)),
            Self::Cancelled(cause) => Err(OutcomeError::Cancelled(cause)),
        }
    }

    /// Returns the completion value or panics.
    ///
    /// # Panics
    ///
    /// Panics if the outcome is not `Completed`.
    #[track_caller]
    pub fn unwrap(self) -> T {
        match self {
            Self::Completed(v) => v,
            Self::Failed(cause) => {
                panic!("called `Outcome::unwrap()` on a `Failed` value: {cause}")
            }
            Self::Cancelled(cause) => {
                panic!("called `Outcome::unwrap()` on a `Cancelled` value: {cause}")
            }
        }
    }
}

/// Borrowed view of a terminal outcome, handed to completion hooks
/// without requiring the payload to be cloneable.
#[derive(Debug)]
pub enum OutcomeRef<'a, T> {
    /// Normal completion with a value.
    Completed(&'a T),
    /// The body failed with a non-cancellation error.
    Failed(&'a Arc<Error>),
    /// The job was cancelled.
    Cancelled(&'a Arc<Error>),
}

impl<'a, T> OutcomeRef<'a, T> {
    /// Returns the failure or cancellation cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&'a Arc<Error>> {
        match self {
            Self::Completed(_) => None,
            Self::Failed(cause) | Self::Cancelled(cause) => Some(cause),
        }
    }

    /// Returns true if this view is `Completed`.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Clones into an owned [`Outcome`].
    #[must_use]
    pub fn to_outcome(&self) -> Outcome<T>
    where
        T: Clone,
    {
        match self {
            Self::Completed(v) => Outcome::Completed((*v).clone()),
            Self::Failed(cause) => Outcome::Failed(Arc::clone(cause)),
            Self::Cancelled(cause) => Outcome::Cancelled(Arc::clone(cause)),
        }
    }
}

/// Error type for converting an [`Outcome`] to a Result.
#[derive(Debug, Clone)]
pub enum OutcomeError {
    /// The job failed; carries the original cause by identity.
    Failed(Arc<Error>),
    /// The job was cancelled; carries the original cause by identity.
    Cancelled(Arc<Error>),
}

impl OutcomeError {
    /// Returns the underlying cause by identity.
    #[must_use]
    pub fn cause(&self) -> &Arc<Error> {
        match self {
            Self::Failed(cause) | Self::Cancelled(cause) => cause,
        }
    }
}

impl fmt::Display for OutcomeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(cause) => write!(f, "job failed: {cause}"),
            Self::Cancelled(cause) => write!(f, "job cancelled: {cause}"),
        }
    }
}

impl std::error::Error for OutcomeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause().as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_lattice() {
        let completed: Outcome<i32> = Outcome::Completed(1);
        let failed: Outcome<i32> = Outcome::Failed(Arc::new(Error::failure("boom")));
        let cancelled: Outcome<i32> =
            Outcome::Cancelled(Arc::new(Error::cancelled(&crate::types::CancelReason::timeout())));
        assert!(completed.severity() < failed.severity());
        assert!(failed.severity() < cancelled.severity());
    }

    #[test]
    fn map_preserves_cause_identity() {
        let cause = Arc::new(Error::failure("boom"));
        let outcome: Outcome<i32> = Outcome::Failed(Arc::clone(&cause));
        let mapped = outcome.map(|v| v + 1);
        match mapped {
            Outcome::Failed(c) => assert!(Arc::ptr_eq(&c, &cause)),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn into_result_round_trips_value() {
        let outcome: Outcome<&str> = Outcome::Completed("done");
        assert_eq!(outcome.into_result().expect("completed"), "done");
    }

    #[test]
    fn outcome_error_exposes_source() {
        use std::error::Error as _;
        let cause = Arc::new(Error::failure("boom"));
        let err = OutcomeError::Cancelled(Arc::clone(&cause));
        assert!(err.source().is_some());
        assert!(Arc::ptr_eq(err.cause(), &cause));
    }
}
