//! Jobsync: a cancellable, compose-able job primitive for structured concurrency.
//!
//! # Overview
//!
//! A [`Job`] is a lock-free lifecycle state machine representing a unit of
//! asynchronous work. Jobs form parent/child hierarchies: a parent does not
//! reach a terminal state while any attached child is still running, and
//! cancelling a parent propagates to every attached child. Completion
//! listeners, suspendable `join`/`outcome` waits, and select-style racing are
//! built on a single compact atomic state cell.
//!
//! # Core Guarantees
//!
//! - **Monotone lifecycle**: a terminal state is never replaced
//! - **Exactly-once listeners**: every installed listener fires exactly once with the terminal cause
//! - **Child quiescence**: a parent completes only after all attached children are terminal
//! - **Cause identity**: cancellation causes are preserved by reference through wrapping
//! - **Lock-free transitions**: all state changes are compare-and-swap on one atomic word
//!
//! # Module Structure
//!
//! - [`types`]: Core types (cancel reasons, terminal outcomes)
//! - [`job`]: The job state machine, listener chain, wait futures, select hooks
//! - [`error`]: Error types
//! - [`tracing_compat`]: Structured logging facade (no-op unless `tracing-integration`)
//! - [`test_utils`]: Shared test helpers

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]

pub mod error;
pub mod job;
pub mod test_utils;
pub mod tracing_compat;
pub mod types;

// Re-exports for convenient access to core types
pub use error::{Error, ErrorKind, Result};
pub use job::{
    select2, CancelMode, ChildJob, ClauseRegistration, DefaultHooks, Either, Job, JobConfig,
    JobHooks, JobPhase, Join, ListenerHandle, OutcomeFuture, Select2, SelectArbiter, StartMode,
};
pub use types::{CancelKind, CancelReason, Outcome, OutcomeError, OutcomeRef};
