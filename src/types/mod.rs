//! Core types for jobsync.
//!
//! This module defines the value types shared across the crate: structured
//! cancellation reasons and the terminal outcome lattice.

mod cancel;
mod outcome;

pub use cancel::{CancelKind, CancelReason};
pub use outcome::{Outcome, OutcomeError, OutcomeRef};
