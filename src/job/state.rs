//! Atomic lifecycle state cell.
//!
//! The whole observable lifecycle of a job is packed into one `AtomicU64`:
//! a phase tag plus two transient flags. Rich payloads (causes, values,
//! listeners) live outside the cell in write-once slots and the listener
//! chain; a payload slot is read only after the matching tag has been
//! published, so the cell alone decides every status projection.
//!
//! All transitions are plain compare-and-swap with caller-side retry. A
//! failed CAS always means another thread performed a transition, so the
//! transition matrix as a whole is lock-free.

use std::sync::atomic::{AtomicU64, Ordering};

const TAG_MASK: u64 = 0b111;
const TAG_NEW: u64 = 0;
const TAG_ACTIVE: u64 = 1;
const TAG_FINISHING: u64 = 2;
const TAG_CANCELLED: u64 = 3;
const TAG_FAILED: u64 = 4;
const TAG_COMPLETED: u64 = 5;

/// Cancellation has begun; the root cause slot is populated.
const FLAG_CANCELLING: u64 = 1 << 3;
/// A completion proposal is waiting for child quiescence.
const FLAG_COMPLETING: u64 = 1 << 4;

/// Attach epoch: the upper bits count child attaches. Attaching bumps the
/// epoch with a CAS on the same word the finalize path CASes to a
/// terminal tag, so a finalize decision taken against an older word fails
/// and re-checks the children. Low byte stays reserved for tag and flags.
const EPOCH_UNIT: u64 = 1 << 8;
const EPOCH_MASK: u64 = !0xFF;

/// Decoded view of one state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Snapshot {
    /// Created but not started.
    New,
    /// Started and running.
    Active,
    /// Transient run-down phase: cancelling, completing, or both.
    Finishing {
        /// Cancellation has begun (root cause is set).
        cancelling: bool,
        /// A completion proposal is waiting for children.
        completing: bool,
    },
    /// Terminal: cancelled with a cause.
    Cancelled,
    /// Terminal: failed with a non-cancellation cause.
    Failed,
    /// Terminal: completed normally with a value.
    Completed,
}

impl Snapshot {
    pub(crate) fn from_word(word: u64) -> Self {
        match word & TAG_MASK {
            TAG_NEW => Self::New,
            TAG_ACTIVE => Self::Active,
            TAG_FINISHING => Self::Finishing {
                cancelling: word & FLAG_CANCELLING != 0,
                completing: word & FLAG_COMPLETING != 0,
            },
            TAG_CANCELLED => Self::Cancelled,
            TAG_FAILED => Self::Failed,
            TAG_COMPLETED => Self::Completed,
            tag => {
                debug_assert!(false, "invalid state tag: {tag}");
                Self::Completed
            }
        }
    }

    pub(crate) fn to_word(self) -> u64 {
        match self {
            Self::New => TAG_NEW,
            Self::Active => TAG_ACTIVE,
            Self::Finishing {
                cancelling,
                completing,
            } => {
                let mut word = TAG_FINISHING;
                if cancelling {
                    word |= FLAG_CANCELLING;
                }
                if completing {
                    word |= FLAG_COMPLETING;
                }
                word
            }
            Self::Cancelled => TAG_CANCELLED,
            Self::Failed => TAG_FAILED,
            Self::Completed => TAG_COMPLETED,
        }
    }

    /// Terminal states are never replaced.
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed | Self::Completed)
    }

    /// Cancellation has begun or finished.
    pub(crate) fn is_cancelling(self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Finishing { cancelling: true, .. }
        )
    }

    /// Started, not terminal, and not being cancelled.
    pub(crate) fn is_active(self) -> bool {
        matches!(
            self,
            Self::Active
                | Self::Finishing {
                    cancelling: false,
                    ..
                }
        )
    }
}

/// The single atomic slot holding the current lifecycle word.
#[derive(Debug)]
pub(crate) struct StateCell {
    word: AtomicU64,
}

impl StateCell {
    pub(crate) fn new(initial: Snapshot) -> Self {
        Self {
            word: AtomicU64::new(initial.to_word()),
        }
    }

    /// Loads the raw word; pair with [`Snapshot::from_word`] for CAS loops.
    pub(crate) fn load_word(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    /// Loads a decoded snapshot.
    pub(crate) fn load(&self) -> Snapshot {
        Snapshot::from_word(self.load_word())
    }

    /// Atomically transitions from the exact observed word to `to`. The
    /// attach epoch is carried over for non-terminal targets; a terminal
    /// word is final and keeps none.
    pub(crate) fn transition(&self, from: u64, to: Snapshot) -> bool {
        let mut target = to.to_word();
        if !to.is_terminal() {
            target |= from & EPOCH_MASK;
        }
        self.word
            .compare_exchange(from, target, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Bumps the attach epoch from the exact observed word, leaving tag
    /// and flags untouched. Succeeds iff no transition or other bump
    /// intervened since `from` was read.
    pub(crate) fn bump_epoch(&self, from: u64) -> bool {
        self.word
            .compare_exchange(
                from,
                from.wrapping_add(EPOCH_UNIT),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projections_follow_the_matrix() {
        assert!(!Snapshot::New.is_active());
        assert!(Snapshot::Active.is_active());
        assert!(Snapshot::Finishing {
            cancelling: false,
            completing: true
        }
        .is_active());
        assert!(!Snapshot::Finishing {
            cancelling: true,
            completing: true
        }
        .is_active());
        assert!(Snapshot::Finishing {
            cancelling: true,
            completing: false
        }
        .is_cancelling());
        assert!(Snapshot::Cancelled.is_cancelling());
        assert!(!Snapshot::Failed.is_cancelling());
        assert!(Snapshot::Failed.is_terminal());
    }

    #[test]
    fn transition_requires_exact_word() {
        let cell = StateCell::new(Snapshot::New);
        let stale = Snapshot::Active.to_word();
        assert!(!cell.transition(stale, Snapshot::Cancelled));
        assert!(cell.transition(Snapshot::New.to_word(), Snapshot::Active));
        assert_eq!(cell.load(), Snapshot::Active);
    }

    #[test]
    fn epoch_survives_bumps_and_transitions() {
        let cell = StateCell::new(Snapshot::Active);
        let before = cell.load_word();
        assert!(cell.bump_epoch(before));
        let bumped = cell.load_word();
        assert_ne!(before, bumped);
        assert_eq!(cell.load(), Snapshot::Active);

        // A stale bump or transition fails once the word moved.
        assert!(!cell.bump_epoch(before));
        assert!(!cell.transition(before, Snapshot::Completed));

        // Non-terminal transitions carry the epoch along.
        let target = Snapshot::Finishing {
            cancelling: false,
            completing: true,
        };
        assert!(cell.transition(bumped, target));
        assert_eq!(cell.load_word() & EPOCH_MASK, bumped & EPOCH_MASK);
        assert_eq!(cell.load(), target);
    }

    #[test]
    fn terminal_word_is_flag_free() {
        let word = Snapshot::Finishing {
            cancelling: true,
            completing: true,
        }
        .to_word();
        assert_eq!(Snapshot::from_word(word), Snapshot::Finishing {
            cancelling: true,
            completing: true
        });
        assert_eq!(Snapshot::Cancelled.to_word() & !TAG_MASK, 0);
    }
}
