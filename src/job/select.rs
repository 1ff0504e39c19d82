//! Select hooks: racing a job's completion against other events.
//!
//! A [`SelectArbiter`] is the claim point shared by every clause in one
//! select: the first clause whose event fires claims the arbiter, and
//! only the claimed clause runs its continuation. Jobs expose two
//! registration points, [`crate::job::Job::on_join`] and
//! [`crate::job::Job::on_await`]; a job that is already terminal at
//! registration time claims synchronously, otherwise a completion-phase
//! listener claims at the terminal transition.
//!
//! [`select2`] is the packaged consumer: it races two jobs and resolves
//! to whichever side completed first.

use crate::job::node::ListenerHandle;
use crate::job::Job;
use crate::types::Outcome;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

const UNCLAIMED: usize = usize::MAX;

/// The claim token shared by the clauses of one select.
///
/// Exactly one clause ever claims; the claim records which clause won.
#[derive(Debug)]
pub struct SelectArbiter {
    winner: AtomicUsize,
    waker: Mutex<Option<Waker>>,
}

impl SelectArbiter {
    /// Creates an unclaimed arbiter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            winner: AtomicUsize::new(UNCLAIMED),
            waker: Mutex::new(None),
        }
    }

    /// Attempts to claim the select for the clause at `index`.
    /// Returns true iff this call won the claim.
    pub fn try_claim(&self, index: usize) -> bool {
        self.winner
            .compare_exchange(UNCLAIMED, index, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns the winning clause index once claimed.
    #[must_use]
    pub fn winner(&self) -> Option<usize> {
        match self.winner.load(Ordering::Acquire) {
            UNCLAIMED => None,
            index => Some(index),
        }
    }

    /// Returns true once some clause has claimed the select.
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.winner().is_some()
    }

    /// Stores the waker to notify when a clause claims.
    pub fn register_waker(&self, waker: &Waker) {
        let mut slot = self.waker.lock();
        match slot.as_mut() {
            Some(existing) => existing.clone_from(waker),
            None => *slot = Some(waker.clone()),
        }
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}

impl Default for SelectArbiter {
    fn default() -> Self {
        Self::new()
    }
}

/// One registered clause: fired by the job's terminal notification.
pub(crate) struct SelectClause {
    arbiter: Arc<SelectArbiter>,
    index: usize,
}

impl SelectClause {
    pub(crate) fn new(arbiter: Arc<SelectArbiter>, index: usize) -> Self {
        Self { arbiter, index }
    }

    /// Claims the arbiter for this clause; only the winner wakes the
    /// select.
    pub(crate) fn fire(self) {
        if self.arbiter.try_claim(self.index) {
            self.arbiter.wake();
        }
    }
}

/// How a clause registration resolved.
#[derive(Debug)]
pub enum ClauseRegistration {
    /// The job was terminal and this clause claimed the select; the
    /// continuation may run immediately on the caller.
    Ready,
    /// A completion listener is armed; dispose it if another clause wins.
    Registered(ListenerHandle),
    /// The select was already claimed by another clause.
    Lost,
}

impl ClauseRegistration {
    /// Disposes the armed listener, if any.
    pub fn dispose(&self) {
        if let Self::Registered(handle) = self {
            handle.dispose();
        }
    }
}

/// Result of racing two jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Either<A, B> {
    /// The first job completed first.
    Left(A),
    /// The second job completed first.
    Right(B),
}

impl<A, B> Either<A, B> {
    /// Returns true if this is the Left variant.
    pub const fn is_left(&self) -> bool {
        matches!(self, Self::Left(_))
    }

    /// Returns true if this is the Right variant.
    pub const fn is_right(&self) -> bool {
        matches!(self, Self::Right(_))
    }
}

/// Races two jobs' completion, resolving to the outcome of whichever
/// reached a terminal state first.
pub fn select2<'a, A, B>(a: &'a Job<A>, b: &'a Job<B>) -> Select2<'a, A, B>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
{
    Select2 {
        a,
        b,
        arbiter: Arc::new(SelectArbiter::new()),
        registrations: None,
    }
}

/// Future for [`select2`].
#[must_use = "futures do nothing unless polled"]
pub struct Select2<'a, A, B> {
    a: &'a Job<A>,
    b: &'a Job<B>,
    arbiter: Arc<SelectArbiter>,
    registrations: Option<(ClauseRegistration, ClauseRegistration)>,
}

impl<A, B> Future for Select2<'_, A, B>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
{
    type Output = Either<Outcome<A>, Outcome<B>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.arbiter.register_waker(cx.waker());
        if this.registrations.is_none() {
            let left = this.a.on_await(&this.arbiter, 0);
            let right = this.b.on_await(&this.arbiter, 1);
            this.registrations = Some((left, right));
        }
        match this.arbiter.winner() {
            Some(0) => {
                this.dispose_registrations();
                let outcome = this.a.completion().expect("claimed job must be terminal");
                Poll::Ready(Either::Left(outcome))
            }
            Some(_) => {
                this.dispose_registrations();
                let outcome = this.b.completion().expect("claimed job must be terminal");
                Poll::Ready(Either::Right(outcome))
            }
            None => Poll::Pending,
        }
    }
}

impl<A, B> Select2<'_, A, B> {
    fn dispose_registrations(&mut self) {
        if let Some((left, right)) = &self.registrations {
            left.dispose();
            right.dispose();
        }
    }
}

impl<A, B> Drop for Select2<'_, A, B> {
    fn drop(&mut self) {
        self.dispose_registrations();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_logging, poll_once};

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn claim_is_exclusive() {
        init_test("claim_is_exclusive");
        let arbiter = SelectArbiter::new();
        let first = arbiter.try_claim(0);
        let second = arbiter.try_claim(1);
        crate::assert_with_log!(first, "first claim wins", true, first);
        crate::assert_with_log!(!second, "second claim loses", false, second);
        crate::assert_with_log!(
            arbiter.winner() == Some(0),
            "winner index",
            Some(0usize),
            arbiter.winner()
        );
        crate::test_complete!("claim_is_exclusive");
    }

    #[test]
    fn select2_resolves_to_first_terminal() {
        init_test("select2_resolves_to_first_terminal");
        let a: Job<u32> = Job::new();
        let b: Job<u32> = Job::new();

        let mut race = select2(&a, &b);
        assert!(poll_once(&mut race).is_pending());

        assert!(b.complete(9));
        match poll_once(&mut race) {
            Poll::Ready(Either::Right(Outcome::Completed(v))) => {
                crate::assert_with_log!(v == 9, "right value", 9u32, v);
            }
            other => panic!("expected right completion, got {other:?}"),
        }
        crate::test_complete!("select2_resolves_to_first_terminal");
    }

    #[test]
    fn select2_claims_terminal_side_at_registration() {
        init_test("select2_claims_terminal_side_at_registration");
        let a: Job<u32> = Job::new();
        let b: Job<u32> = Job::new();
        assert!(a.complete(3));

        let mut race = select2(&a, &b);
        match poll_once(&mut race) {
            Poll::Ready(Either::Left(Outcome::Completed(v))) => {
                crate::assert_with_log!(v == 3, "left value", 3u32, v);
            }
            other => panic!("expected left completion, got {other:?}"),
        }
        crate::test_complete!("select2_claims_terminal_side_at_registration");
    }

    #[test]
    fn loser_registration_is_disposed() {
        init_test("loser_registration_is_disposed");
        let a: Job<u32> = Job::new();
        let b: Job<u32> = Job::new();
        {
            let mut race = select2(&a, &b);
            assert!(poll_once(&mut race).is_pending());
            assert!(a.complete(1));
            assert!(poll_once(&mut race).is_ready());
        }
        // The losing job keeps running and can still complete normally.
        assert!(b.complete(2));
        crate::test_complete!("loser_registration_is_disposed");
    }
}
