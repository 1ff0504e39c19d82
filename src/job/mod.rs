//! The job state machine: lifecycle, listeners, hierarchy, waits.
//!
//! A [`Job`] is a handle to a shared lifecycle state machine. Handles are
//! cheap to clone; all clones observe the same state. The lifecycle is
//! strictly monotone:
//!
//! ```text
//! New ──start──▶ Active ──complete/fail──▶ Completing ──▶ Completed | Failed
//!   │               │                          │
//!   │               └──────cancel──────▶ Cancelling ──▶ Cancelled
//!   └──────────────cancel──────────────────────────────▶ Cancelled
//! ```
//!
//! `Completing` and `Cancelling` are the run-down phases: the job has an
//! outcome but waits for every attached child to reach a terminal state
//! before publishing it. Cancelling a parent propagates to children;
//! a child failure never blocks its siblings' notification.
//!
//! # Example
//!
//! ```ignore
//! let parent: Job<u32> = Job::new();
//! let child: Job<()> = Job::new();
//! child.init_parent(&parent)?;
//!
//! parent.on_completion(|cause| println!("done: {cause:?}"));
//! child.complete(());
//! parent.complete(42);   // waits for children, then publishes 42
//! ```

pub(crate) mod core;
pub(crate) mod node;
pub(crate) mod select;
pub(crate) mod state;
pub(crate) mod wait;

use crate::error::{Error, Result};
use crate::tracing_compat::error;
use crate::types::{CancelReason, Outcome, OutcomeRef};
use std::fmt;
use std::sync::Arc;

use self::core::{Installed, JobInner, ProposedUpdate};
use self::node::{ListenerNode, NotifyPhase};
use self::select::SelectClause;
use self::state::Snapshot;

pub use self::core::ChildJob;
pub use self::node::ListenerHandle;
pub use self::select::{select2, ClauseRegistration, Either, Select2, SelectArbiter};
pub use self::wait::{Join, OutcomeFuture};

/// Whether a job starts running at creation or on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartMode {
    /// Active immediately.
    #[default]
    Eager,
    /// Created in the New state; started by `start`, `join`, or `outcome`.
    Lazy,
}

/// Whether cancellation runs a drain phase or completes on the spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelMode {
    /// Enter the Cancelling phase and wind children down before the
    /// terminal transition.
    #[default]
    Draining,
    /// No run-down phase: cancel transitions straight to Cancelled. For
    /// bare jobs with no body to wind down.
    Immediate,
}

/// Construction-time configuration for a [`Job`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JobConfig {
    start: StartMode,
    cancel: CancelMode,
    name: Option<&'static str>,
}

impl JobConfig {
    /// Creates the default configuration: eager start, draining cancel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the start mode.
    #[must_use]
    pub fn with_start(mut self, start: StartMode) -> Self {
        self.start = start;
        self
    }

    /// Sets the cancel mode.
    #[must_use]
    pub fn with_cancel_mode(mut self, cancel: CancelMode) -> Self {
        self.cancel = cancel;
        self
    }

    /// Names the job for diagnostics.
    #[must_use]
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }
}

/// Coarse lifecycle phase snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    /// Created but not started.
    New,
    /// Started and running.
    Active,
    /// A completion proposal is waiting for children.
    Completing,
    /// Cancellation is winding the job down.
    Cancelling,
    /// Terminal: cancelled.
    Cancelled,
    /// Terminal: failed.
    Failed,
    /// Terminal: completed normally.
    Completed,
}

impl JobPhase {
    fn from_snapshot(snap: Snapshot) -> Self {
        match snap {
            Snapshot::New => Self::New,
            Snapshot::Active => Self::Active,
            Snapshot::Finishing {
                cancelling: true, ..
            } => Self::Cancelling,
            Snapshot::Finishing { .. } => Self::Completing,
            Snapshot::Cancelled => Self::Cancelled,
            Snapshot::Failed => Self::Failed,
            Snapshot::Completed => Self::Completed,
        }
    }
}

/// Extension hooks for carriers embedding a job (deferred values,
/// supervisors). All methods have no-op defaults.
pub trait JobHooks<T>: Send + Sync {
    /// Invoked exactly once when the job leaves the New state.
    fn on_start(&self) {}

    /// Invoked when cancellation begins (with the root cause), or at a
    /// terminal transition that never went through the cancelling phase
    /// (with the failure, if any).
    fn on_cancelling(&self, cause: Option<&Arc<Error>>) {
        let _ = cause;
    }

    /// Invoked after the terminal state is published and all listeners
    /// have been notified.
    fn after_completion(&self, outcome: OutcomeRef<'_, T>) {
        let _ = outcome;
    }

    /// Receives faults that cannot be returned to any caller: completion
    /// handler panics and completions proposed during cancellation.
    fn handle_exception(&self, fault: &Error) {
        error!(fault = %fault, "unhandled job fault");
        let _ = fault;
    }

    /// Diagnostic name for logs and `Debug` output.
    fn name(&self) -> &str {
        "job"
    }
}

/// Default hook implementation: logs faults, carries a name.
#[derive(Debug, Clone, Copy)]
pub struct DefaultHooks {
    name: &'static str,
}

impl DefaultHooks {
    /// Hooks carrying the given diagnostic name.
    #[must_use]
    pub fn named(name: &'static str) -> Self {
        Self { name }
    }

    pub(crate) fn unnamed() -> Self {
        Self { name: "job" }
    }
}

impl<T> JobHooks<T> for DefaultHooks {
    fn name(&self) -> &str {
        self.name
    }
}

/// A cancellable, compose-able unit of asynchronous work.
///
/// See the [module docs](self) for the lifecycle. `Job` is a shared
/// handle: clones observe and drive the same state machine.
pub struct Job<T = ()> {
    inner: Arc<JobInner<T>>,
}

impl<T> Clone for Job<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Default for Job<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Job<T> {
    /// Creates an eager job with a draining cancel phase.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(JobConfig::new())
    }

    /// Creates a lazily started job; `start`, `join`, or `outcome`
    /// activates it.
    #[must_use]
    pub fn lazy() -> Self {
        Self::with_config(JobConfig::new().with_start(StartMode::Lazy))
    }

    /// Creates a job that cancels straight to the terminal state, with no
    /// run-down phase.
    #[must_use]
    pub fn immediate_cancel() -> Self {
        Self::with_config(JobConfig::new().with_cancel_mode(CancelMode::Immediate))
    }

    /// Creates a job from an explicit configuration.
    #[must_use]
    pub fn with_config(config: JobConfig) -> Self {
        let hooks = match config.name {
            Some(name) => DefaultHooks::named(name),
            None => DefaultHooks::unnamed(),
        };
        Self::with_hooks(config, hooks)
    }

    /// Creates a job with custom extension hooks.
    #[must_use]
    pub fn with_hooks(config: JobConfig, hooks: impl JobHooks<T> + 'static) -> Self {
        Self {
            inner: JobInner::new(
                config.start == StartMode::Eager,
                config.cancel,
                Box::new(hooks),
            ),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Starts a lazily created job.
    ///
    /// Returns true iff this call moved the job from New to Active; the
    /// `on_start` hook fires exactly once across all callers.
    pub fn start(&self) -> bool {
        self.inner.start()
    }

    /// Cancels the job with a generated cause.
    ///
    /// Returns true iff this call effected the transition into a
    /// cancelling or cancelled state.
    pub fn cancel(&self) -> bool {
        self.cancel_with(Arc::new(Error::cancelled(&CancelReason::user(
            "job was cancelled",
        ))))
    }

    /// Cancels the job with an explicit cause. The first cause wins and
    /// is preserved by identity through the terminal state.
    pub fn cancel_with(&self, cause: Arc<Error>) -> bool {
        self.inner.do_cancel(cause)
    }

    /// Cancels every attached child with a generated cause, without
    /// changing this job's own state.
    pub fn cancel_children(&self) {
        self.cancel_children_with(Arc::new(Error::cancelled(&CancelReason::parent_cancelled())));
    }

    /// Cancels every attached child with the given cause, without
    /// changing this job's own state.
    pub fn cancel_children_with(&self, cause: Arc<Error>) {
        self.inner.cancel_children(&cause);
    }

    /// Completes the job with a value.
    ///
    /// Returns true iff this call initiated completion. The terminal
    /// transition waits until all attached children are terminal.
    pub fn complete(&self, value: T) -> bool {
        self.inner.make_completing(ProposedUpdate::Value(value))
    }

    /// Completes the job exceptionally.
    ///
    /// Attached children are wound down with the failure as their
    /// cancellation cause; the job itself reaches the Failed state once
    /// they are terminal.
    pub fn fail(&self, error: Error) -> bool {
        self.fail_with(Arc::new(error))
    }

    /// Completes the job exceptionally with a shared cause.
    pub fn fail_with(&self, cause: Arc<Error>) -> bool {
        self.inner.make_completing(ProposedUpdate::Failure(cause))
    }

    // ── Hierarchy ────────────────────────────────────────────────────────

    /// Attaches `child`: this job will not complete before the child is
    /// terminal, and cancellation propagates to it.
    ///
    /// The returned handle belongs to the child side of the link; prefer
    /// [`Job::init_parent`], which wires both sides.
    pub fn attach_child<U: Send + Sync + 'static>(&self, child: &Job<U>) -> ListenerHandle {
        self.inner.attach_child(Arc::new(child.clone()))
    }

    /// Makes this job a child of `parent`: the parent waits for this job
    /// and cancels it when the parent is cancelled; the link is disposed
    /// automatically when this job reaches a terminal state.
    ///
    /// # Errors
    ///
    /// Returns an illegal-state error if a parent was already initialized.
    pub fn init_parent<U: Send + Sync + 'static>(&self, parent: &Job<U>) -> Result<()> {
        let handle = parent.attach_child(self);
        self.inner.init_parent(handle)
    }

    /// Number of attached children that have not yet detached.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.inner.child_count()
    }

    // ── Listeners ────────────────────────────────────────────────────────

    /// Installs a completion-phase listener: fires exactly once at the
    /// terminal transition with the terminal cause (`None` for normal
    /// completion). If the job is already terminal the listener fires
    /// inline and the returned handle is a no-op.
    pub fn on_completion(
        &self,
        f: impl FnOnce(Option<Arc<Error>>) + Send + 'static,
    ) -> ListenerHandle {
        self.inner
            .install_handler(NotifyPhase::OnCompletion, Box::new(f))
    }

    /// Installs a cancellation-phase listener: fires when the job enters
    /// the cancelling phase, or at the terminal transition if cancellation
    /// never happened. Fires inline when the job is already cancelling.
    pub fn on_cancelling(
        &self,
        f: impl FnOnce(Option<Arc<Error>>) + Send + 'static,
    ) -> ListenerHandle {
        self.inner
            .install_handler(NotifyPhase::OnCancelling, Box::new(f))
    }

    // ── Waiting ──────────────────────────────────────────────────────────

    /// Waits for the job to reach a terminal state, starting it if it was
    /// created lazily. `join` never reports the job's outcome; dropping
    /// the future abandons only the wait.
    #[must_use]
    pub fn join(&self) -> Join<'_, T> {
        Join::new(&self.inner)
    }

    // ── Select hooks ─────────────────────────────────────────────────────

    /// Registers this job's completion as clause `index` of a select.
    /// When the job is already terminal, the clause claims immediately.
    pub fn on_join(&self, arbiter: &Arc<SelectArbiter>, index: usize) -> ClauseRegistration {
        self.register_select(arbiter, index)
    }

    fn register_select(&self, arbiter: &Arc<SelectArbiter>, index: usize) -> ClauseRegistration {
        if self.inner.snapshot().is_terminal() {
            return if arbiter.try_claim(index) {
                ClauseRegistration::Ready
            } else {
                ClauseRegistration::Lost
            };
        }
        let node = ListenerNode::select(SelectClause::new(Arc::clone(arbiter), index));
        match self.inner.install(node) {
            Installed::Immediate => {
                if arbiter.winner() == Some(index) {
                    ClauseRegistration::Ready
                } else {
                    ClauseRegistration::Lost
                }
            }
            Installed::Node(node) => ClauseRegistration::Registered(ListenerHandle::for_node(node)),
        }
    }

    // ── Status ───────────────────────────────────────────────────────────

    /// True while the job has started, is not terminal, and is not being
    /// cancelled. A job completing normally is still active while it
    /// waits for children.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.snapshot().is_active()
    }

    /// True once the job reached a terminal state.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.snapshot().is_terminal()
    }

    /// True once cancellation has begun, including the terminal Cancelled
    /// state.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.snapshot().is_cancelling()
    }

    /// Coarse lifecycle phase snapshot.
    #[must_use]
    pub fn phase(&self) -> JobPhase {
        JobPhase::from_snapshot(self.inner.snapshot())
    }

    /// Diagnostic name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Returns the cancellation exception reflecting the terminal (or
    /// in-progress cancelling) cause:
    ///
    /// - cancelled with a cancellation-typed cause: that cause, by identity
    /// - cancelled with any other cause: a wrapper whose inner cause is
    ///   preserved by identity
    /// - failed: a "job has failed" wrapper around the failure
    /// - completed normally: a fresh "job has completed normally" error
    ///
    /// # Errors
    ///
    /// Returns an illegal-state error while the job is live and not being
    /// cancelled.
    pub fn cancellation_cause(&self) -> Result<Arc<Error>> {
        self.inner.cancellation_cause()
    }
}

impl<T: Clone + Send + Sync + 'static> Job<T> {
    /// Waits for the terminal [`Outcome`]: the completed value, or the
    /// failure/cancellation cause by identity. Starts a lazily created
    /// job.
    #[must_use]
    pub fn outcome(&self) -> OutcomeFuture<'_, T> {
        OutcomeFuture::new(&self.inner)
    }

    /// Snapshot of the terminal outcome; `None` while the job is live.
    #[must_use]
    pub fn completion(&self) -> Option<Outcome<T>> {
        self.inner.completion_outcome()
    }

    /// Registers this job's outcome as clause `index` of a select; the
    /// winning clause reads the outcome via [`Job::completion`].
    pub fn on_await(&self, arbiter: &Arc<SelectArbiter>, index: usize) -> ClauseRegistration {
        self.register_select(arbiter, index)
    }
}

impl<T: Send + Sync + 'static> ChildJob for Job<T> {
    fn cancel_for_parent(&self, cause: Arc<Error>) -> bool {
        self.inner.do_cancel(cause)
    }

    fn is_terminal(&self) -> bool {
        self.inner.snapshot().is_terminal()
    }

    fn subscribe_terminal(
        &self,
        f: Box<dyn FnOnce(Option<Arc<Error>>) + Send>,
    ) -> ListenerHandle {
        self.inner.install_handler(NotifyPhase::OnCompletion, f)
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.inner.name())
            .field("state", &self.inner.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_utils::init_test_logging;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn eager_job_is_active() {
        init_test("eager_job_is_active");
        let job: Job<u32> = Job::new();
        crate::assert_with_log!(job.is_active(), "eager active", true, job.is_active());
        crate::assert_with_log!(
            job.phase() == JobPhase::Active,
            "phase",
            JobPhase::Active,
            job.phase()
        );
        crate::test_complete!("eager_job_is_active");
    }

    #[test]
    fn lazy_job_starts_once() {
        init_test("lazy_job_starts_once");
        let job: Job<u32> = Job::lazy();
        crate::assert_with_log!(!job.is_active(), "lazy inactive", false, job.is_active());
        let first = job.start();
        let second = job.start();
        crate::assert_with_log!(first, "first start", true, first);
        crate::assert_with_log!(!second, "second start", false, second);
        crate::test_complete!("lazy_job_starts_once");
    }

    #[test]
    fn completion_handler_gets_no_cause_on_success() {
        init_test("completion_handler_gets_no_cause_on_success");
        use std::sync::atomic::{AtomicBool, Ordering};
        let observed_none = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&observed_none);

        let job: Job<u32> = Job::new();
        job.on_completion(move |cause| observed.store(cause.is_none(), Ordering::SeqCst));
        assert!(job.complete(1));
        crate::assert_with_log!(
            observed_none.load(Ordering::SeqCst),
            "handler saw no cause",
            true,
            observed_none.load(Ordering::SeqCst)
        );
        crate::test_complete!("completion_handler_gets_no_cause_on_success");
    }

    #[test]
    fn cancellation_cause_rules() {
        init_test("cancellation_cause_rules");
        // Live job: illegal state.
        let live: Job<u32> = Job::new();
        let err = live.cancellation_cause().expect_err("live job has no cause");
        crate::assert_with_log!(
            err.kind() == ErrorKind::IllegalState,
            "illegal state",
            ErrorKind::IllegalState,
            err.kind()
        );

        // Cancellation-typed cause comes back by identity.
        let cancelled: Job<u32> = Job::new();
        let cause = Arc::new(Error::cancelled(&CancelReason::timeout()));
        assert!(cancelled.cancel_with(Arc::clone(&cause)));
        let got = cancelled.cancellation_cause().expect("cancelled");
        crate::assert_with_log!(
            Arc::ptr_eq(&got, &cause),
            "identity preserved",
            true,
            Arc::ptr_eq(&got, &cause)
        );

        // Non-cancellation cause gets wrapped, inner preserved.
        let wrapped: Job<u32> = Job::new();
        let plain = Arc::new(Error::failure("disk on fire"));
        assert!(wrapped.cancel_with(Arc::clone(&plain)));
        let got = wrapped.cancellation_cause().expect("cancelled");
        crate::assert_with_log!(
            crate::error::same_cause(&got, &plain),
            "wrapper preserves identity",
            true,
            crate::error::same_cause(&got, &plain)
        );

        // Failed job: JobFailed wrapper.
        let failed: Job<u32> = Job::new();
        assert!(failed.fail(Error::failure("boom")));
        let got = failed.cancellation_cause().expect("failed");
        crate::assert_with_log!(
            got.kind() == ErrorKind::JobFailed,
            "failed wrapper",
            ErrorKind::JobFailed,
            got.kind()
        );

        // Completed job: JobCompleted wrapper.
        let done: Job<u32> = Job::new();
        assert!(done.complete(1));
        let got = done.cancellation_cause().expect("completed");
        crate::assert_with_log!(
            got.kind() == ErrorKind::JobCompleted,
            "completed wrapper",
            ErrorKind::JobCompleted,
            got.kind()
        );
        crate::test_complete!("cancellation_cause_rules");
    }

    #[test]
    fn double_parent_init_is_rejected() {
        init_test("double_parent_init_is_rejected");
        let parent_a: Job<u32> = Job::new();
        let parent_b: Job<u32> = Job::new();
        let child: Job<()> = Job::new();

        child.init_parent(&parent_a).expect("first init");
        let err = child.init_parent(&parent_b).expect_err("second init");
        crate::assert_with_log!(
            err.kind() == ErrorKind::IllegalState,
            "illegal state",
            ErrorKind::IllegalState,
            err.kind()
        );
        crate::test_complete!("double_parent_init_is_rejected");
    }

    #[test]
    fn immediate_cancel_skips_run_down() {
        init_test("immediate_cancel_skips_run_down");
        let job: Job<u32> = Job::immediate_cancel();
        assert!(job.cancel());
        crate::assert_with_log!(
            job.phase() == JobPhase::Cancelled,
            "straight to cancelled",
            JobPhase::Cancelled,
            job.phase()
        );
        let second = job.cancel();
        crate::assert_with_log!(!second, "second cancel", false, second);
        crate::test_complete!("immediate_cancel_skips_run_down");
    }

    #[test]
    fn debug_shows_name_and_state() {
        init_test("debug_shows_name_and_state");
        let job: Job<u32> = Job::with_config(JobConfig::new().with_name("pipeline"));
        let text = format!("{job:?}");
        crate::assert_with_log!(
            text.contains("pipeline"),
            "debug carries name",
            true,
            text
        );
        crate::test_complete!("debug_shows_name_and_state");
    }
}
