//! The job state machine core.
//!
//! All lifecycle transitions run through here: start, cancel, the
//! completion protocol (including the wait-for-children loop), listener
//! installation, and terminal notification. The design keeps one atomic
//! word as the sole transition point and pushes every rich payload into a
//! write-once slot owned by the thread that wins the corresponding
//! transition right:
//!
//! - the **cancellation root cause** slot is owned by whoever sets it first;
//!   only that caller drives the job into the cancelling phase
//! - the **completion proposal** is owned by whoever wins the completing
//!   claim; only that caller (or the child-completion callbacks it chains)
//!   publishes a non-cancelled terminal tag
//! - terminal **value**/**failure** slots are written before the terminal
//!   tag is published, so any reader that observes the tag can read the
//!   payload without synchronization

use crate::error::{same_cause, Error, ErrorKind, Result};
use crate::job::node::{
    CompletionFn, ListenerHandle, ListenerNode, NodeChain, NotifyPhase, TakenAction,
};
use crate::job::state::{Snapshot, StateCell};
use crate::job::{CancelMode, JobHooks};
use crate::tracing_compat::{debug, error, trace};
use crate::types::{CancelReason, OutcomeRef};
use core::fmt;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Type-erased view of a child job, letting a parent hold children of any
/// payload type.
pub trait ChildJob: Send + Sync + fmt::Debug {
    /// Requests cancellation of the child with the parent's cause.
    fn cancel_for_parent(&self, cause: Arc<Error>) -> bool;

    /// Returns true once the child reached a terminal state.
    fn is_terminal(&self) -> bool;

    /// Installs a one-shot terminal listener on the child. When the child
    /// is already terminal the listener fires inline and the returned
    /// handle is a no-op.
    fn subscribe_terminal(
        &self,
        f: Box<dyn FnOnce(Option<Arc<Error>>) + Send>,
    ) -> ListenerHandle;
}

/// A completion proposed by the body (or a completable-handle caller).
pub(crate) enum ProposedUpdate<T> {
    /// Normal completion with a value.
    Value(T),
    /// Exceptional completion.
    Failure(Arc<Error>),
}

/// What sits in the proposal slot while the terminal transition is
/// pending.
enum Parked<T> {
    /// A proposal not yet applied to the payload slots.
    Fresh(ProposedUpdate<T>),
    /// The payload slot is already written; only the terminal tag is
    /// outstanding. Used when a finalize attempt had to resume waiting
    /// because a child attached behind the wait loop's last walk.
    Staged {
        /// The proposed failure, kept for the unexpected-completion
        /// report; `None` for a value proposal.
        failed: Option<Arc<Error>>,
    },
}

/// How a finalize attempt resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinalizeOutcome {
    /// This call published a terminal state.
    Published,
    /// A cancel published the terminal first; the proposal was discarded.
    Superseded,
    /// A late-attached child reopened the wait; completion stays pending.
    Waiting,
}

/// Outcome of installing a listener node.
pub(crate) enum Installed {
    /// The job was already past the phase; the listener fired inline (or
    /// was dropped) and the handle is a no-op.
    Immediate,
    /// The node is linked and armed.
    Node(Arc<ListenerNode>),
}

/// Shared state behind a [`crate::job::Job`] facade.
pub(crate) struct JobInner<T> {
    state: StateCell,
    chain: NodeChain,
    /// Cancellation root cause; first cancel wins, set before the
    /// cancelling flag or cancelled tag is published.
    cause: OnceLock<Arc<Error>>,
    /// Terminal failure, set before the failed tag is published.
    failure: OnceLock<Arc<Error>>,
    /// Terminal value, set before the completed tag is published.
    value: OnceLock<T>,
    /// Proposal parked while waiting for child quiescence.
    proposed: Mutex<Option<Parked<T>>>,
    /// At most one completion proposal is ever accepted.
    completing_claim: AtomicBool,
    /// Handle into the parent's chain; disposed on terminal transition.
    parent: Mutex<Option<ListenerHandle>>,
    parent_init: AtomicBool,
    cancel_mode: CancelMode,
    hooks: Box<dyn JobHooks<T>>,
    /// Back-reference for child-completion callbacks; always upgradable
    /// while a child holds a subscription created by this job.
    self_ref: Weak<Self>,
}

impl<T> fmt::Debug for JobInner<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobInner")
            .field("name", &self.hooks.name())
            .field("state", &self.state.load())
            .finish()
    }
}

/// Accumulates handler panics during a notification sweep so one fault
/// never prevents the remaining listeners from running.
#[derive(Default)]
struct FaultAccumulator {
    first: Option<String>,
    extra: usize,
}

impl FaultAccumulator {
    fn record(&mut self, message: String) {
        if self.first.is_some() {
            self.extra += 1;
        } else {
            self.first = Some(message);
        }
    }

    fn report<T>(self, inner: &JobInner<T>) {
        let Some(first) = self.first else { return };
        let context = if self.extra == 0 {
            first
        } else {
            format!("{first} (+{} more handler failures)", self.extra)
        };
        let fault = Error::new(ErrorKind::CompletionHandlerFailed).with_context(context);
        error!(job = %inner.hooks.name(), fault = %fault, "completion handler failed");
        inner.hooks.handle_exception(&fault);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "completion handler panicked".to_string()
    }
}

fn guarded_invoke(f: CompletionFn, cause: Option<Arc<Error>>, faults: &mut FaultAccumulator) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || f(cause))) {
        faults.record(panic_message(payload.as_ref()));
    }
}

impl<T: Send + Sync + 'static> JobInner<T> {
    pub(crate) fn new(
        start_active: bool,
        cancel_mode: CancelMode,
        hooks: Box<dyn JobHooks<T>>,
    ) -> Arc<Self> {
        let initial = if start_active {
            Snapshot::Active
        } else {
            Snapshot::New
        };
        Arc::new_cyclic(|self_ref| Self {
            state: StateCell::new(initial),
            chain: NodeChain::new(),
            cause: OnceLock::new(),
            failure: OnceLock::new(),
            value: OnceLock::new(),
            proposed: Mutex::new(None),
            completing_claim: AtomicBool::new(false),
            parent: Mutex::new(None),
            parent_init: AtomicBool::new(false),
            cancel_mode,
            hooks,
            self_ref: Weak::clone(self_ref),
        })
    }

    pub(crate) fn name(&self) -> &str {
        self.hooks.name()
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        self.state.load()
    }

    #[cfg(test)]
    pub(crate) fn value_ref(&self) -> Option<&T> {
        self.value.get()
    }

    #[cfg(test)]
    pub(crate) fn cause_ref(&self) -> Option<&Arc<Error>> {
        self.cause.get()
    }

    // ── Start ────────────────────────────────────────────────────────────

    /// Starts a lazily created job. Returns true iff this call effected
    /// the New → Active transition; the `on_start` hook fires exactly once.
    pub(crate) fn start(&self) -> bool {
        loop {
            let word = self.state.load_word();
            match Snapshot::from_word(word) {
                Snapshot::New => {
                    if self.state.transition(word, Snapshot::Active) {
                        trace!(job = %self.name(), "job started");
                        self.hooks.on_start();
                        return true;
                    }
                }
                _ => return false,
            }
        }
    }

    // ── Cancel ───────────────────────────────────────────────────────────

    /// Requests cancellation with the given cause. Returns true iff this
    /// call effected the transition into a cancelling or cancelled state.
    pub(crate) fn do_cancel(&self, cause: Arc<Error>) -> bool {
        if self.state.load().is_terminal() {
            return false;
        }
        if self.cause.set(Arc::clone(&cause)).is_err() {
            trace!(job = %self.name(), "cancel ignored, already cancelling");
            return false;
        }
        debug!(job = %self.name(), cause = %cause, "cancellation requested");
        match self.cancel_mode {
            CancelMode::Immediate => self.cancel_to_terminal(),
            CancelMode::Draining => self.cancel_to_cancelling(&cause),
        }
    }

    /// Immediate mode: no run-down phase, straight to the cancelled tag.
    fn cancel_to_terminal(&self) -> bool {
        loop {
            let word = self.state.load_word();
            if Snapshot::from_word(word).is_terminal() {
                return false;
            }
            if self.state.transition(word, Snapshot::Cancelled) {
                self.notify_terminal();
                return true;
            }
        }
    }

    /// Draining mode: enter the cancelling phase and run children down;
    /// a job that never started has nothing to run down and goes straight
    /// to the cancelled tag.
    fn cancel_to_cancelling(&self, cause: &Arc<Error>) -> bool {
        loop {
            let word = self.state.load_word();
            match Snapshot::from_word(word) {
                Snapshot::New => {
                    if self.state.transition(word, Snapshot::Cancelled) {
                        self.notify_terminal();
                        return true;
                    }
                }
                Snapshot::Active => {
                    let target = Snapshot::Finishing {
                        cancelling: true,
                        completing: false,
                    };
                    if self.state.transition(word, target) {
                        self.notify_cancelling(cause);
                        return true;
                    }
                }
                Snapshot::Finishing {
                    cancelling: false,
                    completing,
                } => {
                    let target = Snapshot::Finishing {
                        cancelling: true,
                        completing,
                    };
                    if self.state.transition(word, target) {
                        self.notify_cancelling(cause);
                        return true;
                    }
                }
                // The cause slot is single-set, so only this caller can
                // raise the cancelling flag.
                Snapshot::Finishing {
                    cancelling: true, ..
                } => return true,
                _terminal => return false,
            }
        }
    }

    /// Cancels every attached child without touching this job's state.
    pub(crate) fn cancel_children(&self, cause: &Arc<Error>) {
        for node in self.chain.iter() {
            if node.is_removed() {
                continue;
            }
            if let Some(child) = node.peek_child() {
                child.cancel_for_parent(Arc::clone(cause));
            }
        }
    }

    // ── Completion protocol ──────────────────────────────────────────────

    /// Accepts a completion proposal. Returns true iff this call initiated
    /// completion; the terminal transition itself may be deferred until
    /// every attached child is terminal.
    pub(crate) fn make_completing(&self, update: ProposedUpdate<T>) -> bool {
        if self.state.load().is_terminal() {
            trace!(job = %self.name(), "completion rejected, already complete");
            return false;
        }
        if self.completing_claim.swap(true, Ordering::AcqRel) {
            trace!(job = %self.name(), "completion rejected, already completing");
            return false;
        }

        if self.next_child(None).is_none() {
            *self.proposed.lock() = Some(Parked::Fresh(update));
            // Waiting still counts as initiating completion; only a cancel
            // that already owned the terminal makes this call a no-op.
            return self.finalize_completing() != FinalizeOutcome::Superseded;
        }

        // Children are attached: park the proposal and enter the
        // completing phase before waiting on them.
        loop {
            let word = self.state.load_word();
            let snap = Snapshot::from_word(word);
            if snap.is_terminal() {
                // A cancel won the terminal race; the proposal is discarded.
                return false;
            }
            let cancelling = snap.is_cancelling();
            let target = Snapshot::Finishing {
                cancelling,
                completing: true,
            };
            if self.state.transition(word, target) {
                break;
            }
        }

        let failure = match &update {
            ProposedUpdate::Failure(cause) => Some(Arc::clone(cause)),
            ProposedUpdate::Value(_) => None,
        };
        *self.proposed.lock() = Some(Parked::Fresh(update));
        if let Some(cause) = failure {
            // A failing body does not wait politely: children are told to
            // wind down with the failure as their cancellation cause.
            self.cancel_children(&wrap_cancellation(&cause));
        }
        debug!(job = %self.name(), "completing, waiting for children");
        self.continue_completing(None);
        true
    }

    /// Advances the wait-for-children loop from `after`, finalizing once
    /// no live child remains.
    pub(crate) fn continue_completing(&self, after: Option<&Arc<ListenerNode>>) {
        let mut position = after.cloned();
        loop {
            let Some(node) = self.next_child(position.as_ref()) else {
                self.finalize_completing();
                return;
            };
            let Some(child) = node.peek_child() else {
                position = Some(node);
                continue;
            };
            if child.is_terminal() {
                position = Some(node);
                continue;
            }
            let Some(this) = self.self_ref.upgrade() else {
                return;
            };
            let waited = Arc::clone(&node);
            let _handle = child.subscribe_terminal(Box::new(move |_cause| {
                this.continue_completing(Some(&waited));
            }));
            return;
        }
    }

    /// Returns the first non-removed child node strictly after `after`
    /// (from the head when `after` is `None`). Tombstoned nodes stay
    /// linked, so traversal survives concurrent disposal.
    fn next_child(&self, after: Option<&Arc<ListenerNode>>) -> Option<Arc<ListenerNode>> {
        let mut iter = self.chain.iter();
        if let Some(after) = after {
            for node in iter.by_ref() {
                if Arc::ptr_eq(&node, after) {
                    break;
                }
            }
        }
        iter.find(|node| node.is_child() && !node.is_removed())
    }

    /// Returns true if any attached child is still non-terminal.
    fn has_live_child(&self) -> bool {
        let mut position: Option<Arc<ListenerNode>> = None;
        while let Some(node) = self.next_child(position.as_ref()) {
            if let Some(child) = node.peek_child() {
                if !child.is_terminal() {
                    return true;
                }
            }
            position = Some(node);
        }
        false
    }

    /// Publishes the parked proposal as the terminal state, coercing to
    /// the cancellation root cause when cancellation is in progress.
    ///
    /// The child re-check and the terminal CAS are linearized through the
    /// state word: attaching a child bumps the word's epoch, so a CAS
    /// taken against the word this loop read fails if a child slipped in
    /// behind the walk. The decided outcome is then re-parked and the
    /// wait loop resumes on the newcomer.
    fn finalize_completing(&self) -> FinalizeOutcome {
        let Some(parked) = self.proposed.lock().take() else {
            return FinalizeOutcome::Superseded;
        };

        let (target, failure) = match parked {
            Parked::Fresh(ProposedUpdate::Value(value)) => {
                let _ = self.value.set(value);
                (Snapshot::Completed, None)
            }
            Parked::Fresh(ProposedUpdate::Failure(cause)) => {
                let _ = self.failure.set(Arc::clone(&cause));
                (Snapshot::Failed, Some(cause))
            }
            Parked::Staged { failed } => {
                let target = if failed.is_some() {
                    Snapshot::Failed
                } else {
                    Snapshot::Completed
                };
                (target, failed)
            }
        };

        let mut reported_unexpected = false;
        loop {
            let word = self.state.load_word();
            let snap = Snapshot::from_word(word);
            if snap.is_terminal() {
                // A cancel published the terminal first.
                if let Some(proposal) = &failure {
                    self.report_unexpected(proposal, &mut reported_unexpected);
                }
                return FinalizeOutcome::Superseded;
            }
            if self.has_live_child() {
                // A child attached behind the wait loop's last walk; park
                // the decided outcome and resume waiting on the newcomer.
                *self.proposed.lock() = Some(Parked::Staged {
                    failed: failure.clone(),
                });
                self.enter_completing_phase();
                if let Some(cause) = &failure {
                    self.cancel_children(&wrap_cancellation(cause));
                }
                self.continue_completing(None);
                return FinalizeOutcome::Waiting;
            }
            if snap.is_cancelling() {
                if let Some(proposal) = &failure {
                    self.report_unexpected(proposal, &mut reported_unexpected);
                }
                if self.state.transition(word, Snapshot::Cancelled) {
                    self.notify_terminal();
                    return FinalizeOutcome::Published;
                }
                continue;
            }
            if self.state.transition(word, target) {
                self.notify_terminal();
                return FinalizeOutcome::Published;
            }
        }
    }

    /// Raises the completing flag so a job held up by a late-attached
    /// child is observably in the completing phase.
    fn enter_completing_phase(&self) {
        loop {
            let word = self.state.load_word();
            let snap = Snapshot::from_word(word);
            if snap.is_terminal()
                || matches!(snap, Snapshot::Finishing { completing: true, .. })
            {
                return;
            }
            let target = Snapshot::Finishing {
                cancelling: snap.is_cancelling(),
                completing: true,
            };
            if self.state.transition(word, target) {
                return;
            }
        }
    }

    /// The body proposed a failure while cancellation already owned the
    /// outcome: the root cause wins and the proposal is reported out of
    /// band, without blocking the transition.
    fn report_unexpected(&self, proposal: &Arc<Error>, reported: &mut bool) {
        if *reported {
            return;
        }
        *reported = true;
        let Some(root) = self.cause.get() else { return };
        if same_cause(proposal, root) {
            return;
        }
        let fault = Error::new(ErrorKind::UnexpectedCompletion)
            .with_context("completion proposed while cancellation in progress")
            .with_cause(Arc::clone(proposal));
        error!(job = %self.name(), fault = %fault, "unexpected exception during cancellation");
        self.hooks.handle_exception(&fault);
    }

    // ── Listener installation ────────────────────────────────────────────

    /// Installs a listener node, delivering inline when the job is already
    /// past the phase the node is armed for.
    pub(crate) fn install(&self, node: Arc<ListenerNode>) -> Installed {
        let snap = self.state.load();
        if snap.is_terminal() {
            self.deliver_terminal_now(&node);
            return Installed::Immediate;
        }
        if node.phase() == NotifyPhase::OnCancelling && snap.is_cancelling() {
            self.deliver_cancelling_now(&node);
            return Installed::Immediate;
        }

        self.chain.push(Arc::clone(&node));

        // Revalidate: a transition racing the link must not strand the node.
        let snap = self.state.load();
        if snap.is_terminal() {
            self.deliver_terminal_now(&node);
            return Installed::Immediate;
        }
        if node.phase() == NotifyPhase::OnCancelling && snap.is_cancelling() {
            self.deliver_cancelling_now(&node);
            return Installed::Immediate;
        }
        Installed::Node(node)
    }

    /// Installs a completion or cancellation handler.
    pub(crate) fn install_handler(
        &self,
        phase: NotifyPhase,
        f: CompletionFn,
    ) -> ListenerHandle {
        match self.install(ListenerNode::handler(phase, f)) {
            Installed::Immediate => ListenerHandle::noop(),
            Installed::Node(node) => ListenerHandle::for_node(node),
        }
    }

    fn deliver_terminal_now(&self, node: &Arc<ListenerNode>) {
        let cause = self.terminal_cause();
        match node.take_action() {
            None => {}
            Some(TakenAction::Handler(f)) => f(cause),
            Some(TakenAction::Child(child)) => {
                child.cancel_for_parent(self.parent_cancel_cause());
            }
            Some(TakenAction::Waiter(waker)) => waker.wake(),
            Some(TakenAction::Select(clause)) => clause.fire(),
        }
    }

    fn deliver_cancelling_now(&self, node: &Arc<ListenerNode>) {
        let Some(root) = self.cause.get() else { return };
        match node.take_action() {
            None => {}
            Some(TakenAction::Handler(f)) => f(Some(Arc::clone(root))),
            Some(TakenAction::Child(child)) => {
                child.cancel_for_parent(self.parent_cancel_cause());
            }
            Some(TakenAction::Waiter(waker)) => waker.wake(),
            Some(TakenAction::Select(clause)) => clause.fire(),
        }
    }

    // ── Parent / child wiring ────────────────────────────────────────────

    /// Attaches `child` so that this job waits for it before completing
    /// and propagates cancellation to it. The returned handle belongs to
    /// the child, which disposes it on its own terminal transition.
    ///
    /// The attach is conditional on the state word: linking is followed
    /// by an epoch bump CAS against the word the attach was judged by.
    /// A successful bump fails any in-flight finalize CAS, which then
    /// re-checks the children and waits; a failed bump means the state
    /// moved and the attach is re-judged.
    pub(crate) fn attach_child(&self, child: Arc<dyn ChildJob>) -> ListenerHandle {
        let mut node: Option<Arc<ListenerNode>> = None;
        loop {
            let word = self.state.load_word();
            let snap = Snapshot::from_word(word);
            if snap.is_terminal()
                || matches!(
                    snap,
                    Snapshot::Finishing {
                        cancelling: true,
                        completing: true,
                    }
                )
            {
                // Too late to be waited for; the child observes the
                // parent's cause immediately.
                if let Some(node) = node {
                    node.dispose();
                }
                child.cancel_for_parent(self.parent_cancel_cause());
                return ListenerHandle::noop();
            }

            let linked = match node.take() {
                Some(existing) => existing,
                None => {
                    let fresh = ListenerNode::child(Arc::clone(&child));
                    self.chain.push(Arc::clone(&fresh));
                    fresh
                }
            };
            node = Some(Arc::clone(&linked));

            if self.state.bump_epoch(word) {
                if snap.is_cancelling() {
                    // Cancellation began before the link; the child still
                    // gets waited for, and must observe the cause now.
                    // Child cancellation is idempotent, so a duplicate
                    // delivery from the notification sweep is harmless.
                    child.cancel_for_parent(self.parent_cancel_cause());
                }
                return ListenerHandle::for_node(linked);
            }
        }
    }

    /// Records the handle this job holds inside its parent's chain.
    /// Set at most once; disposed exactly once on terminal transition.
    pub(crate) fn init_parent(&self, handle: ListenerHandle) -> Result<()> {
        if self.parent_init.swap(true, Ordering::AcqRel) {
            handle.dispose();
            return Err(Error::illegal_state("parent already initialized"));
        }
        if self.state.load().is_terminal() {
            handle.dispose();
            return Ok(());
        }
        *self.parent.lock() = Some(handle);
        // A terminal transition racing the store must still dispose.
        if self.state.load().is_terminal() {
            if let Some(handle) = self.parent.lock().take() {
                handle.dispose();
            }
        }
        Ok(())
    }

    /// Counts attached children that have not yet detached.
    pub(crate) fn child_count(&self) -> usize {
        self.chain
            .iter()
            .filter(|node| !node.is_removed() && node.peek_child().is_some())
            .count()
    }

    // ── Notification ─────────────────────────────────────────────────────

    /// Fires every cancellation-phase listener exactly once with the root
    /// cause, then the `on_cancelling` hook. Runs at most once per job:
    /// the root cause slot is single-set and only its owner gets here.
    fn notify_cancelling(&self, cause: &Arc<Error>) {
        trace!(job = %self.name(), "notifying cancellation listeners");
        let child_cause = wrap_cancellation(cause);
        let mut faults = FaultAccumulator::default();
        for node in self.chain.iter() {
            if node.is_removed() || node.phase() != NotifyPhase::OnCancelling {
                continue;
            }
            if node.is_child() {
                // Child nodes are not consumed here: the completion
                // protocol still needs them for the wait loop.
                if let Some(child) = node.peek_child() {
                    child.cancel_for_parent(Arc::clone(&child_cause));
                }
            } else if let Some(TakenAction::Handler(f)) = node.take_action() {
                guarded_invoke(f, Some(Arc::clone(cause)), &mut faults);
            }
        }
        faults.report(self);
        self.hooks.on_cancelling(Some(cause));
    }

    /// Post-terminal sweep: detach from the parent, fire every remaining
    /// listener exactly once, then the subclass hooks.
    fn notify_terminal(&self) {
        let snap = self.state.load();
        debug_assert!(snap.is_terminal(), "notify_terminal on live job");
        debug!(job = %self.name(), state = ?snap, "job reached terminal state");

        if let Some(handle) = self.parent.lock().take() {
            handle.dispose();
        }

        let cause = self.terminal_cause();
        let mut child_cause: Option<Arc<Error>> = None;
        let mut faults = FaultAccumulator::default();
        for node in self.chain.iter() {
            if node.is_removed() {
                continue;
            }
            match node.take_action() {
                None => {}
                Some(TakenAction::Handler(f)) => {
                    guarded_invoke(f, cause.clone(), &mut faults);
                }
                Some(TakenAction::Child(child)) => {
                    let cause = child_cause
                        .get_or_insert_with(|| self.parent_cancel_cause())
                        .clone();
                    child.cancel_for_parent(cause);
                }
                Some(TakenAction::Waiter(waker)) => waker.wake(),
                Some(TakenAction::Select(clause)) => clause.fire(),
            }
        }
        faults.report(self);

        if self.cause.get().is_none() {
            self.hooks.on_cancelling(self.failure.get());
        }
        match snap {
            Snapshot::Completed => {
                if let Some(value) = self.value.get() {
                    self.hooks.after_completion(OutcomeRef::Completed(value));
                }
            }
            Snapshot::Failed => {
                if let Some(failure) = self.failure.get() {
                    self.hooks.after_completion(OutcomeRef::Failed(failure));
                }
            }
            _ => {
                if let Some(root) = self.cause.get() {
                    self.hooks.after_completion(OutcomeRef::Cancelled(root));
                }
            }
        }
    }

    // ── Cause materialization ────────────────────────────────────────────

    /// The cause listeners receive at terminal: `None` for normal
    /// completion, the stored cause otherwise.
    pub(crate) fn terminal_cause(&self) -> Option<Arc<Error>> {
        match self.state.load() {
            Snapshot::Cancelled => self.cause.get().cloned(),
            Snapshot::Failed => self.failure.get().cloned(),
            _ => None,
        }
    }

    /// The cancellation exception a child observes when this job cancels
    /// it (cancelling phase, terminal, or late attach).
    pub(crate) fn parent_cancel_cause(&self) -> Arc<Error> {
        let snap = self.state.load();
        if snap.is_cancelling() {
            if let Some(root) = self.cause.get() {
                return wrap_cancellation(root);
            }
        }
        match snap {
            Snapshot::Failed => {
                let mut wrapper =
                    Error::new(ErrorKind::JobFailed).with_context("job has failed");
                if let Some(failure) = self.failure.get() {
                    wrapper = wrapper.with_cause(Arc::clone(failure));
                }
                Arc::new(wrapper)
            }
            Snapshot::Completed => Arc::new(
                Error::new(ErrorKind::JobCompleted)
                    .with_context("job has completed normally"),
            ),
            _ => Arc::new(Error::cancelled(&CancelReason::parent_cancelled())),
        }
    }

    /// Returns the cancellation exception reflecting the terminal (or
    /// in-progress cancelling) cause.
    pub(crate) fn cancellation_cause(&self) -> Result<Arc<Error>> {
        match self.state.load() {
            Snapshot::Cancelled
            | Snapshot::Finishing {
                cancelling: true, ..
            } => {
                let root = self
                    .cause
                    .get()
                    .cloned()
                    .unwrap_or_else(|| Arc::new(Error::cancelled(&CancelReason::default())));
                Ok(wrap_cancellation(&root))
            }
            Snapshot::Failed => {
                let mut wrapper =
                    Error::new(ErrorKind::JobFailed).with_context("job has failed");
                if let Some(failure) = self.failure.get() {
                    wrapper = wrapper.with_cause(Arc::clone(failure));
                }
                Ok(Arc::new(wrapper))
            }
            Snapshot::Completed => Ok(Arc::new(
                Error::new(ErrorKind::JobCompleted)
                    .with_context("job has completed normally"),
            )),
            _ => Err(Error::illegal_state(
                "job is not complete or being cancelled",
            )),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> JobInner<T> {
    /// Snapshot of the terminal outcome; `None` while the job is live.
    pub(crate) fn completion_outcome(&self) -> Option<crate::types::Outcome<T>> {
        use crate::types::Outcome;
        match self.state.load() {
            Snapshot::Completed => self.value.get().map(|v| Outcome::Completed(v.clone())),
            Snapshot::Failed => self.failure.get().map(|e| Outcome::Failed(Arc::clone(e))),
            Snapshot::Cancelled => self.cause.get().map(|c| Outcome::Cancelled(Arc::clone(c))),
            _ => None,
        }
    }
}

/// Returns `cause` itself when it is already cancellation-typed, otherwise
/// a cancellation wrapper whose inner cause is `cause` by identity.
pub(crate) fn wrap_cancellation(cause: &Arc<Error>) -> Arc<Error> {
    if cause.is_cancellation() {
        Arc::clone(cause)
    } else {
        Arc::new(
            Error::new(ErrorKind::Cancelled)
                .with_context("job was cancelled")
                .with_cause(Arc::clone(cause)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::DefaultHooks;

    fn plain_inner() -> Arc<JobInner<u32>> {
        JobInner::new(true, CancelMode::Draining, Box::new(DefaultHooks::unnamed()))
    }

    #[test]
    fn start_fires_hook_once() {
        let inner: Arc<JobInner<u32>> =
            JobInner::new(false, CancelMode::Draining, Box::new(DefaultHooks::unnamed()));
        assert_eq!(inner.snapshot(), Snapshot::New);
        assert!(inner.start());
        assert!(!inner.start());
        assert_eq!(inner.snapshot(), Snapshot::Active);
    }

    #[test]
    fn direct_completion_publishes_value() {
        let inner = plain_inner();
        assert!(inner.make_completing(ProposedUpdate::Value(7)));
        assert_eq!(inner.snapshot(), Snapshot::Completed);
        assert_eq!(inner.value_ref(), Some(&7));
        assert!(!inner.make_completing(ProposedUpdate::Value(8)));
        assert_eq!(inner.value_ref(), Some(&7));
    }

    #[test]
    fn cancel_wins_over_later_completion() {
        let inner = plain_inner();
        let cause = Arc::new(Error::cancelled(&CancelReason::user("stop")));
        assert!(inner.do_cancel(Arc::clone(&cause)));
        assert_eq!(
            inner.snapshot(),
            Snapshot::Finishing {
                cancelling: true,
                completing: false
            }
        );
        assert!(inner.make_completing(ProposedUpdate::Value(7)));
        assert_eq!(inner.snapshot(), Snapshot::Cancelled);
        assert!(Arc::ptr_eq(inner.cause_ref().expect("cause"), &cause));
    }

    #[test]
    fn second_cancel_is_rejected() {
        let inner = plain_inner();
        let first = Arc::new(Error::cancelled(&CancelReason::user("first")));
        let second = Arc::new(Error::cancelled(&CancelReason::user("second")));
        assert!(inner.do_cancel(Arc::clone(&first)));
        assert!(!inner.do_cancel(second));
        assert!(Arc::ptr_eq(inner.cause_ref().expect("cause"), &first));
    }

    #[test]
    fn wrap_preserves_identity() {
        let plain = Arc::new(Error::failure("boom"));
        let wrapped = wrap_cancellation(&plain);
        assert!(same_cause(&wrapped, &plain));

        let already = Arc::new(Error::cancelled(&CancelReason::timeout()));
        let rewrapped = wrap_cancellation(&already);
        assert!(Arc::ptr_eq(&rewrapped, &already));
    }
}
