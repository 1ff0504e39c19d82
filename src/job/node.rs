//! Listener nodes and the intrusive listener chain.
//!
//! Listeners are held in an append-only lock-free chain: every node carries
//! its own forward link, so the first node doubles as the whole "list" and
//! zero- or one-listener jobs never allocate a separate container. Removal
//! is logical (a tombstone flag); traversal skips tombstoned nodes and the
//! payload slot is emptied on removal or invocation, so a node fires at
//! most once no matter how notification and disposal race.

use crate::error::Error;
use crate::job::core::ChildJob;
use crate::job::select::SelectClause;
use core::fmt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::Waker;

/// A one-shot completion callback.
pub(crate) type CompletionFn = Box<dyn FnOnce(Option<Arc<Error>>) + Send>;

/// When a listener fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NotifyPhase {
    /// Fires when cancellation begins (and is drained at terminal if still armed).
    OnCancelling,
    /// Fires only on terminal transition.
    OnCompletion,
}

/// The payload of a listener node.
pub(crate) enum NodeSlot {
    /// A user callback, consumed on first invocation.
    Handler(Mutex<Option<CompletionFn>>),
    /// An attached child; kept across cancellation notifications, consumed
    /// at the parent's terminal transition.
    Child(Mutex<Option<Arc<dyn ChildJob>>>),
    /// A suspended `join`/`outcome` caller's waker.
    Waiter(Mutex<Option<Waker>>),
    /// A select clause racing this job against other events.
    Select(Mutex<Option<SelectClause>>),
}

/// Action extracted from a node when it fires.
pub(crate) enum TakenAction {
    Handler(CompletionFn),
    Child(Arc<dyn ChildJob>),
    Waiter(Waker),
    Select(SelectClause),
}

/// A listener installed on a job.
///
/// The node is simultaneously the chain element and (for the first
/// listener) the chain itself.
pub(crate) struct ListenerNode {
    phase: NotifyPhase,
    removed: AtomicBool,
    slot: NodeSlot,
    next: OnceLock<Arc<ListenerNode>>,
}

impl ListenerNode {
    pub(crate) fn handler(phase: NotifyPhase, f: CompletionFn) -> Arc<Self> {
        Arc::new(Self {
            phase,
            removed: AtomicBool::new(false),
            slot: NodeSlot::Handler(Mutex::new(Some(f))),
            next: OnceLock::new(),
        })
    }

    pub(crate) fn child(child: Arc<dyn ChildJob>) -> Arc<Self> {
        Arc::new(Self {
            phase: NotifyPhase::OnCancelling,
            removed: AtomicBool::new(false),
            slot: NodeSlot::Child(Mutex::new(Some(child))),
            next: OnceLock::new(),
        })
    }

    pub(crate) fn waiter(waker: Waker) -> Arc<Self> {
        Arc::new(Self {
            phase: NotifyPhase::OnCompletion,
            removed: AtomicBool::new(false),
            slot: NodeSlot::Waiter(Mutex::new(Some(waker))),
            next: OnceLock::new(),
        })
    }

    pub(crate) fn select(clause: SelectClause) -> Arc<Self> {
        Arc::new(Self {
            phase: NotifyPhase::OnCompletion,
            removed: AtomicBool::new(false),
            slot: NodeSlot::Select(Mutex::new(Some(clause))),
            next: OnceLock::new(),
        })
    }

    pub(crate) fn phase(&self) -> NotifyPhase {
        self.phase
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn is_child(&self) -> bool {
        matches!(self.slot, NodeSlot::Child(_))
    }

    /// Logically removes the node and drops its payload.
    ///
    /// Idempotent; a node that already fired is unaffected.
    pub(crate) fn dispose(&self) {
        self.removed.store(true, Ordering::Release);
        match &self.slot {
            NodeSlot::Handler(slot) => drop(slot.lock().take()),
            NodeSlot::Child(slot) => drop(slot.lock().take()),
            NodeSlot::Waiter(slot) => drop(slot.lock().take()),
            NodeSlot::Select(slot) => drop(slot.lock().take()),
        }
    }

    /// Consumes the payload for invocation; `None` if the node already
    /// fired or was disposed.
    pub(crate) fn take_action(&self) -> Option<TakenAction> {
        match &self.slot {
            NodeSlot::Handler(slot) => slot.lock().take().map(TakenAction::Handler),
            NodeSlot::Child(slot) => slot.lock().take().map(TakenAction::Child),
            NodeSlot::Waiter(slot) => slot.lock().take().map(TakenAction::Waiter),
            NodeSlot::Select(slot) => slot.lock().take().map(TakenAction::Select),
        }
    }

    /// Borrows the attached child without consuming the node, so the node
    /// survives for the completion wait loop.
    pub(crate) fn peek_child(&self) -> Option<Arc<dyn ChildJob>> {
        match &self.slot {
            NodeSlot::Child(slot) => slot.lock().clone(),
            _ => None,
        }
    }

    /// Refreshes the stored waker (waiter nodes only). A slot already
    /// consumed by notification is left empty; the caller re-checks the
    /// job state after storing, so the wakeup is not lost.
    pub(crate) fn store_waker(&self, waker: &Waker) {
        if let NodeSlot::Waiter(slot) = &self.slot {
            let mut guard = slot.lock();
            if let Some(existing) = guard.as_mut() {
                existing.clone_from(waker);
            }
        }
    }

    fn next(&self) -> Option<Arc<Self>> {
        self.next.get().cloned()
    }
}

impl fmt::Debug for ListenerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.slot {
            NodeSlot::Handler(_) => "handler",
            NodeSlot::Child(_) => "child",
            NodeSlot::Waiter(_) => "waiter",
            NodeSlot::Select(_) => "select",
        };
        f.debug_struct("ListenerNode")
            .field("kind", &kind)
            .field("phase", &self.phase)
            .field("removed", &self.is_removed())
            .finish()
    }
}

/// The intrusive listener chain: a `OnceLock` head plus per-node links.
#[derive(Debug, Default)]
pub(crate) struct NodeChain {
    head: OnceLock<Arc<ListenerNode>>,
}

impl NodeChain {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends a node. Lock-free: a failed link means another append won
    /// that slot, so the walk resumes one node further.
    pub(crate) fn push(&self, node: Arc<ListenerNode>) {
        let mut pending = node;
        match self.head.set(pending) {
            Ok(()) => return,
            Err(rejected) => pending = rejected,
        }
        let mut cursor = self.head.get().cloned().expect("head observed empty after failed set");
        loop {
            match cursor.next.set(pending) {
                Ok(()) => return,
                Err(rejected) => pending = rejected,
            }
            let next = cursor.next().expect("next observed empty after failed set");
            cursor = next;
        }
    }

    /// Iterates every node in insertion order, tombstoned nodes included;
    /// callers filter with [`ListenerNode::is_removed`].
    pub(crate) fn iter(&self) -> ChainIter {
        ChainIter {
            next: self.head.get().cloned(),
        }
    }
}

/// Forward iterator over the chain.
pub(crate) struct ChainIter {
    next: Option<Arc<ListenerNode>>,
}

impl Iterator for ChainIter {
    type Item = Arc<ListenerNode>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.next = current.next();
        Some(current)
    }
}

/// A disposable handle to an installed listener.
///
/// Disposing removes the listener so it will never fire; disposal is
/// idempotent and safe to race with notification (the listener fires at
/// most once either way). A handle returned for a listener that already
/// fired at install time is a no-op.
pub struct ListenerHandle {
    node: Option<Arc<ListenerNode>>,
}

impl ListenerHandle {
    pub(crate) fn noop() -> Self {
        Self { node: None }
    }

    pub(crate) fn for_node(node: Arc<ListenerNode>) -> Self {
        Self { node: Some(node) }
    }

    /// Removes the listener from its job. Idempotent.
    pub fn dispose(&self) {
        if let Some(node) = &self.node {
            node.dispose();
        }
    }

    /// Returns true if this handle never had a live listener to remove.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.node.is_none()
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("noop", &self.is_noop())
            .finish()
    }
}
