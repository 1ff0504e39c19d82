//! Suspendable waits: `join` and `outcome`.
//!
//! Both futures follow the same shape: a fast path that returns when the
//! job is already terminal, and a slow path that starts a lazily created
//! job, parks a waker-carrying listener node on it, and re-checks the
//! state after every waker store so a racing terminal transition can
//! never strand the caller.
//!
//! # Cancel Safety
//!
//! Dropping either future removes its listener. The waited job is not
//! affected: a caller that stops waiting stops only its own wait.

use crate::job::core::{Installed, JobInner};
use crate::job::node::ListenerNode;
use crate::types::Outcome;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Shared park/re-check logic for both wait futures.
struct WaitNode {
    node: Option<Arc<ListenerNode>>,
}

impl WaitNode {
    fn new() -> Self {
        Self { node: None }
    }

    /// Parks the caller, returning true if the job turned out terminal.
    fn park<T: Send + Sync + 'static>(
        &mut self,
        inner: &Arc<JobInner<T>>,
        cx: &mut Context<'_>,
    ) -> bool {
        match &self.node {
            Some(node) => {
                node.store_waker(cx.waker());
                inner.snapshot().is_terminal()
            }
            None => {
                let node = ListenerNode::waiter(cx.waker().clone());
                match inner.install(node) {
                    Installed::Immediate => true,
                    Installed::Node(node) => {
                        self.node = Some(node);
                        false
                    }
                }
            }
        }
    }

    fn detach(&mut self) {
        if let Some(node) = self.node.take() {
            node.dispose();
        }
    }
}

/// Future returned by [`crate::job::Job::join`].
///
/// Completes when the job reaches a terminal state, whatever that state
/// is; `join` only waits, it never reports the joined job's outcome.
/// Joining a lazily created job starts it.
#[must_use = "futures do nothing unless polled"]
pub struct Join<'a, T> {
    inner: &'a Arc<JobInner<T>>,
    wait: WaitNode,
}

impl<'a, T: Send + Sync + 'static> Join<'a, T> {
    pub(crate) fn new(inner: &'a Arc<JobInner<T>>) -> Self {
        Self {
            inner,
            wait: WaitNode::new(),
        }
    }
}

impl<T: Send + Sync + 'static> Future for Join<'_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.inner.snapshot().is_terminal() {
            this.wait.detach();
            return Poll::Ready(());
        }
        this.inner.start();
        if this.wait.park(this.inner, cx) {
            this.wait.detach();
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

impl<T> Drop for Join<'_, T> {
    fn drop(&mut self) {
        self.wait.detach();
    }
}

/// Future returned by [`crate::job::Job::outcome`].
///
/// Completes with the job's terminal [`Outcome`]: the completed value, or
/// the failure/cancellation cause by identity. Awaiting a lazily created
/// job starts it.
#[must_use = "futures do nothing unless polled"]
pub struct OutcomeFuture<'a, T> {
    inner: &'a Arc<JobInner<T>>,
    wait: WaitNode,
}

impl<'a, T: Clone + Send + Sync + 'static> OutcomeFuture<'a, T> {
    pub(crate) fn new(inner: &'a Arc<JobInner<T>>) -> Self {
        Self {
            inner,
            wait: WaitNode::new(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Future for OutcomeFuture<'_, T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome<T>> {
        let this = self.get_mut();
        if let Some(outcome) = this.inner.completion_outcome() {
            this.wait.detach();
            return Poll::Ready(outcome);
        }
        this.inner.start();
        if this.wait.park(this.inner, cx) {
            this.wait.detach();
            if let Some(outcome) = this.inner.completion_outcome() {
                return Poll::Ready(outcome);
            }
        }
        Poll::Pending
    }
}

impl<T> Drop for OutcomeFuture<'_, T> {
    fn drop(&mut self) {
        self.wait.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::test_utils::{init_test_logging, poll_once};

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn join_ready_on_completed_job() {
        init_test("join_ready_on_completed_job");
        let job: Job<u32> = Job::new();
        assert!(job.complete(5));

        let mut join = job.join();
        let ready = poll_once(&mut join).is_ready();
        crate::assert_with_log!(ready, "join ready", true, ready);
        crate::test_complete!("join_ready_on_completed_job");
    }

    #[test]
    fn join_starts_lazy_job() {
        init_test("join_starts_lazy_job");
        let job: Job<u32> = Job::lazy();
        crate::assert_with_log!(!job.is_active(), "lazy not active", false, job.is_active());

        let mut join = job.join();
        let pending = poll_once(&mut join).is_pending();
        crate::assert_with_log!(pending, "join pending", true, pending);
        crate::assert_with_log!(job.is_active(), "join started job", true, job.is_active());

        assert!(job.complete(1));
        let ready = poll_once(&mut join).is_ready();
        crate::assert_with_log!(ready, "join ready after complete", true, ready);
        crate::test_complete!("join_starts_lazy_job");
    }

    #[test]
    fn outcome_delivers_value() {
        init_test("outcome_delivers_value");
        let job: Job<u32> = Job::new();
        let mut fut = job.outcome();
        assert!(poll_once(&mut fut).is_pending());
        assert!(job.complete(42));
        match poll_once(&mut fut) {
            Poll::Ready(Outcome::Completed(v)) => {
                crate::assert_with_log!(v == 42, "outcome value", 42u32, v);
            }
            other => panic!("expected completed outcome, got {other:?}"),
        }
        crate::test_complete!("outcome_delivers_value");
    }

    #[test]
    fn dropping_join_removes_waiter() {
        init_test("dropping_join_removes_waiter");
        let job: Job<u32> = Job::new();
        {
            let mut join = job.join();
            assert!(poll_once(&mut join).is_pending());
        }
        // The job itself is unaffected by the abandoned wait.
        crate::assert_with_log!(job.is_active(), "job still active", true, job.is_active());
        assert!(job.complete(1));
        crate::test_complete!("dropping_join_removes_waiter");
    }
}
