//! Test utilities for jobsync.
//!
//! This module provides shared helpers for unit and integration tests:
//! - Consistent logging initialization (active with `tracing-integration`)
//! - Phase/section macros for readable test output
//! - Minimal future drivers (`poll_once`, `block_on`) so tests can
//!   exercise the wait futures without a scheduler
//!
//! # Example
//! ```
//! use jobsync::test_utils::{block_on, init_test_logging};
//! use jobsync::Job;
//!
//! init_test_logging();
//! let job: Job<u32> = Job::new();
//! job.complete(7);
//! block_on(job.join());
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once. A no-op unless the
/// `tracing-integration` feature is enabled.
pub fn init_test_logging() {
    #[cfg(feature = "tracing-integration")]
    {
        use std::sync::Once;
        static INIT_LOGGING: Once = Once::new();
        INIT_LOGGING.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_max_level(tracing::Level::TRACE)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .try_init();
        });
    }
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        $crate::tracing_compat::info!(phase = %$name, "========================================");
        $crate::tracing_compat::info!(phase = %$name, "TEST PHASE: {}", $name);
        $crate::tracing_compat::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        $crate::tracing_compat::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        $crate::tracing_compat::info!(test = %$name, "test completed successfully: {}", $name);
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        {
            $crate::tracing_compat::debug!(
                expected = ?$expected,
                actual = ?$actual,
                "Asserting: {}",
                $msg
            );
            assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
        }
    };
}

struct NoopWaker;

impl Wake for NoopWaker {
    fn wake(self: Arc<Self>) {}
    fn wake_by_ref(self: &Arc<Self>) {}
}

/// Returns a waker that does nothing when woken.
#[must_use]
pub fn noop_waker() -> Waker {
    Waker::from(Arc::new(NoopWaker))
}

/// Polls a future once with a no-op waker.
pub fn poll_once<F>(fut: &mut F) -> Poll<F::Output>
where
    F: Future + Unpin,
{
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    Pin::new(fut).poll(&mut cx)
}

/// Drives a future to completion by spin-polling, yielding the thread
/// between polls. For tests only; there is no scheduler behind it.
pub fn block_on<F: Future>(f: F) -> F::Output {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    let mut pinned = Box::pin(f);
    loop {
        match pinned.as_mut().poll(&mut cx) {
            Poll::Ready(value) => return value,
            Poll::Pending => std::thread::yield_now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_once_drives_ready_future() {
        init_test_logging();
        crate::test_phase!("poll_once_drives_ready_future");
        let mut fut = std::future::ready(5);
        let polled = poll_once(&mut fut);
        crate::assert_with_log!(polled == Poll::Ready(5), "ready value", Poll::Ready(5), polled);
        crate::test_complete!("poll_once_drives_ready_future");
    }

    #[test]
    fn block_on_completes_pending_future() {
        init_test_logging();
        crate::test_phase!("block_on_completes_pending_future");
        struct YieldOnce(bool);
        impl Future for YieldOnce {
            type Output = u32;
            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<u32> {
                if self.0 {
                    Poll::Ready(11)
                } else {
                    self.0 = true;
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
            }
        }
        let value = block_on(YieldOnce(false));
        crate::assert_with_log!(value == 11, "value", 11u32, value);
        crate::test_complete!("block_on_completes_pending_future");
    }
}
