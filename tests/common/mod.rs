//! Shared helpers for integration tests.

#![allow(dead_code)]

use jobsync::test_utils::init_test_logging;
use std::time::{Duration, Instant};

/// Initialize logging and announce the test phase.
pub fn init_test(name: &str) {
    init_test_logging();
    jobsync::test_phase!(name);
}

/// Spins until `cond` holds, panicking after five seconds.
pub fn wait_until(description: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("condition '{description}' not reached within 5s");
}
