//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use facelive_rs::pipeline::{Pollable, Scheduler};
use std::time::Duration;

/// Generous upper bound for thread round trips in tests
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Pump `target` with a manual scheduler until `done` holds.
pub fn pump_until<P, F>(target: &mut P, done: F) -> bool
where
    P: Pollable + ?Sized,
    F: FnMut(&P) -> bool,
{
    Scheduler::manual().run_until(target, done, test_timeout())
}

/// Keep pumping `target` for `window`, so late work has a chance to show up.
pub fn settle<P: Pollable + ?Sized>(target: &mut P, window: Duration) {
    Scheduler::manual().run_until(target, |_| false, window);
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}
