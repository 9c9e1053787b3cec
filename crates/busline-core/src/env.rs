//! Clock abstraction for reply deadlines.
//!
//! `wait_for_reply` has no deadline of its own. Callers that want one use
//! [`Connection::wait_for_reply_within`], which reads time through an
//! [`Environment`] instead of calling `std::time::Instant::now()` directly.
//! This keeps deadline logic deterministic under simulation:
//!
//! - `SimEnv` (busline-harness): manual clock advanced by the test
//! - [`SystemEnv`]: the real monotonic clock
//!
//! # Invariants
//!
//! - Monotonicity: `env.now()` must never go backwards
//!
//! [`Connection::wait_for_reply_within`]: crate::connection::Connection::wait_for_reply_within

use std::time::{Duration, Instant};

/// Source of time for deadline checks.
pub trait Environment {
    /// Type representing a point in time.
    ///
    /// Must support:
    /// - `Copy` - Lightweight to pass around
    /// - `Ord` - Can be compared (for timeout logic)
    /// - `Sub<Output = Duration>` - Can compute elapsed time
    type Instant: Copy + Ord + std::ops::Sub<Output = Duration>;

    /// Returns the current time.
    ///
    /// Subsequent calls must return times >= previous calls.
    fn now(&self) -> Self::Instant;
}

/// Production environment backed by [`std::time::Instant`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create the system environment
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }
}
