//! Manual clock implementing the core `Environment` trait.

use std::{cell::Cell, rc::Rc, time::Duration};

use busline_core::env::Environment;

/// Simulation environment with virtual time.
///
/// Time starts at zero and only moves when [`SimEnv::advance`] is called,
/// either by the test or by a [`SimEventBase`](crate::SimEventBase) that
/// was given the clock. Clones share the same clock.
#[derive(Debug, Clone, Default)]
pub struct SimEnv {
    now: Rc<Cell<Duration>>,
}

impl SimEnv {
    /// Create a clock at time zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `duration`
    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get().saturating_add(duration));
    }

    /// Virtual time since creation
    pub fn elapsed(&self) -> Duration {
        self.now.get()
    }
}

impl Environment for SimEnv {
    type Instant = Duration;

    fn now(&self) -> Duration {
        self.now.get()
    }
}
