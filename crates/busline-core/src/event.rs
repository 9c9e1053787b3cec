//! Event base contract.
//!
//! The connection does not own a reactor. It registers one read handler per
//! transport descriptor and asks the event base to run single dispatch passes
//! while it waits for a reply:
//!
//! ```text
//! Connection ──(Rc, non-owning)──> EventBase ──(by descriptor)──> ReadHandler
//!     │                                                              │
//!     └──────────── owns Rc<RefCell<channel>> <──── Weak ────────────┘
//! ```
//!
//! The handler only holds a weak reference to the connection's channel, and
//! the registration is removed when the connection closes. Nothing forms an
//! ownership cycle.
//!
//! # Implementations
//!
//! - [`PollingEventBase`]: invokes every handler in turn and sleeps after a
//!   round in which nothing was ready. Enough for a thread that owns a single
//!   connection.
//! - `SimEventBase` (busline-harness): delivers in-flight data one pass at a
//!   time, deterministically.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fmt, io, thread,
    time::Duration,
};

use crate::transport::Descriptor;

/// What a read handler did during one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Nothing was ready
    Idle,
    /// Consumed input
    Progress,
    /// Handler is finished and should be deregistered
    Done,
}

/// Read-readiness callback registered for one descriptor.
pub type ReadHandler = Box<dyn FnMut() -> ReadOutcome>;

/// Readiness dispatcher shared by every connection on one thread.
///
/// Methods take `&self` because handlers run inside [`EventBase::dispatch_once`]
/// and may register or deregister other descriptors while they do.
pub trait EventBase {
    /// Register `handler` for read readiness on `descriptor`, replacing any
    /// previous registration.
    fn register_read_handler(&self, descriptor: Descriptor, handler: ReadHandler) -> io::Result<()>;

    /// Remove the registration for `descriptor`. Unknown descriptors are
    /// ignored.
    fn deregister(&self, descriptor: Descriptor);

    /// Run one dispatch pass over the registered handlers.
    ///
    /// A pass may end without any handler making progress, after waiting a
    /// bounded time for readiness. Callers loop, so a deadline can be
    /// checked between passes.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing can ever become ready (e.g. no handlers
    /// are registered) or the underlying poller fails.
    fn dispatch_once(&self) -> io::Result<()>;
}

/// [`EventBase`] that polls every handler once per pass.
///
/// A pass in which no handler made progress sleeps for the idle interval
/// before returning.
pub struct PollingEventBase {
    handlers: RefCell<BTreeMap<Descriptor, ReadHandler>>,
    /// Descriptor whose handler is currently running
    running: Cell<Option<Descriptor>>,
    /// Set when the running handler's descriptor is deregistered
    running_cancelled: Cell<bool>,
    idle_interval: Duration,
}

impl PollingEventBase {
    /// Default pause between idle rounds
    pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(1);

    /// Create an empty event base
    pub fn new() -> Self {
        Self::with_idle_interval(Self::DEFAULT_IDLE_INTERVAL)
    }

    /// Create an empty event base that sleeps `idle_interval` after a round
    /// in which no handler made progress
    pub fn with_idle_interval(idle_interval: Duration) -> Self {
        Self {
            handlers: RefCell::new(BTreeMap::new()),
            running: Cell::new(None),
            running_cancelled: Cell::new(false),
            idle_interval,
        }
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.borrow().len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.borrow().is_empty()
    }

    /// Invoke every handler once. Returns true if any made progress or
    /// finished.
    fn poll_round(&self) -> bool {
        let descriptors: Vec<Descriptor> = self.handlers.borrow().keys().copied().collect();
        let mut ready = false;

        for descriptor in descriptors {
            let Some(mut handler) = self.handlers.borrow_mut().remove(&descriptor) else {
                continue;
            };
            self.running.set(Some(descriptor));
            self.running_cancelled.set(false);

            let outcome = handler();
            ready |= outcome != ReadOutcome::Idle;

            self.running.set(None);
            let cancelled = self.running_cancelled.replace(false);
            if outcome == ReadOutcome::Done {
                tracing::debug!(descriptor = descriptor.0, "read handler finished");
            } else if !cancelled {
                self.handlers.borrow_mut().entry(descriptor).or_insert(handler);
            }
        }

        ready
    }
}

impl Default for PollingEventBase {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PollingEventBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingEventBase")
            .field("descriptors", &self.handlers.borrow().keys().collect::<Vec<_>>())
            .field("idle_interval", &self.idle_interval)
            .finish()
    }
}

impl EventBase for PollingEventBase {
    fn register_read_handler(&self, descriptor: Descriptor, handler: ReadHandler) -> io::Result<()> {
        self.handlers.borrow_mut().insert(descriptor, handler);
        Ok(())
    }

    fn deregister(&self, descriptor: Descriptor) {
        self.handlers.borrow_mut().remove(&descriptor);
        if self.running.get() == Some(descriptor) {
            self.running_cancelled.set(true);
        }
    }

    fn dispatch_once(&self) -> io::Result<()> {
        if self.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no read handlers registered"));
        }

        if !self.poll_round() {
            thread::sleep(self.idle_interval);
        }
        Ok(())
    }
}
