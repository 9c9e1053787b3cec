//! Deterministic event base over a [`SimNetwork`].

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    io,
    time::Duration,
};

use busline_core::{
    event::{EventBase, ReadHandler, ReadOutcome},
    transport::Descriptor,
};

use crate::{sim_env::SimEnv, sim_network::SimNetwork};

/// Event base that advances the simulation one step per dispatch pass.
///
/// Each [`EventBase::dispatch_once`] call:
///
/// 1. delivers one in-flight chunk per link ([`SimNetwork::deliver_pass`])
/// 2. invokes the handler of every readable descriptor, in descriptor order
/// 3. if nothing was delivered and no handler ran, advances the attached
///    clock by one tick, or fails with `WouldBlock` when no clock is attached
///
/// Without a clock an idle pass is an error rather than a hang, so a test
/// that waits for a reply that will never come fails fast.
pub struct SimEventBase {
    network: SimNetwork,
    handlers: RefCell<BTreeMap<Descriptor, ReadHandler>>,
    running: Cell<Option<Descriptor>>,
    running_cancelled: Cell<bool>,
    clock: Option<(SimEnv, Duration)>,
    passes: Cell<u64>,
}

impl SimEventBase {
    /// Event base over `network` with no clock
    pub fn new(network: SimNetwork) -> Self {
        Self {
            network,
            handlers: RefCell::new(BTreeMap::new()),
            running: Cell::new(None),
            running_cancelled: Cell::new(false),
            clock: None,
            passes: Cell::new(0),
        }
    }

    /// Advance `env` by `tick` on every idle pass
    #[must_use]
    pub fn with_clock(mut self, env: SimEnv, tick: Duration) -> Self {
        self.clock = Some((env, tick));
        self
    }

    /// Number of dispatch passes run so far
    pub fn passes(&self) -> u64 {
        self.passes.get()
    }

    /// Whether a handler is registered for `descriptor`
    pub fn is_registered(&self, descriptor: Descriptor) -> bool {
        self.handlers.borrow().contains_key(&descriptor)
    }

    fn run_handler(&self, descriptor: Descriptor) -> bool {
        let Some(mut handler) = self.handlers.borrow_mut().remove(&descriptor) else {
            return false;
        };
        self.running.set(Some(descriptor));
        self.running_cancelled.set(false);

        let outcome = handler();

        self.running.set(None);
        let cancelled = self.running_cancelled.replace(false);
        if outcome != ReadOutcome::Done && !cancelled {
            self.handlers.borrow_mut().entry(descriptor).or_insert(handler);
        }
        true
    }
}

impl EventBase for SimEventBase {
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
        self.passes.set(self.passes.get() + 1);

        let delivered = self.network.deliver_pass();

        let ready: Vec<Descriptor> = self
            .handlers
            .borrow()
            .keys()
            .copied()
            .filter(|descriptor| self.network.is_readable(*descriptor))
            .collect();

        let mut ran = false;
        for descriptor in ready {
            ran |= self.run_handler(descriptor);
        }

        if delivered || ran {
            return Ok(());
        }

        match &self.clock {
            Some((env, tick)) => {
                env.advance(*tick);
                Ok(())
            },
            None => Err(io::Error::new(io::ErrorKind::WouldBlock, "simulation idle: nothing in flight")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use busline_core::env::Environment;

    use super::*;
    use crate::sim_network::{Peer, PeerIo};

    struct Silent;

    impl Peer for Silent {
        fn receive(&mut self, _bytes: &[u8], _io: &mut PeerIo) {}
    }

    #[test]
    fn idle_pass_without_clock_fails() {
        let base = SimEventBase::new(SimNetwork::new());
        let err = base.dispatch_once().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(base.passes(), 1);
    }

    #[test]
    fn idle_pass_with_clock_advances_time() {
        let env = SimEnv::new();
        let base = SimEventBase::new(SimNetwork::new()).with_clock(env.clone(), Duration::from_millis(10));

        base.dispatch_once().unwrap();
        base.dispatch_once().unwrap();
        assert_eq!(env.now(), Duration::from_millis(20));
    }

    #[test]
    fn handlers_run_only_when_readable() {
        let network = SimNetwork::new();
        let socket = network.connect(Silent);
        let descriptor = busline_core::transport::Socket::descriptor(&socket);
        let base = SimEventBase::new(network.clone());

        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        base.register_read_handler(
            descriptor,
            Box::new(move || {
                counter.set(counter.get() + 1);
                ReadOutcome::Progress
            }),
        )
        .unwrap();

        assert!(base.dispatch_once().is_err());
        assert_eq!(calls.get(), 0);

        network.inject_bytes(descriptor, b"x");
        base.dispatch_once().unwrap();
        assert_eq!(calls.get(), 1);
        assert!(base.is_registered(descriptor));

        base.deregister(descriptor);
        assert!(!base.is_registered(descriptor));
    }

    #[test]
    fn reregistered_descriptor_stays_live() {
        let network = SimNetwork::new();
        let socket = network.connect(Silent);
        let descriptor = busline_core::transport::Socket::descriptor(&socket);
        let base = SimEventBase::new(network.clone());

        base.register_read_handler(descriptor, Box::new(|| ReadOutcome::Progress)).unwrap();
        base.deregister(descriptor);
        base.register_read_handler(descriptor, Box::new(|| ReadOutcome::Progress)).unwrap();

        network.inject_bytes(descriptor, b"x");
        base.dispatch_once().unwrap();
        assert!(base.is_registered(descriptor));
        assert!(!base.running_cancelled.get());
    }
}
