//! Scenario builder API.
//!
//! Provides a declarative API for constructing handshake scenarios that
//! enforce the Oracle Pattern.

use std::rc::Rc;

use busline_core::{
    Connection, ConnectionConfig, EventBase, ServerAddress,
    mechanism::{Mechanism, MechanismRegistry},
    transport::StreamTransport,
};

use crate::{
    broker::ScriptedBroker,
    scenario::{OracleFn, World},
    sim_event::SimEventBase,
    sim_network::SimNetwork,
};

/// Scenario builder.
///
/// Configure the broker, the client configuration and optionally an explicit
/// candidate list, then add an oracle.
pub struct Scenario {
    broker: ScriptedBroker,
    address: ServerAddress,
    config: ConnectionConfig,
    registry: Option<MechanismRegistry>,
    candidates: Option<Vec<Box<dyn Mechanism>>>,
}

impl Scenario {
    /// Create a scenario against `broker` with default configuration.
    pub fn new(broker: ScriptedBroker) -> Self {
        Self {
            broker,
            address: ServerAddress::new("sim:name=broker"),
            config: ConnectionConfig::default(),
            registry: None,
            candidates: None,
        }
    }

    /// Server address the connection is opened on.
    pub fn with_address(mut self, address: &str) -> Self {
        self.address = ServerAddress::new(address);
        self
    }

    /// Configure the client connection.
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolve mechanism names with `registry` instead of
    /// [`ConnectionConfig::registry`].
    pub fn with_registry(mut self, registry: MechanismRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Authenticate with exactly these mechanisms, skipping name resolution
    /// and discovery.
    pub fn with_candidates(mut self, candidates: Vec<Box<dyn Mechanism>>) -> Self {
        self.candidates = Some(candidates);
        self
    }

    /// Set the oracle function and return a runnable scenario.
    ///
    /// The oracle is mandatory - you cannot run a scenario without
    /// verification.
    pub fn oracle(self, oracle: OracleFn) -> RunnableScenario {
        RunnableScenario { scenario: self, oracle }
    }
}

/// A scenario with an oracle function that can be executed.
pub struct RunnableScenario {
    scenario: Scenario,
    oracle: OracleFn,
}

impl RunnableScenario {
    /// Execute the scenario.
    ///
    /// 1. Connect a fresh simulated link to the broker
    /// 2. Run the handshake (explicit candidates, or the configured names, or
    ///    discovery)
    /// 3. Invoke the oracle on the resulting world
    ///
    /// A failed handshake is not a scenario failure by itself; the oracle
    /// decides.
    pub fn run(self) -> Result<(), String> {
        let Scenario { broker, address, config, registry, candidates } = self.scenario;

        let network = SimNetwork::new();
        let socket = network.connect(broker);
        let event_base = Rc::new(SimEventBase::new(network.clone()));
        let shared: Rc<dyn EventBase> = event_base.clone();

        let registry = registry.unwrap_or_else(|| config.registry());
        let mut connection =
            Connection::new(address, Box::new(StreamTransport::new(socket)), shared)
                .with_config(config);

        let handshake = match candidates {
            Some(candidates) => connection.authenticate(candidates),
            None => connection.handshake(&registry),
        };

        let mut world = World::new(network, event_base, connection, handshake);
        (self.oracle)(&mut world)
    }
}
