//! World state for scenario execution.

use std::rc::Rc;

use busline_core::{Connection, ConnectionError, transport::Descriptor};

use crate::{sim_event::SimEventBase, sim_network::SimNetwork};

/// One connection, its simulated link, and how the handshake went.
pub struct World {
    network: SimNetwork,
    event_base: Rc<SimEventBase>,
    connection: Connection,
    handshake: Result<(), ConnectionError>,
}

impl World {
    pub(crate) fn new(
        network: SimNetwork,
        event_base: Rc<SimEventBase>,
        connection: Connection,
        handshake: Result<(), ConnectionError>,
    ) -> Self {
        Self { network, event_base, connection, handshake }
    }

    /// The connection under test
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Mutable access for driving further exchanges
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// Outcome of the handshake
    pub fn handshake_result(&self) -> &Result<(), ConnectionError> {
        &self.handshake
    }

    /// Simulated network carrying the link
    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    /// Event base the connection is registered with
    pub fn event_base(&self) -> &SimEventBase {
        &self.event_base
    }

    /// Descriptor of the link
    pub fn descriptor(&self) -> Descriptor {
        self.connection.descriptor()
    }

    /// Full link transcript (both directions)
    pub fn transcript(&self) -> Vec<String> {
        self.network.transcript(self.descriptor())
    }

    /// Transcript joined with newlines, for snapshots
    pub fn transcript_text(&self) -> String {
        self.transcript().join("\n")
    }

    /// Everything the client sent, without the `C: ` prefix and without
    /// `<...>` markers such as the credentials byte
    pub fn client_lines(&self) -> Vec<String> {
        self.transcript()
            .iter()
            .filter_map(|entry| entry.strip_prefix("C: "))
            .filter(|line| !line.starts_with('<'))
            .map(str::to_string)
            .collect()
    }
}
