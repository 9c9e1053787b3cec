//! Multi-address connection construction.
//!
//! [`open`] walks the candidate addresses in order and returns the first one
//! that connects and authenticates. A transport that fails at any point after
//! it was connected is closed exactly once before the next address is tried:
//! it is owned by a [`Connection`] from the moment it exists, and
//! [`Connection::close`] only ever touches it once.

use std::{io, rc::Rc};

use crate::{
    address::ServerAddress,
    config::{ConnectionConfig, FailurePolicy},
    connection::Connection,
    error::ConnectionError,
    event::EventBase,
    mechanism::MechanismRegistry,
    transport::Transport,
};

/// Builds a transport for one address.
///
/// Socket construction (address families, paths, TCP resolution) belongs to
/// the application. Any `FnMut(&ServerAddress) -> io::Result<Box<dyn
/// Transport>>` is a connector.
pub trait Connector {
    /// Connect to `address`
    fn connect(&mut self, address: &ServerAddress) -> io::Result<Box<dyn Transport>>;
}

impl<F> Connector for F
where
    F: FnMut(&ServerAddress) -> io::Result<Box<dyn Transport>>,
{
    fn connect(&mut self, address: &ServerAddress) -> io::Result<Box<dyn Transport>> {
        self(address)
    }
}

/// Connect and authenticate to the first working address.
///
/// Returns `Ok(None)` only under [`FailurePolicy::ReturnNone`].
///
/// # Errors
///
/// - [`ConnectionError::Config`] if `config` is invalid (nothing is
///   attempted)
/// - [`ConnectionError::NoServerReachable`] when every address fails under
///   [`FailurePolicy::Error`]
pub fn open<C: Connector + ?Sized>(
    addresses: &[ServerAddress],
    connector: &mut C,
    event_base: &Rc<dyn EventBase>,
    config: &ConnectionConfig,
    registry: &MechanismRegistry,
) -> Result<Option<Connection>, ConnectionError> {
    config.validate()?;

    let mut last_error = String::from("no addresses given");

    for (attempt, address) in addresses.iter().enumerate() {
        match attempt_address(address, connector, event_base, config, registry) {
            Ok(connection) => return Ok(Some(connection)),
            Err(error) => {
                tracing::warn!(%address, attempt, %error, "server address failed");
                last_error = error.to_string();
            },
        }
    }

    match config.on_failure {
        FailurePolicy::Error => Err(ConnectionError::NoServerReachable {
            attempts: addresses.len(),
            last_error,
        }),
        FailurePolicy::ReturnNone => Ok(None),
    }
}

fn attempt_address<C: Connector + ?Sized>(
    address: &ServerAddress,
    connector: &mut C,
    event_base: &Rc<dyn EventBase>,
    config: &ConnectionConfig,
    registry: &MechanismRegistry,
) -> Result<Connection, ConnectionError> {
    let transport = connector.connect(address)?;
    let mut connection = Connection::new(address.clone(), transport, Rc::clone(event_base))
        .with_config(config.clone());

    if let Err(error) = connection.handshake(registry) {
        if let Err(close_error) = connection.close() {
            tracing::debug!(%address, %close_error, "close after failed handshake");
        }
        return Err(error);
    }

    Ok(connection)
}
