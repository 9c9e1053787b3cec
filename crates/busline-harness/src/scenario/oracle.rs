//! Oracle functions for scenario verification.
//!
//! Oracles run at the end of a scenario. They receive the world mutably so
//! they can keep driving the connection (send, wait, drain) before checking
//! their invariants.

use busline_core::{ConnectionError, ConnectionState};

use crate::scenario::World;

/// Oracle function type.
///
/// Returns `Ok(())` if all invariants hold, `Err(message)` otherwise.
pub type OracleFn = Box<dyn FnOnce(&mut World) -> Result<(), String>>;

/// The handshake succeeded and the connection is active.
pub fn authenticated() -> OracleFn {
    Box::new(|world| {
        if let Err(error) = world.handshake_result() {
            return Err(format!("handshake failed: {error}"));
        }
        match world.connection().state() {
            ConnectionState::Active => Ok(()),
            state => Err(format!("connection should be Active, got {state:?}")),
        }
    })
}

/// The handshake failed with exactly `expected`.
pub fn failed_with(expected: ConnectionError) -> OracleFn {
    Box::new(move |world| match world.handshake_result() {
        Err(error) if *error == expected => Ok(()),
        Err(error) => Err(format!("expected {expected:?}, got {error:?}")),
        Ok(()) => Err(format!("expected {expected:?}, but the handshake succeeded")),
    })
}

/// The recorded server GUID equals `expected`.
pub fn server_uuid_is(expected: &'static str) -> OracleFn {
    Box::new(move |world| match world.connection().server_uuid() {
        Some(uuid) if uuid == expected => Ok(()),
        other => Err(format!("server uuid should be {expected}, got {other:?}")),
    })
}

/// File-descriptor passing was negotiated as `expected`.
pub fn unix_fd_passing(expected: bool) -> OracleFn {
    Box::new(move |world| {
        let actual = world.connection().unix_fd_passing_supported();
        if actual == expected {
            Ok(())
        } else {
            Err(format!("unix fd passing should be {expected}, got {actual}"))
        }
    })
}

/// The client sent exactly these handshake commands, in order.
pub fn client_lines(expected: &'static [&'static str]) -> OracleFn {
    Box::new(move |world| {
        let sent = world.client_lines();
        if sent == expected {
            Ok(())
        } else {
            Err(format!("client lines should be {expected:?}, got {sent:?}"))
        }
    })
}

/// Combine multiple oracles into one.
pub fn all_of(oracles: Vec<OracleFn>) -> OracleFn {
    Box::new(move |world| {
        for oracle in oracles {
            oracle(world)?;
        }
        Ok(())
    })
}
