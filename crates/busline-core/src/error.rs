//! Error types for the busline connection core.
//!
//! This module provides strongly-typed errors for the two stateful layers:
//! - Authentication errors (handshake reached an unrecoverable branch)
//! - Connection errors (transport, framing, reply waiting, construction)
//!
//! plus [`ConfigError`] for settings the handshake cannot use.
//!
//! I/O errors are flattened to strings at the boundary so every error stays
//! `Clone + PartialEq`, which the tests and the read handler rely on.

use std::{io, time::Duration};

use busline_proto::ProtocolError;
use thiserror::Error;

use crate::auth::AuthState;

/// A second, different GUID was reported for an already identified server.
///
/// This is a warning, not an abort: the caller may keep the old value or
/// continue with [`Connection::replace_server_uuid`].
///
/// [`Connection::replace_server_uuid`]: crate::connection::Connection::replace_server_uuid
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("server uuid changed from {previous} to {proposed}")]
pub struct DuplicateServerUuid {
    /// Value already recorded on the connection
    pub previous: String,
    /// Value the server just reported
    pub proposed: String,
}

/// Invalid connection configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A candidate mechanism name is blank
    #[error("mechanism name at index {index} is empty")]
    EmptyMechanismName {
        /// Position in the candidate list
        index: usize,
    },
}

/// Errors that end an authentication attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Server answered with something other than `REJECTED` while the client
    /// was waiting to be rejected, or broke the capability negotiation
    #[error("unexpected handshake reply: {command} {argument}")]
    Authentication {
        /// Command keyword of the offending reply
        command: String,
        /// Argument of the offending reply
        argument: String,
    },

    /// Every candidate mechanism was tried without success
    #[error("no authentication mechanisms left")]
    NoMechanismsLeft,

    /// Server GUID changed and the configuration forbids overwriting it
    #[error(transparent)]
    DuplicateServerUuid(#[from] DuplicateServerUuid),

    /// Event fed to the state machine in a state that cannot accept it
    #[error("event {event} is not valid in state {state:?}")]
    UnexpectedEvent {
        /// State when the event arrived
        state: AuthState,
        /// Event name
        event: &'static str,
    },
}

/// Errors that can occur while using a connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Underlying transport failed
    #[error("transport error: {0}")]
    Transport(String),

    /// Peer sent malformed data, or a message could not be encoded
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Handshake failed
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Configuration rejected before connecting
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Connection was closed locally
    #[error("connection closed")]
    Closed,

    /// Peer closed the stream
    #[error("connection closed by peer")]
    PeerClosed,

    /// Operation needs an authenticated connection with I/O activated
    #[error("connection is not active")]
    NotActive,

    /// Handshake already completed on this connection
    #[error("connection is already authenticated")]
    AlreadyAuthenticated,

    /// Serial 0 never identifies a request
    #[error("serial 0 is reserved for messages that expect no reply")]
    InvalidSerial,

    /// No reply arrived before the caller's deadline
    #[error("no reply to serial {serial} after {elapsed:?}")]
    ReplyTimeout {
        /// Serial being waited on
        serial: u32,
        /// How long we waited
        elapsed: Duration,
    },

    /// Every candidate address failed
    #[error("no server reachable after {attempts} attempt(s): {last_error}")]
    NoServerReachable {
        /// Number of addresses tried
        attempts: usize,
        /// Failure of the last address tried
        last_error: String,
    },
}

impl ConnectionError {
    /// Returns true if this error is transient and may succeed on retry.
    ///
    /// Only deadline expiry qualifies. Transport and protocol failures leave
    /// the connection unusable.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectionError::ReplyTimeout { .. })
    }
}

/// Convert io::Error to ConnectionError (for transport errors)
impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        ConnectionError::Transport(err.to_string())
    }
}
