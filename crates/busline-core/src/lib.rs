//! Busline connection core
//!
//! This crate contains the stateful half of a message-bus client connection:
//! the authentication handshake and the message pump that correlates replies
//! with the requests that caused them.
//!
//! # Architecture: "The Hollow Shell"
//!
//! The handshake is pure logic; everything with side effects sits behind a
//! trait that the application (or the simulation harness) provides:
//!
//! ```text
//!      ┌──────────────────────────────────┐
//!      │ busline-core                     │
//!      │ - auth::transition (pure)        │
//!      │ - Authenticator (sans-IO driver) │
//!      │ - Connection (pending queue)     │
//!      └──────────────────────────────────┘
//!         ↓              ↓             ↓
//! ┌─────────────┐ ┌─────────────┐ ┌─────────────┐
//! │ Transport   │ │ EventBase   │ │ WireCodec   │
//! │ - lines     │ │ - register  │ │ - encode    │
//! │ - frames    │ │ - dispatch  │ │ - decode    │
//! └─────────────┘ └─────────────┘ └─────────────┘
//! ```
//!
//! # Key Principles
//!
//! - One Owner: A [`connection::Connection`] is driven from one execution
//!   context. The event base's read handler is the only other mutator and runs
//!   synchronously inside a dispatch pass.
//! - No Shared Globals: The serial counter and pending queue are plain fields.
//! - Cooperative Waiting: `dispatch_once` is the only suspension point. To wait
//!   on many connections at once, give each its own owner
//!   ([`handle::ConnectionHandle`]).
//!
//! # Modules
//!
//! - [`auth`]: Handshake transition function and driver
//! - [`mechanism`]: Authentication mechanism contract and registry
//! - [`connection`]: Connection object (serials, send, reply correlation)
//! - [`open`]: Multi-address connection construction
//! - [`transport`]: Transport and socket abstractions
//! - [`codec`]: Wire codec contract and the default frame codec
//! - [`event`]: Event base contract
//! - [`env`]: Clock abstraction for reply deadlines
//! - [`config`]: Connection configuration
//! - [`handle`]: Channel-based owner for async callers
//! - [`error`]: Error types

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod address;
pub mod auth;
pub mod codec;
pub mod config;
pub mod connection;
pub mod env;
pub mod error;
pub mod event;
pub mod handle;
pub mod mechanism;
pub mod open;
pub mod serial;
pub mod transport;

pub use address::ServerAddress;
pub use config::{ConnectionConfig, DuplicateUuidPolicy, FailurePolicy};
pub use codec::{FrameCodec, WireCodec};
pub use connection::{Connection, ConnectionState};
pub use env::{Environment, SystemEnv};
pub use error::{AuthError, ConfigError, ConnectionError, DuplicateServerUuid};
pub use event::{EventBase, PollingEventBase, ReadOutcome};
pub use handle::ConnectionHandle;
pub use mechanism::{Mechanism, MechanismRegistry, MechanismStep};
pub use open::{Connector, open};
pub use transport::{Descriptor, StreamTransport, Transport};
