//! Deterministic simulation harness for busline connection testing.
//!
//! Everything here runs on one thread with no real sockets and no real time:
//!
//! - [`SimNetwork`] / [`SimSocket`]: in-memory links whose far end is a
//!   [`Peer`], usually a [`ScriptedBroker`]
//! - [`SimEventBase`]: delivers in-flight frames one dispatch pass at a time
//! - [`SimEnv`]: manual clock for reply deadlines
//! - [`scenario`]: handshake scenarios verified by oracles

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod broker;
pub mod scenario;
pub mod sim_env;
pub mod sim_event;
pub mod sim_network;

pub use broker::{FrameResponder, ScriptedBroker};
pub use sim_env::SimEnv;
pub use sim_event::SimEventBase;
pub use sim_network::{Peer, PeerIo, SimNetwork, SimSocket, describe};
