//! Scenario testing framework for deterministic simulation tests.
//!
//! A scenario wires one [`Connection`](busline_core::Connection) to a
//! [`ScriptedBroker`](crate::ScriptedBroker) over a simulated link, runs the
//! handshake, and hands the resulting [`World`] to a mandatory oracle.

mod builder;
pub mod oracle;
mod world;

pub use builder::{RunnableScenario, Scenario};
pub use oracle::OracleFn;
pub use world::World;
