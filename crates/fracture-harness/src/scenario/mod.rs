//! Scenario framework for simulated workflow runs.
//!
//! A scenario pairs one client trace with one [`ScriptedPeer`] inside a
//! turmoil simulation. Running it always ends with an oracle: there is no
//! way to execute a scenario without saying what must hold afterwards.
//!
//! [`ScriptedPeer`]: crate::peer::ScriptedPeer

mod builder;
pub mod oracle;
pub mod traces;
mod world;

pub use builder::{CLIENT_HOST, PEER_HOST, RunnableScenario, Scenario};
pub use oracle::OracleFn;
pub use world::World;
