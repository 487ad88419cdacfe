//! Deterministic simulation harness for fracture workflows.
//!
//! This crate runs workflow traces against scripted peers inside a turmoil
//! simulation, so a whole connection (handshake, attack vector, peer
//! reaction) replays identically from a seed and under virtual time.
//!
//! - [`sim_transport`]: turmoil sockets behind the core transport channels
//! - [`toy_crypto`]: a reversible crypto backend with real padding and MAC
//!   checks
//! - [`peer`]: a turmoil host answering through a behaviour closure
//! - [`scenario`]: the builder that runs one trace and enforces an oracle

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod peer;
pub mod scenario;
pub mod sim_transport;
pub mod toy_crypto;

pub use peer::{AlertPolicy, PeerEvent, PeerLog, PeerReply, ScriptedPeer};
pub use sim_transport::{Preset, SimDatagram, SimStreamChannel};
pub use toy_crypto::ToyCrypto;

/// Installs a test-friendly `tracing` subscriber.
///
/// Filtering follows `RUST_LOG`. Calling this more than once is harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
