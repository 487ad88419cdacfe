//! Fracture message-processing core
//!
//! This crate drives wire units from `fracture-proto` through a layered
//! pipeline against a live peer. Every field of every unit can be pinned to
//! an operator-chosen value; the pipeline computes what is left unset and
//! never assumes a resolved value is the one it would have computed.
//!
//! # Architecture
//!
//! ```text
//!      ┌──────────────────────────────┐
//!      │ WorkflowExecutor             │  ordered Send / Receive actions
//!      └──────────────────────────────┘
//!                     │
//!      ┌──────────────────────────────┐
//!      │ LayerStack                   │  one result per layer per action
//!      │  Http / TlsMessage           │
//!      │  Record / QuicFrame          │
//!      │  QuicPacket                  │
//!      └──────────────────────────────┘
//!         │                        │
//! ┌────────────────┐     ┌─────────────────┐
//! │ ConnectionState│     │ TransportChannel│
//! │ - negotiation  │     │ - TCP / UDP     │
//! │ - keys, epochs │     │ - turmoil (sim) │
//! │ - seeded RNG   │     │ - timeouts      │
//! └────────────────┘     └─────────────────┘
//! ```
//!
//! # Key Principles
//!
//! - Explicit wins: compute-defaults only fills unset or computed fields
//! - Errors stay local: parse, adjustment and crypto failures are attached
//!   to the layer result that hit them; only transport and configuration
//!   failures abort an action
//! - Deterministic: a seeded connection produces the same bytes every run
//!
//! # Modules
//!
//! - [`unit`]: the wire unit capability trait
//! - [`units`]: its implementations for the TLS, QUIC and HTTP catalog
//! - [`pipeline`]: the send and receive stage driver for one unit
//! - [`layer`]: the five protocol layers
//! - [`stack`]: layers composed over a transport channel
//! - [`transport`]: stream and datagram channels
//! - [`workflow`]: traces and their executor
//! - [`attack`]: malformed-unit generators
//! - [`state`]: per-connection state and configuration
//! - [`crypto`]: the cryptographic collaborator boundary
//! - [`error`]: error types

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod attack;
pub mod crypto;
pub mod error;
pub mod layer;
pub mod pipeline;
pub mod stack;
pub mod state;
pub mod transport;
pub mod unit;
pub mod units;
pub mod workflow;

pub use crypto::{CryptoBackend, CryptoError, NullCrypto};
pub use error::{AdjustmentError, ConfigError, PipelineError, StackError, TransportError};
pub use layer::{Chunk, Layer, LayerConfiguration, LayerHints, LayerKind, LayerProcessingResult};
pub use stack::{LayerStack, LayerStackProcessingResult, ReceiveEnd, StopCondition};
pub use state::{ConnectionConfig, ConnectionState, Direction, Role};
pub use transport::{SocketState, TransportChannel};
pub use unit::{ConfiguredUnit, UnitKind, WireUnit};
pub use units::Unit;
pub use workflow::{Action, FailurePolicy, TraceStatus, WorkflowExecutor, WorkflowTrace};
