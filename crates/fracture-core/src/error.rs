//! Error types for the fracture pipeline.
//!
//! Errors are split by where they surface:
//! - [`AdjustmentError`]: a unit's content contradicts connection state
//! - [`PipelineError`]: anything a layer can hit while processing one unit
//! - [`TransportError`]: the byte channel underneath the stack
//! - [`StackError`]: failures that abort a whole send or receive
//! - [`ConfigError`]: a connection configuration the pipeline cannot run
//!
//! Parse, adjustment and crypto errors are attached to the layer result that
//! produced them. Only transport failures and configuration errors abort an
//! action outright.

use std::io;

use fracture_proto::ProtocolError;
use thiserror::Error;

use crate::{crypto::CryptoError, layer::LayerKind};

/// A unit's content is inconsistent with the current connection state.
///
/// State already mutated by the same unit before the inconsistency was
/// detected is not rolled back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdjustmentError {
    /// A field references a value the connection cannot use
    #[error("{field} value {value} is not supported: {reason}")]
    Unsupported {
        /// Field that carried the value
        field: &'static str,
        /// Offending value, formatted
        value: String,
        /// Why it cannot be used
        reason: String,
    },

    /// A unit arrived in a state where it makes no sense
    #[error("{unit} is inconsistent with connection state: {reason}")]
    Inconsistent {
        /// Kind of unit
        unit: &'static str,
        /// What is inconsistent
        reason: String,
    },

    /// The crypto collaborator could not derive keys or verify data
    #[error("crypto collaborator failed: {0}")]
    Crypto(#[from] CryptoError),

    /// A field the effect needs could not be resolved or re-encoded
    #[error("unit could not be read back: {0}")]
    Encoding(#[from] ProtocolError),
}

/// Anything that can go wrong while a layer processes one unit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Decoding or encoding failed
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Effects could not be applied
    #[error(transparent)]
    Adjustment(#[from] AdjustmentError),

    /// Record or packet protection failed
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The unit or hints handed to the layer are unusable
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    /// Returns true if the error means the caller's script is broken rather
    /// than the peer's data being odd.
    ///
    /// Fatal errors abort the current action; the rest are recorded on the
    /// layer result and processing continues.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::Protocol(
                    ProtocolError::UnresolvedValue(_) | ProtocolError::ValueOutOfRange { .. }
                )
        )
    }
}

/// Failures of the underlying byte channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The socket reported an error
    #[error("I/O error ({kind:?}): {message}")]
    Io {
        /// Error kind reported by the OS
        kind: io::ErrorKind,
        /// Error message
        message: String,
    },

    /// The peer closed the channel before enough bytes arrived
    #[error("end of stream after {available} of {expected} bytes")]
    Eof {
        /// Bytes requested
        expected: usize,
        /// Bytes that did arrive (and were pushed back)
        available: usize,
    },

    /// The read deadline passed before enough bytes arrived
    #[error("timed out after {available} of {expected} bytes")]
    TimedOut {
        /// Bytes requested
        expected: usize,
        /// Bytes that did arrive (and were pushed back)
        available: usize,
    },

    /// The channel was closed locally
    #[error("channel is closed")]
    Closed,
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::Io { kind: err.kind(), message: err.to_string() }
    }
}

/// Failures that abort a whole Layer Stack send or receive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    /// The transport channel failed
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// A layer hit a fatal error
    #[error("{layer} layer aborted: {source}")]
    Layer {
        /// Layer that failed
        layer: LayerKind,
        /// What went wrong
        #[source]
        source: PipelineError,
    },

    /// The layer configurations do not fit the stack
    #[error("stack configuration error: {0}")]
    Configuration(String),
}

/// Invalid connection configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field has a value the pipeline cannot operate with
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it is invalid
        reason: String,
    },
}
