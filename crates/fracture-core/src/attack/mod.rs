//! Malformed-unit generators for attack campaigns.
//!
//! A generator only builds units and traces. Running them, one connection
//! per vector, and comparing the resulting stack results is left to the
//! caller.

pub mod padding_oracle;

use fracture_proto::tls::{CipherSuite, ProtocolVersion};
use thiserror::Error;

pub use self::padding_oracle::{PaddingOracleVector, VectorKind, generate};

/// Parameters a generator cannot build vectors for.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorError {
    /// The suite does not use CBC record protection
    #[error("cipher suite {0:?} is not a CBC suite")]
    NotCbc(CipherSuite),

    /// The version has no CBC record layout to attack
    #[error("protocol version {0:?} is not supported")]
    UnsupportedVersion(ProtocolVersion),
}
