//! The protocol-unit contract.
//!
//! Every message the pipeline handles, at any layer, implements
//! [`WireUnit`]. Sending runs three steps in order:
//!
//! ```text
//! compute-defaults ──▶ encode ──▶ apply-effects(Outbound)
//!  (read-only state)   (pure)      (mutates state)
//! ```
//!
//! Receiving skips compute-defaults: the decoded unit already has every
//! field, so it is only checked against and applied to the state.
//!
//! Compute-defaults fills fields that are still unset or computed and never
//! touches explicit ones. It is idempotent for a fixed state, except that
//! random fields (hello randoms, explicit IVs) are only drawn while unset.

use std::fmt;

use bytes::Bytes;
use fracture_proto::{
    ProtocolError,
    quic::PacketType,
    tls::HandshakeType,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{AdjustmentError, PipelineError},
    state::{ConnectionState, Direction, PrepareContext},
    units::Unit,
};

/// Kind of a unit, as used by receive stop conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitKind {
    /// TLS record
    Record,
    /// Handshake message of the given type
    Handshake(HandshakeType),
    /// Alert
    Alert,
    /// ChangeCipherSpec
    ChangeCipherSpec,
    /// Application data
    ApplicationData,
    /// QUIC frame with the given base type
    QuicFrame(u64),
    /// QUIC packet of the given type
    QuicPacket(PacketType),
    /// HTTP message
    Http,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Record => f.write_str("Record"),
            Self::Handshake(ty) => write!(f, "Handshake({ty})"),
            Self::Alert => f.write_str("Alert"),
            Self::ChangeCipherSpec => f.write_str("ChangeCipherSpec"),
            Self::ApplicationData => f.write_str("ApplicationData"),
            Self::QuicFrame(code) => write!(f, "QuicFrame({code:#x})"),
            Self::QuicPacket(ty) => write!(f, "QuicPacket({ty:?})"),
            Self::Http => f.write_str("Http"),
        }
    }
}

/// Behaviour shared by every protocol unit.
pub trait WireUnit: fmt::Debug + Send {
    /// Kind used for stop conditions and logging.
    fn kind(&self) -> UnitKind;

    /// Fills unset and computed fields from connection state.
    ///
    /// Explicit fields are left alone. The state is only read; randomness is
    /// drawn through `ctx`.
    ///
    /// # Errors
    ///
    /// Fails when a value cannot be derived, for example a record body that
    /// cannot be protected with the active keys.
    fn compute_defaults(&mut self, ctx: &mut PrepareContext<'_>) -> Result<(), PipelineError>;

    /// Serializes the unit. Never modifies it.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnresolvedValue`] for a field that is still
    /// unset, or [`ProtocolError::ValueOutOfRange`] for one that does not
    /// fit its wire width.
    fn encode(&self) -> Result<Bytes, ProtocolError>;

    /// Applies the unit's consequences to the state.
    ///
    /// Failures are reported but do not roll back what was already applied.
    ///
    /// # Errors
    ///
    /// Returns [`AdjustmentError`] when the unit contradicts the state.
    fn apply_effects(
        &self,
        state: &mut ConnectionState,
        direction: Direction,
    ) -> Result<(), AdjustmentError>;

    /// Whether the unit obliges the peer to acknowledge it.
    fn ack_eliciting(&self) -> bool {
        false
    }

    /// Whether encoding a decoded unit reproduces the bytes it came from.
    fn preserves_encoding(&self) -> bool {
        true
    }
}

/// A unit together with whether compute-defaults should run before sending.
///
/// Units sent verbatim are encoded exactly as configured: a field left unset
/// makes the send fail rather than being filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredUnit {
    /// The unit
    pub unit: Unit,
    /// Run compute-defaults before encoding
    pub should_prepare: bool,
}

impl ConfiguredUnit {
    /// A unit whose defaults will be computed.
    pub fn prepared(unit: impl Into<Unit>) -> Self {
        Self { unit: unit.into(), should_prepare: true }
    }

    /// A unit sent exactly as configured.
    pub fn verbatim(unit: impl Into<Unit>) -> Self {
        Self { unit: unit.into(), should_prepare: false }
    }
}

impl From<Unit> for ConfiguredUnit {
    fn from(unit: Unit) -> Self {
        Self::prepared(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_display_registry_names() {
        assert_eq!(
            UnitKind::Handshake(HandshakeType::SERVER_HELLO_DONE).to_string(),
            "Handshake(SERVER_HELLO_DONE)"
        );
        assert_eq!(UnitKind::QuicFrame(0x06).to_string(), "QuicFrame(0x6)");
    }
}
