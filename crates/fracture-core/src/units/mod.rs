//! [`WireUnit`] implementations for the wire catalog.
//!
//! Each submodule teaches one family of wire types how to derive defaults
//! from connection state and how to feed back into it. [`Unit`] is the
//! closed set of units a layer configuration can carry.

mod http;
mod quic;
mod record;
mod tls;

use bytes::Bytes;
use fracture_proto::{
    ProtocolError,
    http::HttpMessage,
    quic::{Frame, Packet, PacketSpace},
    tls::{Alert, ApplicationData, ChangeCipherSpec, HandshakeMessage, Record, TlsMessage},
};

pub use self::{
    quic::QuicFrame,
    record::{mac_input, open_record},
};
use crate::{
    error::{AdjustmentError, PipelineError},
    state::{ConnectionState, Direction, PrepareContext},
    unit::{UnitKind, WireUnit},
};

/// Any unit the pipeline can send or receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    /// Message carried in TLS records
    Tls(TlsMessage),
    /// TLS record
    Record(Record),
    /// QUIC frame within a packet number space
    QuicFrame(QuicFrame),
    /// QUIC packet
    QuicPacket(Packet),
    /// HTTP/1.1 message
    Http(HttpMessage),
}

impl Unit {
    /// The TLS message, if this is one.
    pub fn as_tls(&self) -> Option<&TlsMessage> {
        match self {
            Self::Tls(message) => Some(message),
            _ => None,
        }
    }

    /// The handshake message, if this is one.
    pub fn as_handshake(&self) -> Option<&HandshakeMessage> {
        match self {
            Self::Tls(TlsMessage::Handshake(message)) => Some(message),
            _ => None,
        }
    }

    /// The alert, if this is one.
    pub fn as_alert(&self) -> Option<&Alert> {
        match self {
            Self::Tls(TlsMessage::Alert(alert)) => Some(alert),
            _ => None,
        }
    }

    /// The record, if this is one.
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Record(record) => Some(record),
            _ => None,
        }
    }

    /// The QUIC frame, if this is one.
    pub fn as_quic_frame(&self) -> Option<&QuicFrame> {
        match self {
            Self::QuicFrame(frame) => Some(frame),
            _ => None,
        }
    }

    /// The QUIC packet, if this is one.
    pub fn as_quic_packet(&self) -> Option<&Packet> {
        match self {
            Self::QuicPacket(packet) => Some(packet),
            _ => None,
        }
    }

    /// The HTTP message, if this is one.
    pub fn as_http(&self) -> Option<&HttpMessage> {
        match self {
            Self::Http(message) => Some(message),
            _ => None,
        }
    }
}

macro_rules! dispatch {
    ($self:expr, $unit:ident => $body:expr) => {
        match $self {
            Unit::Tls($unit) => $body,
            Unit::Record($unit) => $body,
            Unit::QuicFrame($unit) => $body,
            Unit::QuicPacket($unit) => $body,
            Unit::Http($unit) => $body,
        }
    };
}

impl WireUnit for Unit {
    fn kind(&self) -> UnitKind {
        dispatch!(self, unit => unit.kind())
    }

    fn compute_defaults(&mut self, ctx: &mut PrepareContext<'_>) -> Result<(), PipelineError> {
        dispatch!(self, unit => unit.compute_defaults(ctx))
    }

    fn encode(&self) -> Result<Bytes, ProtocolError> {
        dispatch!(self, unit => WireUnit::encode(unit))
    }

    fn apply_effects(
        &self,
        state: &mut ConnectionState,
        direction: Direction,
    ) -> Result<(), AdjustmentError> {
        dispatch!(self, unit => unit.apply_effects(state, direction))
    }

    fn ack_eliciting(&self) -> bool {
        dispatch!(self, unit => unit.ack_eliciting())
    }

    fn preserves_encoding(&self) -> bool {
        dispatch!(self, unit => unit.preserves_encoding())
    }
}

impl From<TlsMessage> for Unit {
    fn from(message: TlsMessage) -> Self {
        Self::Tls(message)
    }
}

impl From<HandshakeMessage> for Unit {
    fn from(message: HandshakeMessage) -> Self {
        Self::Tls(TlsMessage::Handshake(message))
    }
}

impl From<Alert> for Unit {
    fn from(alert: Alert) -> Self {
        Self::Tls(TlsMessage::Alert(alert))
    }
}

impl From<ChangeCipherSpec> for Unit {
    fn from(ccs: ChangeCipherSpec) -> Self {
        Self::Tls(TlsMessage::ChangeCipherSpec(ccs))
    }
}

impl From<ApplicationData> for Unit {
    fn from(data: ApplicationData) -> Self {
        Self::Tls(TlsMessage::ApplicationData(data))
    }
}

impl From<Record> for Unit {
    fn from(record: Record) -> Self {
        Self::Record(record)
    }
}

impl From<QuicFrame> for Unit {
    fn from(frame: QuicFrame) -> Self {
        Self::QuicFrame(frame)
    }
}

impl From<Packet> for Unit {
    fn from(packet: Packet) -> Self {
        Self::QuicPacket(packet)
    }
}

impl From<HttpMessage> for Unit {
    fn from(message: HttpMessage) -> Self {
        Self::Http(message)
    }
}

/// Shorthand for a frame in the Initial space.
impl From<Frame> for Unit {
    fn from(frame: Frame) -> Self {
        Self::QuicFrame(QuicFrame::new(PacketSpace::Initial, frame))
    }
}
