//! Layers: framing between wire units and raw bytes.
//!
//! A [`Layer`] turns the units configured for it, plus the byte chunks
//! handed down by the layer above, into chunks for the layer below. On
//! receive it does the reverse: chunks from below are deframed into units,
//! each unit's effects are applied, and any payload meant for the layer
//! above is passed up as new chunks.
//!
//! ```text
//!            send                          receive
//!   units + chunks from above      chunks delivered upward
//!             │                              ▲
//!        ┌────▼──────────────────────────────┴────┐
//!        │ Layer (frame / deframe, buffer partial) │
//!        └────┬──────────────────────────────▲────┘
//!             ▼                              │
//!      chunks for the layer below     chunks from below
//! ```
//!
//! Parse and adjustment failures never escape a layer: they are recorded in
//! the layer's [`LayerProcessingResult`]. Only fatal failures (unresolved
//! fields, values that do not fit their wire width) abort a send.

mod http;
mod quic_frame;
mod quic_packet;
mod record;
mod tls_message;

use std::fmt;

use bytes::Bytes;
use fracture_proto::{quic::PacketSpace, tls::ContentType};
use serde::{Deserialize, Serialize};

pub use self::{
    http::HttpLayer, quic_frame::QuicFrameLayer, quic_packet::QuicPacketLayer,
    record::RecordLayer, tls_message::TlsMessageLayer,
};
use crate::{
    error::PipelineError,
    state::ConnectionState,
    unit::{ConfiguredUnit, UnitKind, WireUnit},
    units::Unit,
};

/// Identifies a layer within a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    /// HTTP/1.1 messages
    Http,
    /// TLS handshake, alert, ChangeCipherSpec and application data messages
    TlsMessage,
    /// TLS records
    Record,
    /// QUIC frames
    QuicFrame,
    /// QUIC packets
    QuicPacket,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Http => "http",
            Self::TlsMessage => "tls-message",
            Self::Record => "record",
            Self::QuicFrame => "quic-frame",
            Self::QuicPacket => "quic-packet",
        };
        f.write_str(name)
    }
}

/// Bytes passed between adjacent layers, with the framing context the
/// lower layer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Payload
    pub data: Bytes,
    /// TLS content type of the payload
    pub content_type: Option<ContentType>,
    /// QUIC packet number space the payload belongs to
    pub space: Option<PacketSpace>,
    /// QUIC stream carrying the payload
    pub stream_id: Option<u64>,
    /// Whether the payload contains an ack-eliciting QUIC frame
    pub ack_eliciting: bool,
}

impl Chunk {
    /// Creates a chunk with no framing context.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            content_type: None,
            space: None,
            stream_id: None,
            ack_eliciting: false,
        }
    }

    /// Tags the chunk with a TLS content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = Some(content_type);
        self
    }

    /// Tags the chunk with a QUIC packet number space.
    #[must_use]
    pub fn in_space(mut self, space: PacketSpace) -> Self {
        self.space = Some(space);
        self
    }

    /// Tags the chunk with a QUIC stream.
    #[must_use]
    pub fn on_stream(mut self, stream_id: u64) -> Self {
        self.stream_id = Some(stream_id);
        self
    }

    /// Marks the chunk as ack-eliciting.
    #[must_use]
    pub fn ack_eliciting(mut self, ack_eliciting: bool) -> Self {
        self.ack_eliciting = ack_eliciting;
        self
    }
}

/// Layer-specific framing instructions for one send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerHints {
    /// Content type for chunks that carry none
    pub content_type: Option<ContentType>,
    /// Largest record plaintext, overriding the negotiated value
    pub max_fragment_length: Option<usize>,
    /// Explicit record plaintext sizes, consumed in order before the
    /// maximum fragment length applies
    pub record_lengths: Vec<usize>,
    /// Packet number space for chunks that carry none
    pub packet_space: Option<PacketSpace>,
    /// Carry upper data in STREAM frames on this stream instead of CRYPTO
    pub stream_id: Option<u64>,
    /// Coalesce packets into as few datagrams as possible
    pub coalesce: bool,
}

/// Units and hints submitted to one layer for one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerConfiguration {
    /// Target layer
    pub layer: LayerKind,
    /// Units to send, in order
    pub units: Vec<ConfiguredUnit>,
    /// Framing hints
    pub hints: LayerHints,
}

impl LayerConfiguration {
    /// Creates an empty configuration for `layer`.
    pub fn new(layer: LayerKind) -> Self {
        Self { layer, units: Vec::new(), hints: LayerHints::default() }
    }

    /// Adds one unit that will be prepared before encoding.
    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<Unit>) -> Self {
        self.units.push(ConfiguredUnit::prepared(unit));
        self
    }

    /// Adds configured units.
    #[must_use]
    pub fn with_units(mut self, units: impl IntoIterator<Item = ConfiguredUnit>) -> Self {
        self.units.extend(units);
        self
    }

    /// Replaces the hints.
    #[must_use]
    pub fn with_hints(mut self, hints: LayerHints) -> Self {
        self.hints = hints;
        self
    }
}

/// Outcome of one layer's part of a send or receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerProcessingResult {
    /// Layer that produced the result
    pub layer: LayerKind,
    /// Units sent or decoded, in wire order
    pub units: Vec<Unit>,
    /// Bytes taken from the layer below
    pub bytes_consumed: usize,
    /// Bytes handed to the layer below
    pub bytes_produced: usize,
    /// Non-fatal failures, in the order they occurred
    pub errors: Vec<PipelineError>,
    /// Bytes held back waiting for the rest of a unit
    pub buffered: usize,
}

impl LayerProcessingResult {
    /// Creates an empty result for `layer`.
    pub fn new(layer: LayerKind) -> Self {
        Self {
            layer,
            units: Vec::new(),
            bytes_consumed: 0,
            bytes_produced: 0,
            errors: Vec::new(),
            buffered: 0,
        }
    }

    /// Folds a later result of the same layer into this one.
    pub fn merge(&mut self, other: Self) {
        self.units.extend(other.units);
        self.bytes_consumed += other.bytes_consumed;
        self.bytes_produced += other.bytes_produced;
        self.errors.extend(other.errors);
        self.buffered = other.buffered;
    }

    /// Kinds of the units in this result.
    pub fn kinds(&self) -> Vec<UnitKind> {
        self.units.iter().map(WireUnit::kind).collect()
    }

    pub(crate) fn record_unit(&mut self, unit: impl Into<Unit>) {
        self.units.push(unit.into());
    }

    pub(crate) fn record_error(&mut self, error: impl Into<PipelineError>) {
        let error = error.into();
        tracing::debug!(layer = %self.layer, %error, "layer error recorded");
        self.errors.push(error);
    }
}

/// Input to [`Layer::send`].
#[derive(Debug, Default)]
pub struct SendRequest {
    /// Units configured for this layer
    pub units: Vec<ConfiguredUnit>,
    /// Framing hints for this layer
    pub hints: LayerHints,
    /// Chunks produced by the layer above
    pub chunks: Vec<Chunk>,
}

/// Output of one layer step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerOutput {
    /// What the layer did
    pub result: LayerProcessingResult,
    /// Chunks for the next layer (below on send, above on receive)
    pub chunks: Vec<Chunk>,
}

impl LayerOutput {
    pub(crate) fn new(result: LayerProcessingResult, chunks: Vec<Chunk>) -> Self {
        Self { result, chunks }
    }
}

/// One framing layer of a [`LayerStack`](crate::stack::LayerStack).
pub trait Layer: Send + fmt::Debug {
    /// Which layer this is.
    fn kind(&self) -> LayerKind;

    /// Frames configured units and upper chunks into chunks for the layer
    /// below.
    ///
    /// # Errors
    ///
    /// Returns only fatal pipeline errors; everything else is recorded in
    /// the output's result.
    fn send(
        &mut self,
        request: SendRequest,
        state: &mut ConnectionState,
    ) -> Result<LayerOutput, PipelineError>;

    /// Deframes chunks from the layer below.
    ///
    /// Incomplete units stay buffered for the next call.
    fn receive(&mut self, chunks: Vec<Chunk>, state: &mut ConnectionState) -> LayerOutput;

    /// Bytes currently held back waiting for more input.
    fn buffered(&self) -> usize;
}

/// Sends one configured unit, recording non-fatal failures in `result`.
///
/// Returns the encoded bytes, or `None` if a non-fatal failure prevented
/// encoding.
///
/// # Errors
///
/// Returns fatal failures.
pub(crate) fn send_configured<U: WireUnit + ?Sized>(
    unit: &mut U,
    should_prepare: bool,
    state: &mut ConnectionState,
    result: &mut LayerProcessingResult,
) -> Result<Option<Bytes>, PipelineError> {
    match crate::pipeline::send(unit, should_prepare, state) {
        Ok(out) => {
            if let Some(adjustment) = out.adjustment {
                result.record_error(adjustment);
            }
            result.bytes_produced += out.bytes.len();
            Ok(Some(out.bytes))
        },
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            result.record_error(err);
            Ok(None)
        },
    }
}

/// Error for a unit handed to a layer that cannot frame it.
pub(crate) fn misrouted(layer: LayerKind, unit: &Unit) -> PipelineError {
    PipelineError::Configuration(format!("{} unit configured for the {layer} layer", unit.kind()))
}

/// Layer a unit belongs to when configured directly.
pub(crate) fn unit_layer(unit: &Unit) -> LayerKind {
    match unit {
        Unit::Tls(_) => LayerKind::TlsMessage,
        Unit::Record(_) => LayerKind::Record,
        Unit::QuicFrame(_) => LayerKind::QuicFrame,
        Unit::QuicPacket(_) => LayerKind::QuicPacket,
        Unit::Http(_) => LayerKind::Http,
    }
}
