//! Fracture wire model
//!
//! This crate holds the byte-level half of fracture: field values that can be
//! computed or overridden, and a catalog of TLS, QUIC and HTTP/1.1 units that
//! decode from and encode to bytes. It knows nothing about connection state
//! or I/O; those live in `fracture-core`.
//!
//! # Overrides
//!
//! Every wire field is an [`Overridable`]. Encoding reads only the resolved
//! value (explicit override first, computed default second), so a unit can
//! be made to carry any value an operator chooses, including values that
//! contradict its own length prefixes.
//!
//! # Decoding contract
//!
//! - Decoders never panic on hostile input.
//! - Stream-framed top-level units (records, handshake messages, HTTP
//!   messages) report [`ProtocolError::Incomplete`] for a valid prefix.
//! - Every other malformation is a [`ProtocolError::Parse`] carrying the
//!   offset reached.
//! - Decoded values are stored as computed, so re-encoding a well-formed
//!   unit without overrides reproduces its input.
//!
//! # Modules
//!
//! - [`value`]: the overridable field wrapper
//! - [`tls`]: records, handshake messages, alerts, ChangeCipherSpec
//! - [`quic`]: variable-length integers, frames, packet headers
//! - [`http`]: HTTP/1.1 messages
//! - [`codec`]: shared byte reading and writing helpers

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod codec;
pub mod errors;
pub mod http;
pub mod quic;
pub mod tls;
pub mod value;

pub use errors::{ProtocolError, Result};
pub use value::Overridable;

/// Units that can be decoded from the front of a byte buffer.
///
/// `Context` carries whatever the format needs beyond the bytes themselves
/// (for example the record content type a TLS message arrived in).
pub trait Decode: Sized {
    /// Extra decoding input
    type Context;

    /// Decodes one unit, returning it and the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Incomplete`] or [`ProtocolError::Parse`].
    fn decode_with(bytes: &[u8], context: &Self::Context) -> Result<(Self, usize)>;
}

impl Decode for tls::Record {
    type Context = ();

    fn decode_with(bytes: &[u8], _: &()) -> Result<(Self, usize)> {
        Self::decode(bytes)
    }
}

impl Decode for tls::TlsMessage {
    type Context = tls::ContentType;

    fn decode_with(bytes: &[u8], content_type: &tls::ContentType) -> Result<(Self, usize)> {
        Self::decode(*content_type, bytes)
    }
}

impl Decode for quic::Frame {
    type Context = ();

    fn decode_with(bytes: &[u8], _: &()) -> Result<(Self, usize)> {
        Self::decode(bytes)
    }
}

impl Decode for http::HttpMessage {
    type Context = ();

    fn decode_with(bytes: &[u8], _: &()) -> Result<(Self, usize)> {
        Self::decode(bytes)
    }
}
