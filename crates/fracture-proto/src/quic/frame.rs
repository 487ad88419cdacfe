//! QUIC frames (RFC 9000 Section 19).
//!
//! Only the frames needed to carry a handshake and stream data are modelled.
//! Unknown frame types are a parse error: without a definition there is no
//! way to find where the frame ends.

use bitflags::bitflags;
use bytes::{BufMut, Bytes};
use serde::{Deserialize, Serialize};

use crate::{
    codec::{Reader, owned},
    errors::{ProtocolError, Result},
    quic::varint,
    value::Overridable,
};

/// Frame type code points
pub mod frame_type {
    /// PADDING
    pub const PADDING: u64 = 0x00;
    /// PING
    pub const PING: u64 = 0x01;
    /// ACK without ECN counts
    pub const ACK: u64 = 0x02;
    /// ACK with ECN counts
    pub const ACK_ECN: u64 = 0x03;
    /// CRYPTO
    pub const CRYPTO: u64 = 0x06;
    /// First STREAM type; the low three bits carry [`super::StreamFlags`]
    pub const STREAM: u64 = 0x08;
    /// MAX_DATA
    pub const MAX_DATA: u64 = 0x10;
    /// CONNECTION_CLOSE raised by the transport
    pub const CONNECTION_CLOSE: u64 = 0x1c;
    /// CONNECTION_CLOSE raised by the application
    pub const CONNECTION_CLOSE_APP: u64 = 0x1d;
    /// HANDSHAKE_DONE
    pub const HANDSHAKE_DONE: u64 = 0x1e;
}

bitflags! {
    /// Low bits of a STREAM frame type
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct StreamFlags: u8 {
        /// Final frame of the stream
        const FIN = 0x01;
        /// Length field present
        const LEN = 0x02;
        /// Offset field present
        const OFF = 0x04;
    }
}

/// One additional ACK range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRange {
    /// Unacknowledged packets preceding the range, minus one
    pub gap: u64,
    /// Acknowledged packets in the range, minus one
    pub length: u64,
}

/// ECN counters of an ACK_ECN frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcnCounts {
    /// ECT(0) count
    pub ect0: u64,
    /// ECT(1) count
    pub ect1: u64,
    /// ECN-CE count
    pub ce: u64,
}

/// ACK frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckFrame {
    /// Largest packet number acknowledged
    pub largest_acknowledged: Overridable<u64>,
    /// Encoded ACK delay
    pub ack_delay: Overridable<u64>,
    /// Declared number of additional ranges
    pub range_count: Overridable<u64>,
    /// Packets acknowledged below the largest, minus one
    pub first_range: Overridable<u64>,
    /// Additional ranges
    pub ranges: Overridable<Vec<AckRange>>,
    /// ECN counters; present selects the ACK_ECN type
    pub ecn: Option<EcnCounts>,
}

/// CRYPTO frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CryptoFrame {
    /// Offset in the crypto stream
    pub offset: Overridable<u64>,
    /// Declared data length
    pub length: Overridable<u64>,
    /// Handshake bytes
    pub data: Overridable<Bytes>,
}

impl CryptoFrame {
    /// Creates a frame carrying `data` with offset and length left to
    /// compute-defaults.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: Overridable::computed(data.into()), ..Self::default() }
    }
}

/// STREAM frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFrame {
    /// OFF/LEN/FIN bits of the frame type
    pub flags: Overridable<StreamFlags>,
    /// Stream identifier
    pub stream_id: Overridable<u64>,
    /// Offset in the stream; only written when OFF is set
    pub offset: Overridable<u64>,
    /// Declared length; only written when LEN is set
    pub length: Overridable<u64>,
    /// Stream bytes
    pub data: Overridable<Bytes>,
    /// Request FIN when flags are computed
    pub fin: bool,
}

impl StreamFrame {
    /// Creates a frame on `stream_id` carrying `data`.
    pub fn new(stream_id: u64, data: impl Into<Bytes>) -> Self {
        Self {
            stream_id: Overridable::computed(stream_id),
            data: Overridable::computed(data.into()),
            ..Self::default()
        }
    }
}

/// CONNECTION_CLOSE frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    /// Application close (0x1d) rather than transport close (0x1c)
    pub application: bool,
    /// Error code
    pub error_code: Overridable<u64>,
    /// Offending frame type; transport close only
    pub frame_type: Overridable<u64>,
    /// Declared reason length
    pub reason_length: Overridable<u64>,
    /// Reason phrase
    pub reason: Overridable<Bytes>,
}

/// QUIC frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Run of PADDING bytes
    Padding {
        /// Number of zero bytes
        length: usize,
    },
    /// PING
    Ping,
    /// ACK / ACK_ECN
    Ack(AckFrame),
    /// CRYPTO
    Crypto(CryptoFrame),
    /// STREAM
    Stream(StreamFrame),
    /// MAX_DATA
    MaxData {
        /// Connection-level flow control limit
        maximum: Overridable<u64>,
    },
    /// CONNECTION_CLOSE
    ConnectionClose(ConnectionCloseFrame),
    /// HANDSHAKE_DONE
    HandshakeDone,
}

impl Frame {
    /// Base frame type, with STREAM, ACK and CONNECTION_CLOSE variants
    /// collapsed to their first code point.
    #[must_use]
    pub fn kind_code(&self) -> u64 {
        match self {
            Self::Padding { .. } => frame_type::PADDING,
            Self::Ping => frame_type::PING,
            Self::Ack(_) => frame_type::ACK,
            Self::Crypto(_) => frame_type::CRYPTO,
            Self::Stream(_) => frame_type::STREAM,
            Self::MaxData { .. } => frame_type::MAX_DATA,
            Self::ConnectionClose(_) => frame_type::CONNECTION_CLOSE,
            Self::HandshakeDone => frame_type::HANDSHAKE_DONE,
        }
    }

    /// Returns true if receipt of the frame obliges the peer to acknowledge
    /// (RFC 9002 Section 2).
    #[must_use]
    pub fn ack_eliciting(&self) -> bool {
        !matches!(self, Self::Padding { .. } | Self::Ack(_) | Self::ConnectionClose(_))
    }

    /// Writes the frame.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        match self {
            Self::Padding { length } => {
                dst.put_bytes(0, *length);
            },
            Self::Ping => varint::encode(dst, "frame.type", frame_type::PING)?,
            Self::HandshakeDone => varint::encode(dst, "frame.type", frame_type::HANDSHAKE_DONE)?,
            Self::MaxData { maximum } => {
                varint::encode(dst, "frame.type", frame_type::MAX_DATA)?;
                varint::encode(dst, "max_data.maximum", maximum.value("max_data.maximum")?)?;
            },
            Self::Ack(ack) => {
                let ty = if ack.ecn.is_some() { frame_type::ACK_ECN } else { frame_type::ACK };
                varint::encode(dst, "frame.type", ty)?;
                varint::encode(dst, "ack.largest", ack.largest_acknowledged.value("ack.largest")?)?;
                varint::encode(dst, "ack.delay", ack.ack_delay.value("ack.delay")?)?;
                varint::encode(dst, "ack.range_count", ack.range_count.value("ack.range_count")?)?;
                varint::encode(dst, "ack.first_range", ack.first_range.value("ack.first_range")?)?;
                for range in ack.ranges.resolve("ack.ranges")? {
                    varint::encode(dst, "ack.gap", range.gap)?;
                    varint::encode(dst, "ack.range_length", range.length)?;
                }
                if let Some(ecn) = &ack.ecn {
                    varint::encode(dst, "ack.ect0", ecn.ect0)?;
                    varint::encode(dst, "ack.ect1", ecn.ect1)?;
                    varint::encode(dst, "ack.ce", ecn.ce)?;
                }
            },
            Self::Crypto(crypto) => {
                varint::encode(dst, "frame.type", frame_type::CRYPTO)?;
                varint::encode(dst, "crypto.offset", crypto.offset.value("crypto.offset")?)?;
                varint::encode(dst, "crypto.length", crypto.length.value("crypto.length")?)?;
                dst.put_slice(crypto.data.resolve("crypto.data")?);
            },
            Self::Stream(stream) => {
                let flags = stream.flags.value("stream.flags")?;
                let ty = frame_type::STREAM | u64::from(flags.bits() & 0x07);
                varint::encode(dst, "frame.type", ty)?;
                varint::encode(dst, "stream.id", stream.stream_id.value("stream.id")?)?;
                if flags.contains(StreamFlags::OFF) {
                    varint::encode(dst, "stream.offset", stream.offset.value("stream.offset")?)?;
                }
                if flags.contains(StreamFlags::LEN) {
                    varint::encode(dst, "stream.length", stream.length.value("stream.length")?)?;
                }
                dst.put_slice(stream.data.resolve("stream.data")?);
            },
            Self::ConnectionClose(close) => {
                let ty = if close.application {
                    frame_type::CONNECTION_CLOSE_APP
                } else {
                    frame_type::CONNECTION_CLOSE
                };
                varint::encode(dst, "frame.type", ty)?;
                let error_code = close.error_code.value("close.error_code")?;
                varint::encode(dst, "close.error_code", error_code)?;
                if !close.application {
                    let frame_type = close.frame_type.value("close.frame_type")?;
                    varint::encode(dst, "close.frame_type", frame_type)?;
                }
                varint::encode(
                    dst,
                    "close.reason_length",
                    close.reason_length.value("close.reason_length")?,
                )?;
                dst.put_slice(close.reason.resolve("close.reason")?);
            },
        }
        Ok(())
    }

    /// Decodes one frame from the front of `bytes`.
    ///
    /// A frame never spans packets, so truncation is a parse error rather
    /// than [`ProtocolError::Incomplete`].
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut r = Reader::new(bytes);
        let ty = r.varint("frame.type")?;

        let frame = match ty {
            frame_type::PADDING => {
                let run = r.rest().iter().take_while(|b| **b == 0).count();
                r.bytes(run, "padding")?;
                Self::Padding { length: run + 1 }
            },
            frame_type::PING => Self::Ping,
            frame_type::HANDSHAKE_DONE => Self::HandshakeDone,
            frame_type::MAX_DATA => {
                Self::MaxData { maximum: Overridable::computed(r.varint("max_data.maximum")?) }
            },
            frame_type::ACK | frame_type::ACK_ECN => Self::Ack(decode_ack(&mut r, ty)?),
            frame_type::CRYPTO => {
                let offset = r.varint("crypto.offset")?;
                let length = r.varint("crypto.length")?;
                let data = r.bytes(as_len(length, &r)?, "crypto.data")?;
                Self::Crypto(CryptoFrame {
                    offset: Overridable::computed(offset),
                    length: Overridable::computed(length),
                    data: Overridable::computed(owned(data)),
                })
            },
            ty if (frame_type::STREAM..=frame_type::STREAM | 0x07).contains(&ty) => {
                let flags = StreamFlags::from_bits_retain((ty & 0x07) as u8);
                let stream_id = r.varint("stream.id")?;
                let offset =
                    if flags.contains(StreamFlags::OFF) { r.varint("stream.offset")? } else { 0 };
                let (length, data) = if flags.contains(StreamFlags::LEN) {
                    let length = r.varint("stream.length")?;
                    (length, r.bytes(as_len(length, &r)?, "stream.data")?)
                } else {
                    let data = r.take_rest();
                    (data.len() as u64, data)
                };
                Self::Stream(StreamFrame {
                    flags: Overridable::computed(flags),
                    stream_id: Overridable::computed(stream_id),
                    offset: Overridable::computed(offset),
                    length: Overridable::computed(length),
                    data: Overridable::computed(owned(data)),
                    fin: flags.contains(StreamFlags::FIN),
                })
            },
            frame_type::CONNECTION_CLOSE | frame_type::CONNECTION_CLOSE_APP => {
                let application = ty == frame_type::CONNECTION_CLOSE_APP;
                let error_code = r.varint("close.error_code")?;
                let frame_type = if application {
                    Overridable::Unset
                } else {
                    Overridable::computed(r.varint("close.frame_type")?)
                };
                let reason_length = r.varint("close.reason_length")?;
                let reason = r.bytes(as_len(reason_length, &r)?, "close.reason")?;
                Self::ConnectionClose(ConnectionCloseFrame {
                    application,
                    error_code: Overridable::computed(error_code),
                    frame_type,
                    reason_length: Overridable::computed(reason_length),
                    reason: Overridable::computed(owned(reason)),
                })
            },
            other => return Err(ProtocolError::parse(format!("unknown frame type {other:#x}"), 0)),
        };

        Ok((frame, r.position()))
    }
}

fn decode_ack(r: &mut Reader<'_>, ty: u64) -> Result<AckFrame> {
    let largest = r.varint("ack.largest")?;
    let delay = r.varint("ack.delay")?;
    let range_count = r.varint("ack.range_count")?;
    let first_range = r.varint("ack.first_range")?;

    // Each range needs at least two bytes; reject counts the input cannot hold
    // before allocating.
    if range_count > (r.remaining() / 2) as u64 {
        return Err(ProtocolError::parse(
            format!("ack range count {range_count} exceeds remaining input"),
            r.position(),
        ));
    }
    let mut ranges = Vec::with_capacity(range_count as usize);
    for _ in 0..range_count {
        let gap = r.varint("ack.gap")?;
        let length = r.varint("ack.range_length")?;
        ranges.push(AckRange { gap, length });
    }

    let ecn = if ty == frame_type::ACK_ECN {
        Some(EcnCounts {
            ect0: r.varint("ack.ect0")?,
            ect1: r.varint("ack.ect1")?,
            ce: r.varint("ack.ce")?,
        })
    } else {
        None
    };

    Ok(AckFrame {
        largest_acknowledged: Overridable::computed(largest),
        ack_delay: Overridable::computed(delay),
        range_count: Overridable::computed(range_count),
        first_range: Overridable::computed(first_range),
        ranges: Overridable::computed(ranges),
        ecn,
    })
}

fn as_len(length: u64, r: &Reader<'_>) -> Result<usize> {
    usize::try_from(length)
        .map_err(|_| ProtocolError::parse("length exceeds address space", r.position()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(hex_frame: &str) -> Frame {
        let bytes = hex::decode(hex_frame).unwrap();
        let (frame, used) = Frame::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());

        let mut out = Vec::new();
        frame.encode(&mut out).unwrap();
        assert_eq!(hex::encode(out), hex_frame);
        frame
    }

    #[test]
    fn crypto_frame_round_trips() {
        let frame = round_trip("0600040a0b0c0d");
        assert!(frame.ack_eliciting());
        assert_eq!(frame.kind_code(), frame_type::CRYPTO);
    }

    #[test]
    fn stream_frame_without_length_takes_rest() {
        let frame = round_trip("0904aabbcc");
        let Frame::Stream(stream) = frame else { panic!("expected stream frame") };
        assert!(stream.fin);
        assert_eq!(stream.stream_id.get(), Some(&4));
        assert_eq!(stream.data.get().map(|d| d.len()), Some(3));
    }

    #[test]
    fn ack_with_ranges_round_trips() {
        let frame = round_trip("020a0001020103");
        assert!(!frame.ack_eliciting());
    }

    #[test]
    fn padding_run_is_one_frame() {
        let (frame, used) = Frame::decode(&[0, 0, 0, 0x01]).unwrap();
        assert_eq!(frame, Frame::Padding { length: 3 });
        assert_eq!(used, 3);
    }

    #[test]
    fn transport_close_round_trips() {
        round_trip("1c0a06026869");
    }

    #[test]
    fn overrunning_length_is_parse_error() {
        let bytes = hex::decode("060010aa").unwrap();
        assert!(matches!(Frame::decode(&bytes), Err(ProtocolError::Parse { .. })));
    }

    #[test]
    fn absurd_range_count_is_rejected_before_allocation() {
        let bytes = hex::decode("0201008fffffff00").unwrap();
        assert!(matches!(Frame::decode(&bytes), Err(ProtocolError::Parse { .. })));
    }

    #[test]
    fn unknown_frame_type_is_parse_error() {
        assert!(matches!(Frame::decode(&[0x40, 0x99]), Err(ProtocolError::Parse { .. })));
    }
}
