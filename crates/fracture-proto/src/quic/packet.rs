//! QUIC packet headers (RFC 9000 Section 17).
//!
//! ```text
//! Long header:
//! +-+-+-+-+-+-+-+-+---------+--------+------+--------+------+
//! |1|1|T T|R R|P P| version | dcid   | scid | [token]| len  | pn | payload
//! +-+-+-+-+-+-+-+-+---------+--------+------+--------+------+
//!
//! Short header:
//! +-+-+-+-+-+-+-+-+------+----+---------+
//! |0|1|S|R R|K|P P| dcid | pn | payload |
//! +-+-+-+-+-+-+-+-+------+----+---------+
//! ```
//!
//! [`Packet`] holds the *unprotected* view. Header protection is described
//! by a 5-byte mask in [`PacketComputations::header_mask`]; encoding applies
//! it when set. Decoding is split in two steps because the mask depends on
//! ciphertext the header must first be parsed to locate:
//! [`peek_header`] finds the packet number offset, the caller removes
//! protection, then [`Packet::decode_unprotected`] parses the clear header.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{
    codec::{Reader, owned, put_uint},
    errors::{ProtocolError, Result},
    quic::{number, varint},
    value::Overridable,
};

/// Packet number space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PacketSpace {
    /// Initial packets
    Initial,
    /// Handshake packets
    Handshake,
    /// 0-RTT and 1-RTT packets
    Application,
}

impl PacketSpace {
    /// All spaces in order.
    pub const ALL: [Self; 3] = [Self::Initial, Self::Handshake, Self::Application];

    /// Dense index for per-space tables.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Packet type used to send data in this space.
    #[must_use]
    pub fn packet_type(self) -> PacketType {
        match self {
            Self::Initial => PacketType::Initial,
            Self::Handshake => PacketType::Handshake,
            Self::Application => PacketType::OneRtt,
        }
    }
}

/// Packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// Long header, type 0
    Initial,
    /// Long header, type 1
    ZeroRtt,
    /// Long header, type 2
    Handshake,
    /// Short header
    OneRtt,
}

impl PacketType {
    /// Returns true for long-header packets.
    #[must_use]
    pub fn is_long(self) -> bool {
        !matches!(self, Self::OneRtt)
    }

    /// Packet number space the type belongs to.
    #[must_use]
    pub fn space(self) -> PacketSpace {
        match self {
            Self::Initial => PacketSpace::Initial,
            Self::Handshake => PacketSpace::Handshake,
            Self::ZeroRtt | Self::OneRtt => PacketSpace::Application,
        }
    }

    /// Unprotected first byte for a packet number of `pn_len` bytes.
    #[must_use]
    pub fn first_byte(self, pn_len: usize) -> u8 {
        let pn_bits = (pn_len.clamp(1, 4) - 1) as u8;
        match self {
            Self::Initial => 0xc0 | pn_bits,
            Self::ZeroRtt => 0xd0 | pn_bits,
            Self::Handshake => 0xe0 | pn_bits,
            Self::OneRtt => 0x40 | pn_bits,
        }
    }

    /// Bits of the first byte covered by header protection.
    #[must_use]
    pub fn protected_bits(self) -> u8 {
        if self.is_long() { 0x0f } else { 0x1f }
    }

    fn from_first_byte(first: u8) -> Result<Self> {
        if first & 0x80 == 0 {
            return Ok(Self::OneRtt);
        }
        match (first >> 4) & 0x03 {
            0 => Ok(Self::Initial),
            1 => Ok(Self::ZeroRtt),
            2 => Ok(Self::Handshake),
            _ => Err(ProtocolError::parse("retry packets are not supported", 0)),
        }
    }
}

/// Length of the header protection sample (RFC 9001 Section 5.4.2).
pub const SAMPLE_LEN: usize = 16;

/// Location of the protected fields of a packet inside a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectedHeader {
    /// Packet type read from the first byte
    pub packet_type: PacketType,
    /// Offset of the packet number from the start of the packet
    pub pn_offset: usize,
    /// Total packet length; short-header packets extend to the datagram end
    pub packet_len: usize,
}

impl ProtectedHeader {
    /// Offset of the header protection sample.
    #[must_use]
    pub fn sample_offset(&self) -> usize {
        self.pn_offset + 4
    }
}

/// Locates the packet number of the first packet in `datagram`.
///
/// Only fields outside header protection are read. `short_dcid_len` is the
/// length of the local connection id, which short headers do not carry.
///
/// # Errors
///
/// Returns [`ProtocolError::Parse`] for truncated headers, version
/// negotiation and retry packets.
pub fn peek_header(datagram: &[u8], short_dcid_len: usize) -> Result<ProtectedHeader> {
    let mut r = Reader::new(datagram);
    let first = r.u8("packet.first_byte")?;
    let packet_type = PacketType::from_first_byte(first)?;

    if !packet_type.is_long() {
        r.bytes(short_dcid_len, "packet.dcid")?;
        return Ok(ProtectedHeader {
            packet_type,
            pn_offset: r.position(),
            packet_len: datagram.len(),
        });
    }

    if r.u32("packet.version")? == 0 {
        return Err(ProtocolError::parse("version negotiation is not supported", 1));
    }
    r.vec_u8("packet.dcid")?;
    r.vec_u8("packet.scid")?;
    if packet_type == PacketType::Initial {
        let token_len = r.varint("packet.token_length")?;
        r.bytes(token_len as usize, "packet.token")?;
    }
    let length = r.varint("packet.length")? as usize;
    let pn_offset = r.position();
    if r.remaining() < length {
        return Err(ProtocolError::parse(
            format!("packet length {length} exceeds datagram ({} left)", r.remaining()),
            pn_offset,
        ));
    }

    Ok(ProtectedHeader { packet_type, pn_offset, packet_len: pn_offset + length })
}

/// Intermediate values used to build the protected packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketComputations {
    /// Frames before payload protection
    pub plaintext: Overridable<Bytes>,
    /// Header protection mask (first byte, then up to four packet number
    /// bytes); no protection is applied while unset
    pub header_mask: Overridable<Bytes>,
    /// Whether the payload contains an ack-eliciting frame
    pub ack_eliciting: bool,
}

/// A QUIC packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Header form and long-header type
    pub packet_type: PacketType,
    /// Unprotected first byte
    pub first_byte: Overridable<u8>,
    /// Version (long header only)
    pub version: Overridable<u32>,
    /// Declared destination connection id length (long header only)
    pub dcid_length: Overridable<u8>,
    /// Destination connection id
    pub dcid: Overridable<Bytes>,
    /// Declared source connection id length (long header only)
    pub scid_length: Overridable<u8>,
    /// Source connection id (long header only)
    pub scid: Overridable<Bytes>,
    /// Declared token length (Initial only)
    pub token_length: Overridable<u64>,
    /// Address validation token (Initial only)
    pub token: Overridable<Bytes>,
    /// Length of packet number plus protected payload (long header only)
    pub length: Overridable<u64>,
    /// Full packet number
    pub packet_number: Overridable<u64>,
    /// Bytes used to send the truncated packet number
    pub packet_number_length: Overridable<u8>,
    /// Protected payload, including the AEAD tag
    pub payload: Overridable<Bytes>,
    /// Protection intermediates
    pub computations: PacketComputations,
}

impl Packet {
    /// Creates an empty packet of `packet_type`.
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            first_byte: Overridable::Unset,
            version: Overridable::Unset,
            dcid_length: Overridable::Unset,
            dcid: Overridable::Unset,
            scid_length: Overridable::Unset,
            scid: Overridable::Unset,
            token_length: Overridable::Unset,
            token: Overridable::Unset,
            length: Overridable::Unset,
            packet_number: Overridable::Unset,
            packet_number_length: Overridable::Unset,
            payload: Overridable::Unset,
            computations: PacketComputations::default(),
        }
    }

    /// Writes the unprotected header up to and including the truncated
    /// packet number, returning the packet number offset.
    pub fn encode_header(&self, dst: &mut impl BufMut) -> Result<usize> {
        let mut header = BytesMut::new();
        header.put_u8(self.first_byte.value("packet.first_byte")?);

        if self.packet_type.is_long() {
            header.put_u32(self.version.value("packet.version")?);
            header.put_u8(self.dcid_length.value("packet.dcid_length")?);
            header.put_slice(self.dcid.resolve("packet.dcid")?);
            header.put_u8(self.scid_length.value("packet.scid_length")?);
            header.put_slice(self.scid.resolve("packet.scid")?);
            if self.packet_type == PacketType::Initial {
                varint::encode(
                    &mut header,
                    "packet.token_length",
                    self.token_length.value("packet.token_length")?,
                )?;
                header.put_slice(self.token.resolve("packet.token")?);
            }
            varint::encode(&mut header, "packet.length", self.length.value("packet.length")?)?;
        } else {
            header.put_slice(self.dcid.resolve("packet.dcid")?);
        }

        let pn_offset = header.len();
        let pn_len = usize::from(self.packet_number_length.value("packet.packet_number_length")?);
        let pn = self.packet_number.value("packet.packet_number")?;
        let truncated = if pn_len >= 8 { pn } else { pn & ((1u64 << (pn_len * 8)) - 1) };
        put_uint(&mut header, "packet.packet_number", truncated, pn_len)?;

        dst.put_slice(&header);
        Ok(pn_offset)
    }

    /// Writes the packet, applying the header protection mask if one is set.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut out = BytesMut::new();
        let pn_offset = self.encode_header(&mut out)?;
        let pn_len = out.len() - pn_offset;
        out.put_slice(self.payload.resolve("packet.payload")?);

        if let Some(mask) = self.computations.header_mask.get() {
            apply_mask(&mut out, self.packet_type, pn_offset, pn_len, mask);
        }
        dst.put_slice(&out);
        Ok(())
    }

    /// Decodes a packet whose header protection has already been removed.
    ///
    /// `packet` must span exactly one packet (see [`peek_header`]).
    /// `expected_pn` is one more than the largest packet number received in
    /// the packet's space.
    pub fn decode_unprotected(
        packet: &[u8],
        short_dcid_len: usize,
        expected_pn: u64,
    ) -> Result<Self> {
        let mut r = Reader::new(packet);
        let first = r.u8("packet.first_byte")?;
        let packet_type = PacketType::from_first_byte(first)?;
        let mut out = Self::new(packet_type);
        out.first_byte = Overridable::computed(first);

        if packet_type.is_long() {
            out.version = Overridable::computed(r.u32("packet.version")?);
            let (dcid_len, dcid) = r.vec_u8("packet.dcid")?;
            out.dcid_length = Overridable::computed(dcid_len);
            out.dcid = Overridable::computed(owned(dcid));
            let (scid_len, scid) = r.vec_u8("packet.scid")?;
            out.scid_length = Overridable::computed(scid_len);
            out.scid = Overridable::computed(owned(scid));
            if packet_type == PacketType::Initial {
                let token_len = r.varint("packet.token_length")?;
                out.token_length = Overridable::computed(token_len);
                let token = r.bytes(token_len as usize, "packet.token")?;
                out.token = Overridable::computed(owned(token));
            }
            out.length = Overridable::computed(r.varint("packet.length")?);
        } else {
            out.dcid = Overridable::computed(owned(r.bytes(short_dcid_len, "packet.dcid")?));
        }

        let pn_len = usize::from(first & 0x03) + 1;
        let truncated = r.uint(pn_len, "packet.packet_number")?;
        let full = number::decode(truncated, pn_len * 8, expected_pn)
            .map_err(|e| e.offset(r.position()))?;
        out.packet_number_length = Overridable::computed(pn_len as u8);
        out.packet_number = Overridable::computed(full);
        out.payload = Overridable::computed(owned(r.take_rest()));
        Ok(out)
    }
}

/// XORs a header protection mask into an encoded packet.
///
/// Applying the same mask twice restores the original bytes. The packet
/// number length is taken from the caller because the masked first byte no
/// longer reveals it.
pub fn apply_mask(
    packet: &mut [u8],
    packet_type: PacketType,
    pn_offset: usize,
    pn_len: usize,
    mask: &[u8],
) {
    if let (Some(first), Some(m)) = (packet.first_mut(), mask.first()) {
        *first ^= m & packet_type.protected_bits();
    }
    for i in 0..pn_len {
        if let (Some(byte), Some(m)) = (packet.get_mut(pn_offset + i), mask.get(1 + i)) {
            *byte ^= m;
        }
    }
}
