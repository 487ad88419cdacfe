//! TLS record framing.
//!
//! A record is a 5-byte header followed by a fragment:
//!
//! ```text
//! +--------------+-----------------+----------------+-----------------+
//! | content_type | version (u16be) | length (u16be) | fragment ...    |
//! +--------------+-----------------+----------------+-----------------+
//! ```
//!
//! The `length` field and the fragment are independent overridable values,
//! so a record can claim a length that disagrees with its payload.

use bytes::{BufMut, Bytes};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    codec::owned,
    errors::{ProtocolError, Result},
    tls::{ContentType, ProtocolVersion},
    value::Overridable,
};

/// Raw record header as it appears on the wire.
///
/// All byte patterns are valid, so the header can be cast straight from
/// untrusted input.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct RawRecordHeader {
    content_type: u8,
    version: [u8; 2],
    length: [u8; 2],
}

impl RawRecordHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 5;

    /// Casts the header from the front of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Incomplete`] if fewer than [`Self::SIZE`]
    /// bytes are available.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(bytes)
            .map(|(header, _)| header)
            .map_err(|_| ProtocolError::Incomplete { needed: Self::SIZE - bytes.len() })
    }

    /// Content type byte
    #[must_use]
    pub fn content_type(&self) -> ContentType {
        ContentType(self.content_type)
    }

    /// Record version
    #[must_use]
    pub fn version(&self) -> ProtocolVersion {
        ProtocolVersion(u16::from_be_bytes(self.version))
    }

    /// Declared fragment length
    #[must_use]
    pub fn length(&self) -> u16 {
        u16::from_be_bytes(self.length)
    }

    /// Header bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }
}

/// Intermediate values used only to compute a protected fragment.
///
/// None of these are written on the wire directly; the fragment is derived
/// from them during compute-defaults. Overriding `padding` or `mac` is how
/// malformed CBC records are built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordComputations {
    /// Content before protection
    pub plaintext: Overridable<Bytes>,
    /// Record MAC over sequence number, header fields and plaintext
    pub mac: Overridable<Bytes>,
    /// CBC padding including the trailing padding-length byte
    pub padding: Overridable<Bytes>,
    /// CBC initialisation vector
    pub iv: Overridable<Bytes>,
    /// Sequence number the MAC was computed with
    pub sequence_number: Option<u64>,
}

/// A TLS record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    /// Content type of the fragment
    pub content_type: Overridable<ContentType>,
    /// Record-layer version
    pub version: Overridable<ProtocolVersion>,
    /// Declared fragment length
    pub length: Overridable<u16>,
    /// Fragment as written on the wire (ciphertext once protected)
    pub fragment: Overridable<Bytes>,
    /// Protection intermediates
    pub computations: RecordComputations,
}

impl Record {
    /// Creates a record carrying `plaintext` of the given content type.
    ///
    /// Both values are stored as computed, so explicit overrides applied
    /// later still take precedence.
    pub fn with_content(content_type: ContentType, plaintext: impl Into<Bytes>) -> Self {
        let mut record = Self::default();
        record.content_type.set_computed(content_type);
        record.computations.plaintext.set_computed(plaintext.into());
        record
    }

    /// Returns true if the record carries payload, as opposed to being a
    /// template waiting for content.
    #[must_use]
    pub fn has_payload(&self) -> bool {
        self.fragment.is_set() || self.computations.plaintext.is_set()
    }

    /// Writes header and fragment.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnresolvedValue`] if any header field or the
    /// fragment is unset.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let content_type = self.content_type.value("record.content_type")?;
        let version = self.version.value("record.version")?;
        let length = self.length.value("record.length")?;
        let fragment = self.fragment.resolve("record.fragment")?;

        dst.put_u8(content_type.0);
        dst.put_u16(version.0);
        dst.put_u16(length);
        dst.put_slice(fragment);
        Ok(())
    }

    /// Decodes one record from the front of `bytes`.
    ///
    /// Returns the record and the number of bytes it occupied. Decoded values
    /// are stored as computed; protection is not removed here.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Incomplete`] if the header or the declared
    /// fragment is not fully buffered yet.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let header = RawRecordHeader::from_bytes(bytes)?;
        let length = usize::from(header.length());
        let total = RawRecordHeader::SIZE + length;
        if bytes.len() < total {
            return Err(ProtocolError::Incomplete { needed: total - bytes.len() });
        }

        let record = Self {
            content_type: Overridable::computed(header.content_type()),
            version: Overridable::computed(header.version()),
            length: Overridable::computed(header.length()),
            fragment: Overridable::computed(owned(&bytes[RawRecordHeader::SIZE..total])),
            computations: RecordComputations::default(),
        };
        Ok((record, total))
    }
}
