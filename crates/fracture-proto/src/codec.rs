//! Byte-level reading and writing helpers shared by the wire catalog.
//!
//! [`Reader`] tracks its position so that every parse error reports how far
//! into the unit decoding got. Writers check that resolved values fit their
//! wire width instead of silently truncating.

use bytes::{BufMut, Bytes};

use crate::{
    errors::{ProtocolError, Result},
    quic::varint,
};

/// Largest value a 24-bit length field can carry.
pub const U24_MAX: u32 = 0x00FF_FFFF;

/// Cursor over an input buffer.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Returns true if every byte has been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Unconsumed bytes, without advancing.
    #[must_use]
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Reads exactly `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Parse`] if fewer than `len` bytes remain.
    pub fn bytes(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::parse(
                format!("{what}: need {len} bytes, {} available", self.remaining()),
                self.pos,
            ));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Reads all remaining bytes.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let out = self.rest();
        self.pos = self.buf.len();
        out
    }

    /// Reads one byte.
    pub fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.bytes(1, what)?[0])
    }

    /// Reads a big-endian `u16`.
    pub fn u16(&mut self, what: &str) -> Result<u16> {
        let b = self.bytes(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Reads a big-endian 24-bit integer.
    pub fn u24(&mut self, what: &str) -> Result<u32> {
        let b = self.bytes(3, what)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    /// Reads a big-endian `u32`.
    pub fn u32(&mut self, what: &str) -> Result<u32> {
        let b = self.bytes(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian unsigned integer of `len` (1..=8) bytes.
    pub fn uint(&mut self, len: usize, what: &str) -> Result<u64> {
        if !(1..=8).contains(&len) {
            return Err(ProtocolError::parse(format!("{what}: invalid width {len}"), self.pos));
        }
        Ok(self.bytes(len, what)?.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    /// Reads a QUIC variable-length integer.
    pub fn varint(&mut self, what: &str) -> Result<u64> {
        let (value, len) =
            varint::decode(self.rest()).map_err(|e| rename(e, what).offset(self.pos))?;
        self.pos += len;
        Ok(value)
    }

    /// Reads an opaque vector with an 8-bit length prefix.
    pub fn vec_u8(&mut self, what: &str) -> Result<(u8, &'a [u8])> {
        let len = self.u8(what)?;
        Ok((len, self.bytes(usize::from(len), what)?))
    }

    /// Reads an opaque vector with a 16-bit length prefix.
    pub fn vec_u16(&mut self, what: &str) -> Result<(u16, &'a [u8])> {
        let len = self.u16(what)?;
        Ok((len, self.bytes(usize::from(len), what)?))
    }

    /// Splits off a sub-reader over the next `len` bytes.
    pub fn sub(&mut self, len: usize, what: &str) -> Result<Reader<'a>> {
        Ok(Reader::new(self.bytes(len, what)?))
    }
}

fn rename(err: ProtocolError, what: &str) -> ProtocolError {
    match err {
        ProtocolError::Parse { reason, consumed } => {
            ProtocolError::Parse { reason: format!("{what}: {reason}"), consumed }
        },
        other => other,
    }
}

/// Converts a resolved length into an 8-bit wire value.
pub fn fit_u8(field: &'static str, value: usize) -> Result<u8> {
    u8::try_from(value).map_err(|_| out_of_range(field, value as u64, u64::from(u8::MAX)))
}

/// Converts a resolved length into a 16-bit wire value.
pub fn fit_u16(field: &'static str, value: usize) -> Result<u16> {
    u16::try_from(value).map_err(|_| out_of_range(field, value as u64, u64::from(u16::MAX)))
}

/// Converts a resolved length into a 24-bit wire value.
pub fn fit_u24(field: &'static str, value: usize) -> Result<u32> {
    match u32::try_from(value) {
        Ok(v) if v <= U24_MAX => Ok(v),
        _ => Err(out_of_range(field, value as u64, u64::from(U24_MAX))),
    }
}

/// Writes a big-endian 24-bit integer.
///
/// # Errors
///
/// Returns [`ProtocolError::ValueOutOfRange`] if `value` needs more than 24
/// bits.
pub fn put_u24(dst: &mut impl BufMut, field: &'static str, value: u32) -> Result<()> {
    if value > U24_MAX {
        return Err(out_of_range(field, u64::from(value), u64::from(U24_MAX)));
    }
    dst.put_slice(&value.to_be_bytes()[1..]);
    Ok(())
}

/// Writes the low `len` bytes of `value` big-endian.
pub fn put_uint(dst: &mut impl BufMut, field: &'static str, value: u64, len: usize) -> Result<()> {
    if !(1..=8).contains(&len) {
        return Err(out_of_range(field, len as u64, 8));
    }
    if len < 8 && value >> (len * 8) != 0 {
        return Err(out_of_range(field, value, (1u64 << (len * 8)) - 1));
    }
    dst.put_slice(&value.to_be_bytes()[8 - len..]);
    Ok(())
}

fn out_of_range(field: &'static str, value: u64, max: u64) -> ProtocolError {
    ProtocolError::ValueOutOfRange { field, value, max }
}

/// Copies a borrowed slice into owned [`Bytes`].
pub(crate) fn owned(slice: &[u8]) -> Bytes {
    Bytes::copy_from_slice(slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_reports_position_on_truncation() {
        let mut reader = Reader::new(&[0x01, 0x02, 0x03]);
        assert_eq!(reader.u16("first").ok(), Some(0x0102));

        let err = reader.u16("second").unwrap_err();
        assert!(matches!(err, ProtocolError::Parse { consumed: 2, .. }));
    }

    #[test]
    fn length_prefixed_overrun_is_parse_error() {
        let mut reader = Reader::new(&[0x05, 0xAA, 0xBB]);
        assert!(matches!(reader.vec_u8("session_id"), Err(ProtocolError::Parse { .. })));
    }

    #[test]
    fn u24_round_trips_and_rejects_overflow() {
        let mut buf = Vec::new();
        put_u24(&mut buf, "length", 0x01_02_03).unwrap();
        assert_eq!(buf, [0x01, 0x02, 0x03]);
        assert_eq!(Reader::new(&buf).u24("length").unwrap(), 0x01_02_03);

        assert!(matches!(
            put_u24(&mut buf, "length", 0x0100_0000),
            Err(ProtocolError::ValueOutOfRange { field: "length", .. })
        ));
    }

    #[test]
    fn put_uint_checks_width() {
        let mut buf = Vec::new();
        put_uint(&mut buf, "pn", 0x1234, 2).unwrap();
        assert_eq!(buf, [0x12, 0x34]);
        assert!(put_uint(&mut buf, "pn", 0x1_0000, 2).is_err());
    }
}
