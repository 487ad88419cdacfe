//! Variable-length integers (RFC 9000 Section 16).
//!
//! The two most significant bits of the first byte select a 1, 2, 4 or 8
//! byte encoding carrying 6, 14, 30 or 62 bits of value.

use bytes::BufMut;

use crate::errors::{ProtocolError, Result};

/// Maximum value that can be encoded (2^62 - 1)
pub const MAX: u64 = (1u64 << 62) - 1;

/// Decodes a variable-length integer from the front of `data`.
///
/// Returns the value and the number of bytes consumed.
///
/// # Errors
///
/// Returns [`ProtocolError::Parse`] if `data` is shorter than the length
/// announced by the prefix bits.
pub fn decode(data: &[u8]) -> Result<(u64, usize)> {
    let Some(&first) = data.first() else {
        return Err(ProtocolError::parse("empty varint", 0));
    };

    let len = 1usize << (first >> 6);
    if data.len() < len {
        return Err(ProtocolError::parse(
            format!("incomplete {len}-byte varint, {} available", data.len()),
            0,
        ));
    }

    let value = data[1..len]
        .iter()
        .fold(u64::from(first & 0x3f), |acc, b| (acc << 8) | u64::from(*b));
    Ok((value, len))
}

/// Number of bytes the minimal encoding of `value` occupies.
///
/// Values above [`MAX`] report 8; [`encode`] rejects them.
#[must_use]
pub fn encoded_len(value: u64) -> usize {
    match value {
        0..=63 => 1,
        64..=16_383 => 2,
        16_384..=1_073_741_823 => 4,
        _ => 8,
    }
}

/// Encodes `value` using its minimal length.
///
/// # Errors
///
/// Returns [`ProtocolError::ValueOutOfRange`] if `value` exceeds [`MAX`].
pub fn encode(dst: &mut impl BufMut, field: &'static str, value: u64) -> Result<()> {
    encode_with_len(dst, field, value, encoded_len(value))
}

/// Encodes `value` using exactly `len` bytes (1, 2, 4 or 8).
///
/// Non-minimal encodings are legal on the wire and are useful attack input.
///
/// # Errors
///
/// Returns [`ProtocolError::ValueOutOfRange`] if `value` does not fit `len`
/// bytes or `len` is not a valid varint width.
pub fn encode_with_len(
    dst: &mut impl BufMut,
    field: &'static str,
    value: u64,
    len: usize,
) -> Result<()> {
    let (prefix, max) = match len {
        1 => (0x00u8, 63),
        2 => (0x40, 16_383),
        4 => (0x80, 1_073_741_823),
        8 => (0xc0, MAX),
        _ => return Err(ProtocolError::ValueOutOfRange { field, value: len as u64, max: 8 }),
    };
    if value > max {
        return Err(ProtocolError::ValueOutOfRange { field, value, max });
    }

    let bytes = value.to_be_bytes();
    let mut out = [0u8; 8];
    out[..len].copy_from_slice(&bytes[8 - len..]);
    out[0] |= prefix;
    dst.put_slice(&out[..len]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn rfc_9000_sample_values() {
        // RFC 9000 Appendix A.1
        let eight = hex::decode("c2197c5eff14e88c").unwrap();
        assert_eq!(decode(&eight).unwrap(), (151_288_809_941_952_652, 8));
        assert_eq!(decode(&hex::decode("9d7f3e7d").unwrap()).unwrap(), (494_878_333, 4));
        assert_eq!(decode(&hex::decode("7bbd").unwrap()).unwrap(), (15_293, 2));
        assert_eq!(decode(&hex::decode("25").unwrap()).unwrap(), (37, 1));
        assert_eq!(decode(&hex::decode("4025").unwrap()).unwrap(), (37, 2));
    }

    #[test]
    fn truncated_varint_is_parse_error() {
        assert!(matches!(decode(&[0x40]), Err(ProtocolError::Parse { .. })));
        assert!(matches!(decode(&[]), Err(ProtocolError::Parse { .. })));
    }

    #[test]
    fn rejects_values_above_max() {
        let mut buf = Vec::new();
        assert!(encode(&mut buf, "v", MAX + 1).is_err());
        assert!(encode_with_len(&mut buf, "v", 64, 1).is_err());
    }

    proptest! {
        #[test]
        fn minimal_encoding_decodes_to_same_value(value in 0..=MAX) {
            let mut buf = Vec::new();
            encode(&mut buf, "v", value).unwrap();
            prop_assert_eq!(buf.len(), encoded_len(value));
            prop_assert_eq!(decode(&buf).unwrap(), (value, buf.len()));
        }
    }
}
