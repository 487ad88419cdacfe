//! Packet number truncation (RFC 9000 Section 17.1 and Appendix A).
//!
//! Only the least significant bytes of a packet number are sent; the
//! receiver reconstructs the full value from the largest packet number it
//! has seen in the same space.

use crate::errors::{ProtocolError, Result};

/// Number of bytes needed to send `full_pn` unambiguously (RFC 9000 A.2).
///
/// `largest_acked` is `None` until the peer has acknowledged a packet in this
/// space.
#[must_use]
pub fn encode_length(full_pn: u64, largest_acked: Option<u64>) -> usize {
    let num_unacked = match largest_acked {
        Some(acked) => full_pn.saturating_sub(acked),
        None => full_pn.saturating_add(1),
    };

    // One extra bit so the receiver's window is centred on the expected value
    let min_bits = (64 - num_unacked.leading_zeros()) as usize + 1;
    min_bits.div_ceil(8).clamp(1, 4)
}

/// Reconstructs a full packet number (RFC 9000 A.3).
///
/// # Errors
///
/// Returns [`ProtocolError::Parse`] if `pn_nbits` is not 8, 16, 24 or 32.
pub fn decode(truncated_pn: u64, pn_nbits: usize, expected_pn: u64) -> Result<u64> {
    if !matches!(pn_nbits, 8 | 16 | 24 | 32) {
        return Err(ProtocolError::parse(format!("invalid packet number width {pn_nbits}"), 0));
    }

    let pn_win = 1u64 << pn_nbits;
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;

    let candidate = (expected_pn & !pn_mask) | (truncated_pn & pn_mask);
    if candidate.saturating_add(pn_hwin) <= expected_pn && candidate < (1u64 << 62) - pn_win {
        Ok(candidate + pn_win)
    } else if candidate > expected_pn.saturating_add(pn_hwin) && candidate >= pn_win {
        Ok(candidate - pn_win)
    } else {
        Ok(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_length_grows_with_unacked_range() {
        assert_eq!(encode_length(0, None), 1);
        assert_eq!(encode_length(100, Some(99)), 1);
        assert_eq!(encode_length(1000, Some(500)), 2);
        // RFC 9000 A.2 example
        assert_eq!(encode_length(0xac5c02, Some(0xabe8b3)), 2);
        assert_eq!(encode_length(0xace8fe, Some(0xabe8b3)), 3);
    }

    #[test]
    fn decode_rfc_example() {
        // RFC 9000 A.3: largest 0xa82f30ea, truncated 0x9b32 in 16 bits
        assert_eq!(decode(0x9b32, 16, 0xa82f30eb).unwrap(), 0xa82f9b32);
    }

    #[test]
    fn decode_wraps_forward() {
        assert_eq!(decode(0xed, 8, 1000).unwrap(), 1005);
        assert_eq!(decode(0x05, 8, 1000).unwrap(), 1029);
        assert_eq!(decode(11, 8, 10).unwrap(), 11);
    }

    #[test]
    fn rejects_odd_widths() {
        assert!(decode(1, 12, 0).is_err());
    }
}
