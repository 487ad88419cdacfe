//! Error types for the fracture wire model.
//!
//! Decoding never panics on hostile input: every truncation, overrun or
//! unknown discriminant becomes a [`ProtocolError`] carrying enough context
//! for a layer to attach it to its processing result.

use thiserror::Error;

/// Errors produced while decoding or encoding wire units.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Input is malformed or truncated inside the unit being decoded
    #[error("parse error after {consumed} bytes: {reason}")]
    Parse {
        /// Human-readable description of what went wrong
        reason: String,
        /// Bytes of the unit consumed before the failure was detected
        consumed: usize,
    },

    /// Input is a valid prefix of a stream-framed unit; more bytes are needed
    ///
    /// Layers treat this as "wait for the next read", not as a failure.
    #[error("incomplete unit: at least {needed} more bytes required")]
    Incomplete {
        /// Lower bound on the number of missing bytes
        needed: usize,
    },

    /// A required field has neither an explicit nor a computed value
    #[error("field `{0}` has neither an explicit nor a computed value")]
    UnresolvedValue(&'static str),

    /// A resolved value does not fit the width of its wire field
    #[error("field `{field}` value {value} exceeds wire maximum {max}")]
    ValueOutOfRange {
        /// Field being encoded
        field: &'static str,
        /// Resolved value
        value: u64,
        /// Largest value the field can carry
        max: u64,
    },
}

impl ProtocolError {
    /// Shorthand for [`ProtocolError::Parse`].
    pub fn parse(reason: impl Into<String>, consumed: usize) -> Self {
        Self::Parse { reason: reason.into(), consumed }
    }

    /// Returns true if the input was a valid but incomplete prefix.
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete { .. })
    }

    /// Re-bases the `consumed` offset of a parse error onto an enclosing unit.
    #[must_use]
    pub fn offset(self, by: usize) -> Self {
        match self {
            Self::Parse { reason, consumed } => Self::Parse { reason, consumed: consumed + by },
            other => other,
        }
    }
}

/// Result type for wire model operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_rebases_parse_errors_only() {
        let err = ProtocolError::parse("bad", 3).offset(4);
        assert_eq!(err, ProtocolError::Parse { reason: "bad".to_string(), consumed: 7 });

        let err = ProtocolError::Incomplete { needed: 2 }.offset(4);
        assert_eq!(err, ProtocolError::Incomplete { needed: 2 });
    }

    #[test]
    fn display_names_the_field() {
        let err = ProtocolError::UnresolvedValue("record.length");
        assert!(err.to_string().contains("record.length"));
    }
}
