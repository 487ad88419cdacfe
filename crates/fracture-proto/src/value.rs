//! Overridable field values.
//!
//! Every field of a wire unit is an [`Overridable`]. The pipeline fills
//! fields with computed defaults derived from connection state, while an
//! operator may pin any field to an explicit value at any time. Encoding
//! only ever reads [`Overridable::resolve`], so an explicit value always
//! wins regardless of what the defaults stage would have produced.
//!
//! ```text
//!            set_computed          set_explicit
//!   Unset ───────────────> Computed ──────────> Explicit
//!     │                       ▲  │                 ▲
//!     │                       └──┘ recompute       │ set_computed is a no-op
//!     └────────────────────────────────────────────┘
//!                     set_explicit
//! ```

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// A wire field that resolves to an explicit override if set, else a
/// computed default.
///
/// # Invariants
///
/// - `set_computed` never replaces an `Explicit` value.
/// - `resolve` returns the explicit value if present, else the computed one,
///   else fails with [`ProtocolError::UnresolvedValue`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Overridable<T> {
    /// No value yet
    Unset,
    /// Value produced by the compute-defaults stage or by decoding
    Computed(T),
    /// Operator-chosen value
    Explicit(T),
}

impl<T> Default for Overridable<T> {
    fn default() -> Self {
        Self::Unset
    }
}

impl<T> Overridable<T> {
    /// Creates an explicitly overridden value.
    pub fn explicit(value: T) -> Self {
        Self::Explicit(value)
    }

    /// Creates a computed value.
    pub fn computed(value: T) -> Self {
        Self::Computed(value)
    }

    /// Stores `value` unless an explicit override is already present.
    pub fn set_computed(&mut self, value: T) {
        if !self.is_explicit() {
            *self = Self::Computed(value);
        }
    }

    /// Stores `value` as an explicit override, replacing anything present.
    pub fn set_explicit(&mut self, value: T) {
        *self = Self::Explicit(value);
    }

    /// Computes a value only if the field is still unset.
    ///
    /// Used for fields whose default is random, so that running the
    /// compute-defaults stage twice does not change the resolved value.
    pub fn compute_if_unset(&mut self, f: impl FnOnce() -> T) {
        if matches!(self, Self::Unset) {
            *self = Self::Computed(f());
        }
    }

    /// Drops a computed value, keeping explicit overrides.
    pub fn clear_computed(&mut self) {
        if matches!(self, Self::Computed(_)) {
            *self = Self::Unset;
        }
    }

    /// Resolves the value to be written on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnresolvedValue`] naming `field` if the value
    /// was never set.
    pub fn resolve(&self, field: &'static str) -> Result<&T> {
        self.get().ok_or(ProtocolError::UnresolvedValue(field))
    }

    /// Returns the resolved value, if any.
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        match self {
            Self::Unset => None,
            Self::Computed(value) | Self::Explicit(value) => Some(value),
        }
    }

    /// Returns true if the field holds an operator override.
    #[must_use]
    pub fn is_explicit(&self) -> bool {
        matches!(self, Self::Explicit(_))
    }

    /// Returns true if the field resolves to some value.
    #[must_use]
    pub fn is_set(&self) -> bool {
        !matches!(self, Self::Unset)
    }
}

impl<T: Copy> Overridable<T> {
    /// Resolves a `Copy` value by value.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnresolvedValue`] if the value was never set.
    pub fn value(&self, field: &'static str) -> Result<T> {
        self.resolve(field).copied()
    }
}

impl<T> From<T> for Overridable<T> {
    fn from(value: T) -> Self {
        Self::Explicit(value)
    }
}
