//! The per-unit send and receive pipelines.
//!
//! Layers call these for every unit they handle, so the ordering contract
//! lives in one place:
//!
//! ```text
//! send:    [compute-defaults] -> encode -> apply-effects(Outbound)
//! receive:                       decode -> apply-effects(Inbound)
//! ```
//!
//! An adjustment failure does not stop the unit: its bytes are still sent
//! (or it is still delivered) and the failure is returned alongside so the
//! layer can record it.

use bytes::Bytes;
use fracture_proto::{Decode, ProtocolError};
use tracing::{debug, warn};

use crate::{
    error::{AdjustmentError, PipelineError},
    state::{ConnectionState, Direction},
    unit::WireUnit,
};

/// Result of sending one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Encoded unit
    pub bytes: Bytes,
    /// Effects that could not be applied
    pub adjustment: Option<AdjustmentError>,
}

/// Result of receiving one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound<U> {
    /// Decoded unit
    pub unit: U,
    /// Input bytes the unit occupied
    pub consumed: usize,
    /// Effects that could not be applied
    pub adjustment: Option<AdjustmentError>,
}

/// Runs compute-defaults against the current state.
///
/// # Errors
///
/// Propagates the unit's compute failure.
pub fn prepare<U: WireUnit + ?Sized>(
    unit: &mut U,
    state: &mut ConnectionState,
) -> Result<(), PipelineError> {
    unit.compute_defaults(&mut state.prepare_context())
}

/// Sends one unit through the pipeline.
///
/// With `should_prepare` false the unit is encoded exactly as configured.
///
/// # Errors
///
/// Fails if compute-defaults or encoding fails. State is untouched in that
/// case.
pub fn send<U: WireUnit + ?Sized>(
    unit: &mut U,
    should_prepare: bool,
    state: &mut ConnectionState,
) -> Result<Outbound, PipelineError> {
    if should_prepare {
        prepare(unit, state)?;
    }
    let bytes = unit.encode()?;
    let adjustment = apply_effects(unit, state, Direction::Outbound);
    debug!(kind = %unit.kind(), len = bytes.len(), "unit sent");
    Ok(Outbound { bytes, adjustment })
}

/// Decodes one unit from the front of `bytes`.
///
/// # Errors
///
/// Returns [`ProtocolError::Incomplete`] when more input is needed and
/// [`ProtocolError::Parse`] for malformed input.
pub fn decode<U: Decode>(bytes: &[u8], context: &U::Context) -> Result<(U, usize), ProtocolError> {
    U::decode_with(bytes, context)
}

/// Applies a received unit's effects, returning the failure if any.
pub fn apply_inbound<U: WireUnit + ?Sized>(
    unit: &U,
    state: &mut ConnectionState,
) -> Option<AdjustmentError> {
    apply_effects(unit, state, Direction::Inbound)
}

/// Decodes one unit and applies its effects.
///
/// # Errors
///
/// Fails only if decoding fails; adjustment failures are returned in
/// [`Inbound::adjustment`].
pub fn receive<U: WireUnit + Decode>(
    bytes: &[u8],
    context: &U::Context,
    state: &mut ConnectionState,
) -> Result<Inbound<U>, ProtocolError> {
    let (unit, consumed) = decode::<U>(bytes, context)?;
    let adjustment = apply_inbound(&unit, state);
    debug!(kind = %unit.kind(), consumed, "unit received");
    Ok(Inbound { unit, consumed, adjustment })
}

fn apply_effects<U: WireUnit + ?Sized>(
    unit: &U,
    state: &mut ConnectionState,
    direction: Direction,
) -> Option<AdjustmentError> {
    let result = unit.apply_effects(state, direction);
    if let Err(err) = &result {
        warn!(kind = %unit.kind(), ?direction, error = %err, "effects not applied");
    }
    result.err()
}
