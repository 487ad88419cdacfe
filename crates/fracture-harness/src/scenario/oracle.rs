//! Oracle functions for scenario verification.
//!
//! An oracle receives the [`World`] left behind by a run and returns
//! `Err(message)` when something that must hold does not.

use fracture_core::{TraceStatus, UnitKind};
use fracture_proto::tls::AlertDescription;

use crate::scenario::World;

/// Oracle function type.
pub type OracleFn = Box<dyn FnOnce(&World) -> Result<(), String>>;

/// The trace finished with the given status.
pub fn trace_status(expected: TraceStatus) -> OracleFn {
    Box::new(move |world| {
        if world.status() == expected {
            Ok(())
        } else {
            Err(format!("trace ended {:?}, expected {expected:?}", world.status()))
        }
    })
}

/// Both directions of the client switched to protected records.
pub fn handshake_completed() -> OracleFn {
    Box::new(|world| {
        let tls = world.client().tls();
        if tls.write().epoch() == 0 || tls.read().epoch() == 0 {
            return Err("client never activated record protection".to_string());
        }
        if tls.server_verify_data().is_none() {
            return Err("client never accepted a server Finished".to_string());
        }
        Ok(())
    })
}

/// The client received a fatal alert with `description`.
pub fn alert_received(description: AlertDescription) -> OracleFn {
    Box::new(move |world| {
        if world.alerts_received().iter().any(|(_, received)| *received == description) {
            Ok(())
        } else {
            Err(format!("no {description} alert, got {:?}", world.alerts_received()))
        }
    })
}

/// The peer decoded a unit of `kind`.
pub fn peer_saw(kind: UnitKind) -> OracleFn {
    Box::new(move |world| {
        if world.peer_saw(kind) { Ok(()) } else { Err(format!("peer never saw {kind}")) }
    })
}

/// Combine multiple oracles into one.
pub fn all_of(oracles: Vec<OracleFn>) -> OracleFn {
    Box::new(move |world| {
        for oracle in oracles {
            oracle(world)?;
        }
        Ok(())
    })
}
