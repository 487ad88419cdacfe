//! Halt and continue policies against peers that stay silent or hang up.

use std::time::Duration;

use fracture_core::{TraceStatus, UnitKind, workflow::ActionStatus};
use fracture_harness::{
    PeerReply, Preset, ScriptedPeer,
    scenario::{Scenario, traces},
};
use fracture_proto::tls::HandshakeType;

fn silent_peer() -> ScriptedPeer {
    ScriptedPeer::new(Preset::Tls, |_, _| PeerReply::nothing())
}

fn hanging_up_peer() -> ScriptedPeer {
    ScriptedPeer::new(Preset::Tls, |_, _| PeerReply::close())
}

#[test]
fn halt_leaves_the_rest_of_the_handshake_pending() {
    let result = Scenario::new()
        .with_peer(silent_peer())
        .with_trace(traces::tls_handshake())
        .with_timeout(Duration::from_millis(100))
        .oracle(Box::new(|world| {
            let statuses: Vec<_> = world.trace().actions().iter().map(|a| a.status()).collect();
            let expected = [
                ActionStatus::Completed,
                ActionStatus::Failed,
                ActionStatus::Pending,
                ActionStatus::Pending,
            ];
            if statuses != expected {
                return Err(format!("statuses {statuses:?}"));
            }
            let reason = world.trace().actions()[1].failure().unwrap_or_default();
            if !reason.contains("timed out") {
                return Err(format!("unexpected failure reason {reason:?}"));
            }
            if world.status() != TraceStatus::Failed {
                return Err(format!("status {:?}", world.status()));
            }
            Ok(())
        }))
        .run();

    assert_eq!(result, Ok(()));
}

#[test]
fn continue_runs_every_action_after_the_peer_hangs_up() {
    let trace = traces::tls_handshake().continue_on_failure();

    let result = Scenario::new()
        .with_peer(hanging_up_peer())
        .with_trace(trace)
        .oracle(Box::new(|world| {
            if world.status() != TraceStatus::CompletedWithFailures {
                return Err(format!("trace {:#?}", world.trace()));
            }
            let hello_done = UnitKind::Handshake(HandshakeType::SERVER_HELLO_DONE);
            let wait = &world.trace().actions()[1];
            if !wait.failure().unwrap_or_default().contains("peer closed") {
                return Err(format!("{hello_done} wait failed with {:?}", wait.failure()));
            }
            if world.trace().actions().iter().any(|a| a.status() == ActionStatus::Pending) {
                return Err("continue policy left actions pending".to_string());
            }
            if !world.peer_closed() {
                return Err("peer should have hung up".to_string());
            }
            Ok(())
        }))
        .run();

    assert_eq!(result, Ok(()));
}
