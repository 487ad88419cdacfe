//! Padding-oracle vectors sent to scripted servers after a real handshake.
//!
//! A server with the distinguishing alert policy leaks which check failed;
//! one with the uniform policy answers every vector identically. Each vector
//! runs in its own simulation, the way a campaign opens one connection per
//! vector.

use std::sync::{Arc, Mutex};

use fracture_core::{
    ConfiguredUnit, ConnectionConfig, LayerKind, TraceStatus,
    attack::{self, PaddingOracleVector, VectorKind},
};
use fracture_harness::{
    AlertPolicy, ScriptedPeer,
    scenario::{Scenario, oracle, traces},
};
use fracture_proto::tls::{
    AlertDescription, ApplicationData, CipherSuite, ProtocolVersion, TlsMessage,
};

const SUITE: CipherSuite = CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA;

fn vectors() -> Vec<PaddingOracleVector> {
    attack::generate(SUITE, ProtocolVersion::TLS1_2, 11).expect("CBC suite")
}

/// Runs `vector` against a server with `policy` and returns the alert the
/// client got back.
fn alert_for(vector: PaddingOracleVector, policy: AlertPolicy) -> Option<AlertDescription> {
    let answer = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&answer);

    let result = Scenario::new()
        .with_client_config(ConnectionConfig::client().with_seed(7).with_cipher_suites([SUITE]))
        .with_peer(ScriptedPeer::tls_server(policy))
        .with_trace(vector.into_trace(traces::tls_handshake()))
        .oracle(Box::new(move |world| {
            if world.status() != TraceStatus::Completed {
                return Err(format!("trace should complete: {:#?}", world.trace()));
            }
            if !world.peer_closed() {
                return Err("peer should hang up after a bad record".to_string());
            }
            *slot.lock().unwrap() = world.alerts_received().last().map(|(_, d)| *d);
            Ok(())
        }))
        .run();

    assert_eq!(result, Ok(()));
    answer.lock().unwrap().take()
}

#[test]
fn distinguishing_server_leaks_padding_failures() {
    for vector in vectors() {
        let kind = vector.kind;
        let alert = alert_for(vector, AlertPolicy::Distinguishing);
        let expected = match kind {
            VectorKind::MissingMac | VectorKind::ZeroPadding => AlertDescription::BAD_RECORD_MAC,
            VectorKind::LastByteCorrectOthersWrong
            | VectorKind::FirstByteFlipped
            | VectorKind::MiddleByteFlipped
            | VectorKind::LengthByteFlipped
            | VectorKind::LengthByteTooLarge => AlertDescription::DECRYPTION_FAILED,
            VectorKind::LengthByteOffByOne => continue,
        };
        assert_eq!(alert, Some(expected), "{kind:?}");
    }
}

#[test]
fn uniform_server_answers_every_vector_alike() {
    for vector in vectors() {
        let kind = vector.kind;
        assert_eq!(
            alert_for(vector, AlertPolicy::Uniform),
            Some(AlertDescription::BAD_RECORD_MAC),
            "{kind:?}"
        );
    }
}

#[test]
fn well_formed_application_data_gets_no_alert() {
    let hello = TlsMessage::ApplicationData(ApplicationData::new(&b"hello"[..]));
    let trace = traces::tls_handshake()
        .send_units(LayerKind::TlsMessage, [ConfiguredUnit::prepared(hello)])
        .generic_receive();

    let result = Scenario::new()
        .with_trace(trace)
        .oracle(Box::new(|world| {
            if !world.alerts_received().is_empty() {
                return Err(format!("unexpected alerts {:?}", world.alerts_received()));
            }
            if world.peer_errors().next().is_some() {
                return Err("peer failed to open a valid record".to_string());
            }
            oracle::trace_status(TraceStatus::Completed)(world)
        }))
        .run();

    assert_eq!(result, Ok(()));
}
