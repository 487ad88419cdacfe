//! Client traces the scripted servers understand.

use fracture_core::{ConfiguredUnit, LayerKind, UnitKind, WorkflowTrace};
use fracture_proto::tls::{
    ChangeCipherSpec, ClientHello, Finished, HandshakeBody, HandshakeMessage, HandshakeType,
    TlsMessage,
};

fn handshake(body: HandshakeBody) -> ConfiguredUnit {
    ConfiguredUnit::prepared(HandshakeMessage::new(body))
}

fn client_hello() -> ConfiguredUnit {
    handshake(HandshakeBody::ClientHello(ClientHello::default()))
}

/// Full TLS 1.x client handshake against [`tls_server`].
///
/// Ends once the server's Finished has been received, with both directions
/// protected.
///
/// [`tls_server`]: crate::peer::tls_server
pub fn tls_handshake() -> WorkflowTrace {
    WorkflowTrace::new()
        .send_units(LayerKind::TlsMessage, [client_hello()])
        .receive_till(UnitKind::Handshake(HandshakeType::SERVER_HELLO_DONE))
        .send_units(LayerKind::TlsMessage, [
            ConfiguredUnit::prepared(TlsMessage::ChangeCipherSpec(ChangeCipherSpec::default())),
            handshake(HandshakeBody::Finished(Finished::default())),
        ])
        .receive_till(UnitKind::Handshake(HandshakeType::FINISHED))
}

/// ClientHello in an Initial packet, waiting for the ServerHello.
pub fn quic_client_hello() -> WorkflowTrace {
    WorkflowTrace::new()
        .send_units(LayerKind::TlsMessage, [client_hello()])
        .receive_till(UnitKind::Handshake(HandshakeType::SERVER_HELLO))
}
