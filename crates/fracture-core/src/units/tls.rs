//! Handshake, alert, ChangeCipherSpec and application data units.

use bytes::{Bytes, BytesMut};
use fracture_proto::{
    Overridable, ProtocolError,
    codec::{fit_u8, fit_u16, fit_u24},
    tls::{
        ClientHello, Extension, ExtensionType, Finished, HandshakeBody, HandshakeMessage,
        HandshakeType, RANDOM_LEN, ServerHello, TlsMessage, extensions_block_len,
        max_fragment_length_from_code,
    },
};

use crate::{
    error::{AdjustmentError, PipelineError},
    state::{ConnectionState, Direction, PrepareContext, Role},
    unit::{UnitKind, WireUnit},
};

/// Kind reported for a handshake message whose type was never set.
const UNTYPED: HandshakeType = HandshakeType(0xff);

impl WireUnit for TlsMessage {
    fn kind(&self) -> UnitKind {
        match self {
            Self::Handshake(message) => UnitKind::Handshake(
                message
                    .handshake_type
                    .get()
                    .copied()
                    .or_else(|| message.body.default_type())
                    .unwrap_or(UNTYPED),
            ),
            Self::Alert(_) => UnitKind::Alert,
            Self::ChangeCipherSpec(_) => UnitKind::ChangeCipherSpec,
            Self::ApplicationData(_) => UnitKind::ApplicationData,
        }
    }

    fn compute_defaults(&mut self, ctx: &mut PrepareContext<'_>) -> Result<(), PipelineError> {
        match self {
            Self::Handshake(message) => prepare_handshake(message, ctx),
            Self::ChangeCipherSpec(ccs) => {
                ccs.value.set_computed(1);
                Ok(())
            },
            Self::Alert(_) | Self::ApplicationData(_) => Ok(()),
        }
    }

    fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut out = BytesMut::new();
        TlsMessage::encode(self, &mut out)?;
        Ok(out.freeze())
    }

    fn apply_effects(
        &self,
        state: &mut ConnectionState,
        direction: Direction,
    ) -> Result<(), AdjustmentError> {
        match self {
            Self::Handshake(message) => apply_handshake(message, state, direction),
            Self::Alert(alert) => {
                let entry = (
                    alert.level.value("alert.level")?,
                    alert.description.value("alert.description")?,
                );
                match direction {
                    Direction::Outbound => state.tls.alerts_sent.push(entry),
                    Direction::Inbound => state.tls.alerts_received.push(entry),
                }
                Ok(())
            },
            Self::ChangeCipherSpec(ccs) => {
                state.tls.change_cipher_specs += 1;
                let value = ccs.value.value("change_cipher_spec.value")?;
                if value != 1 {
                    return Err(AdjustmentError::Inconsistent {
                        unit: "ChangeCipherSpec",
                        reason: format!("value {value} is not 1"),
                    });
                }
                if state.tls.selected_suite.is_none() {
                    return Err(AdjustmentError::Inconsistent {
                        unit: "ChangeCipherSpec",
                        reason: "no cipher suite negotiated".to_string(),
                    });
                }
                Ok(())
            },
            Self::ApplicationData(app) => {
                let len = app.data.resolve("application_data.data")?.len() as u64;
                match direction {
                    Direction::Outbound => state.tls.app_data_sent += len,
                    Direction::Inbound => state.tls.app_data_received += len,
                }
                Ok(())
            },
        }
    }
}

fn prepare_handshake(
    message: &mut HandshakeMessage,
    ctx: &mut PrepareContext<'_>,
) -> Result<(), PipelineError> {
    if let Some(default) = message.body.default_type() {
        message.handshake_type.set_computed(default);
    }
    match &mut message.body {
        HandshakeBody::ClientHello(hello) => prepare_client_hello(hello, ctx)?,
        HandshakeBody::ServerHello(hello) => prepare_server_hello(hello, ctx)?,
        HandshakeBody::Finished(finished) => prepare_finished(finished, ctx)?,
        HandshakeBody::ServerHelloDone | HandshakeBody::Opaque(_) => {},
    }

    let mut body = BytesMut::new();
    message.body.encode(&mut body)?;
    message.length.set_computed(fit_u24("handshake.length", body.len())?);
    Ok(())
}

fn prepare_client_hello(
    hello: &mut ClientHello,
    ctx: &mut PrepareContext<'_>,
) -> Result<(), ProtocolError> {
    hello.version.set_computed(ctx.config.highest_version);
    hello.random.compute_if_unset(|| ctx.random_bytes(RANDOM_LEN));
    prepare_session_id(&mut hello.session_id, &mut hello.session_id_length)?;

    hello.cipher_suites.set_computed(ctx.config.cipher_suites.clone());
    let suites = hello.cipher_suites.resolve("client_hello.cipher_suites")?.len();
    hello
        .cipher_suites_length
        .set_computed(fit_u16("client_hello.cipher_suites_length", suites * 2)?);

    hello.compression_methods.compute_if_unset(|| Bytes::from_static(&[0]));
    let methods = hello.compression_methods.resolve("client_hello.compression_methods")?.len();
    hello
        .compression_methods_length
        .set_computed(fit_u8("client_hello.compression_methods_length", methods)?);

    prepare_extensions(&mut hello.extensions, &mut hello.extensions_length)
}

fn prepare_server_hello(
    hello: &mut ServerHello,
    ctx: &mut PrepareContext<'_>,
) -> Result<(), ProtocolError> {
    let config = ctx.config;
    let tls = ctx.tls;

    let version = tls
        .client_version()
        .map_or(config.highest_version, |offered| offered.min(config.highest_version));
    hello.version.set_computed(version);
    hello.random.compute_if_unset(|| ctx.random_bytes(RANDOM_LEN));
    prepare_session_id(&mut hello.session_id, &mut hello.session_id_length)?;

    let suite = config
        .cipher_suites
        .iter()
        .copied()
        .find(|suite| tls.offered_suites().contains(suite))
        .or_else(|| config.cipher_suites.first().copied());
    if let Some(suite) = suite {
        hello.cipher_suite.set_computed(suite);
    }
    hello.compression_method.set_computed(0);

    prepare_extensions(&mut hello.extensions, &mut hello.extensions_length)
}

fn prepare_finished(
    finished: &mut Finished,
    ctx: &mut PrepareContext<'_>,
) -> Result<(), PipelineError> {
    let verify_data = ctx.crypto.verify_data(ctx.role(), ctx.tls.transcript())?;
    finished.verify_data.set_computed(verify_data);
    Ok(())
}

fn prepare_session_id(
    session_id: &mut Overridable<Bytes>,
    length: &mut Overridable<u8>,
) -> Result<(), ProtocolError> {
    session_id.compute_if_unset(Bytes::new);
    let len = session_id.resolve("session_id")?.len();
    length.set_computed(fit_u8("session_id_length", len)?);
    Ok(())
}

fn prepare_extensions(
    extensions: &mut [Extension],
    length: &mut Overridable<u16>,
) -> Result<(), ProtocolError> {
    for extension in extensions.iter_mut() {
        extension.compute_length()?;
    }
    if !extensions.is_empty() {
        length.set_computed(fit_u16("extensions_length", extensions_block_len(extensions)?)?);
    }
    Ok(())
}

fn apply_handshake(
    message: &HandshakeMessage,
    state: &mut ConnectionState,
    direction: Direction,
) -> Result<(), AdjustmentError> {
    let mut encoded = BytesMut::new();
    message.encode(&mut encoded)?;

    // A received Finished is checked against the transcript that precedes it.
    let expected_verify_data = match (&message.body, direction) {
        (HandshakeBody::Finished(_), Direction::Inbound) => {
            Some(state.crypto().verify_data(state.role().peer(), state.tls.transcript())?)
        },
        _ => None,
    };
    state.tls.transcript.extend_from_slice(&encoded);

    match &message.body {
        HandshakeBody::ClientHello(hello) => apply_client_hello(hello, state),
        HandshakeBody::ServerHello(hello) => apply_server_hello(hello, state, direction),
        HandshakeBody::ServerHelloDone => {
            state.tls.server_hello_done = true;
            Ok(())
        },
        HandshakeBody::Finished(finished) => {
            apply_finished(finished, expected_verify_data, state, direction)
        },
        HandshakeBody::Opaque(_) => Ok(()),
    }
}

fn apply_client_hello(
    hello: &ClientHello,
    state: &mut ConnectionState,
) -> Result<(), AdjustmentError> {
    state.tls.client_version = Some(hello.version.value("client_hello.version")?);
    state.tls.client_random = Some(hello.random.resolve("client_hello.random")?.clone());
    state.tls.offered_suites = hello.cipher_suites.resolve("client_hello.cipher_suites")?.clone();
    Ok(())
}

fn apply_server_hello(
    hello: &ServerHello,
    state: &mut ConnectionState,
    direction: Direction,
) -> Result<(), AdjustmentError> {
    let version = hello.version.value("server_hello.version")?;
    let suite = hello.cipher_suite.value("server_hello.cipher_suite")?;
    state.tls.server_random = Some(hello.random.resolve("server_hello.random")?.clone());
    state.tls.session_id = Some(hello.session_id.resolve("server_hello.session_id")?.clone());
    state.tls.selected_version = Some(version);
    state.tls.selected_suite = Some(suite);

    if let Some(extension) = hello.extension(ExtensionType::MAX_FRAGMENT_LENGTH) {
        let data = extension.data.resolve("extension.data")?;
        let limit = match data.as_ref() {
            [code] => max_fragment_length_from_code(*code),
            _ => None,
        };
        let Some(limit) = limit else {
            return Err(AdjustmentError::Unsupported {
                field: "max_fragment_length",
                value: format!("{:02x?}", data.as_ref()),
                reason: "not a defined fragment length code".to_string(),
            });
        };
        state.tls.max_fragment_length = Some(limit);
    }

    if direction == Direction::Inbound {
        if !state.tls.offered_suites.contains(&suite) {
            return Err(AdjustmentError::Unsupported {
                field: "server_hello.cipher_suite",
                value: suite.to_string(),
                reason: "not offered in the ClientHello".to_string(),
            });
        }
        if version > state.config().highest_version {
            return Err(AdjustmentError::Unsupported {
                field: "server_hello.version",
                value: version.to_string(),
                reason: format!("above {}", state.config().highest_version),
            });
        }
    }
    Ok(())
}

fn apply_finished(
    finished: &Finished,
    expected: Option<Bytes>,
    state: &mut ConnectionState,
    direction: Direction,
) -> Result<(), AdjustmentError> {
    let verify_data = finished.verify_data.resolve("finished.verify_data")?.clone();
    let sender = match direction {
        Direction::Outbound => state.role(),
        Direction::Inbound => state.role().peer(),
    };
    match sender {
        Role::Client => state.tls.client_verify_data = Some(verify_data.clone()),
        Role::Server => state.tls.server_verify_data = Some(verify_data.clone()),
    }

    match expected {
        Some(expected) if expected != verify_data => Err(AdjustmentError::Inconsistent {
            unit: "Finished",
            reason: "verify data does not match the transcript".to_string(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use fracture_proto::tls::{CipherSuite, ProtocolVersion};

    use super::*;
    use crate::state::ConnectionConfig;

    fn client() -> ConnectionState {
        ConnectionState::new(ConnectionConfig::client().with_seed(1)).unwrap()
    }

    fn prepared(body: HandshakeBody, state: &mut ConnectionState) -> TlsMessage {
        let mut message = TlsMessage::Handshake(HandshakeMessage::new(body));
        message.compute_defaults(&mut state.prepare_context()).unwrap();
        message
    }

    /// Frames a body with its true length and no other defaults.
    fn framed(body: HandshakeBody) -> TlsMessage {
        let mut encoded = BytesMut::new();
        body.encode(&mut encoded).unwrap();
        let mut message = HandshakeMessage::new(body);
        message.length = Overridable::computed(encoded.len() as u32);
        TlsMessage::Handshake(message)
    }

    fn server_hello(suite: CipherSuite) -> ServerHello {
        ServerHello {
            version: Overridable::computed(ProtocolVersion::TLS1_2),
            random: Overridable::computed(Bytes::from_static(&[7; 32])),
            session_id_length: Overridable::computed(0),
            session_id: Overridable::computed(Bytes::new()),
            cipher_suite: Overridable::computed(suite),
            compression_method: Overridable::computed(0),
            ..ServerHello::default()
        }
    }

    fn client_hello(message: &TlsMessage) -> (&ClientHello, Option<u32>) {
        match message {
            TlsMessage::Handshake(HandshakeMessage {
                body: HandshakeBody::ClientHello(hello),
                length,
                ..
            }) => (hello, length.get().copied()),
            other => panic!("not a ClientHello: {other:?}"),
        }
    }

    #[test]
    fn client_hello_defaults_follow_config() {
        let mut state = client();
        let message = prepared(HandshakeBody::ClientHello(ClientHello::default()), &mut state);
        let (hello, length) = client_hello(&message);

        assert_eq!(hello.cipher_suites.get(), Some(&state.config().cipher_suites));
        assert_eq!(hello.cipher_suites_length.get(), Some(&4));
        assert_eq!(hello.random.get().map(Bytes::len), Some(32));
        // version(2) random(32) sid(1) suites(2+4) compression(1+1)
        assert_eq!(length, Some(43));
    }

    #[test]
    fn explicit_suite_list_survives_defaults() {
        let mut state = client();
        let hello = ClientHello {
            cipher_suites: Overridable::explicit(vec![CipherSuite::TLS_NULL_WITH_NULL_NULL]),
            ..ClientHello::default()
        };
        let message = prepared(HandshakeBody::ClientHello(hello), &mut state);
        let (hello, _) = client_hello(&message);

        assert_eq!(hello.cipher_suites.get(), Some(&vec![CipherSuite::TLS_NULL_WITH_NULL_NULL]));
        assert_eq!(hello.cipher_suites_length.get(), Some(&2));
    }

    #[test]
    fn unoffered_suite_is_recorded_then_rejected() {
        let mut state = client();
        let hello = prepared(HandshakeBody::ClientHello(ClientHello::default()), &mut state);
        hello.apply_effects(&mut state, Direction::Outbound).unwrap();

        let suite = CipherSuite::TLS_RSA_WITH_3DES_EDE_CBC_SHA;
        let reply = framed(HandshakeBody::ServerHello(server_hello(suite)));
        let err = reply.apply_effects(&mut state, Direction::Inbound).unwrap_err();

        assert!(matches!(
            err,
            AdjustmentError::Unsupported { field: "server_hello.cipher_suite", .. }
        ));
        // Effects applied before the check stay in place.
        assert_eq!(state.tls().selected_suite(), Some(suite));
        assert_eq!(state.tls().server_random().map(|r| r[0]), Some(7));
    }

    #[test]
    fn undefined_fragment_length_code_is_unsupported() {
        let mut state = client();
        let mut hello = server_hello(CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA);
        let mut extension = Extension::new(ExtensionType::MAX_FRAGMENT_LENGTH, vec![9u8]);
        extension.compute_length().unwrap();
        hello.extensions.push(extension);
        hello.extensions_length = Overridable::computed(5);

        let err =
            framed(HandshakeBody::ServerHello(hello)).apply_effects(&mut state, Direction::Inbound);

        assert!(matches!(
            err,
            Err(AdjustmentError::Unsupported { field: "max_fragment_length", .. })
        ));
        assert_eq!(state.tls().max_fragment_length(), None);
    }

    #[test]
    fn defined_fragment_length_code_limits_records() {
        let mut state = client();
        let hello = prepared(HandshakeBody::ClientHello(ClientHello::default()), &mut state);
        hello.apply_effects(&mut state, Direction::Outbound).unwrap();

        let mut reply = server_hello(CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA);
        let mut extension = Extension::new(ExtensionType::MAX_FRAGMENT_LENGTH, vec![2u8]);
        extension.compute_length().unwrap();
        reply.extensions.push(extension);
        reply.extensions_length = Overridable::computed(5);
        framed(HandshakeBody::ServerHello(reply))
            .apply_effects(&mut state, Direction::Inbound)
            .unwrap();

        assert_eq!(state.max_fragment_length(), 1024);
    }

    #[test]
    fn transcript_grows_in_both_directions() {
        let mut state = client();
        let hello = prepared(HandshakeBody::ClientHello(ClientHello::default()), &mut state);
        hello.apply_effects(&mut state, Direction::Outbound).unwrap();
        assert_eq!(state.tls().transcript().len(), 47);

        let done = prepared(HandshakeBody::ServerHelloDone, &mut state);
        done.apply_effects(&mut state, Direction::Inbound).unwrap();
        assert_eq!(state.tls().transcript().len(), 51);
        assert!(state.tls().server_hello_done());
    }

    #[test]
    fn change_cipher_spec_needs_negotiated_suite() {
        let mut state = client();
        let mut ccs = TlsMessage::ChangeCipherSpec(Default::default());
        ccs.compute_defaults(&mut state.prepare_context()).unwrap();
        assert!(matches!(
            ccs.apply_effects(&mut state, Direction::Outbound),
            Err(AdjustmentError::Inconsistent { unit: "ChangeCipherSpec", .. })
        ));
    }

    #[test]
    fn tampered_finished_is_inconsistent() {
        let mut state = client();
        let verify_data = Overridable::explicit(Bytes::from_static(&[1; 12]));
        let finished = Finished { verify_data };
        let err = framed(HandshakeBody::Finished(finished))
            .apply_effects(&mut state, Direction::Inbound)
            .unwrap_err();

        assert!(matches!(err, AdjustmentError::Inconsistent { unit: "Finished", .. }));
        assert_eq!(state.tls().server_verify_data().map(|v| v[0]), Some(1));
    }

    #[test]
    fn matching_finished_is_accepted() {
        let mut state = client();
        let finished = prepared(HandshakeBody::Finished(Finished::default()), &mut state);
        finished.apply_effects(&mut state, Direction::Inbound).unwrap();
        assert_eq!(state.tls().server_verify_data().map(Bytes::len), Some(12));
    }
}
