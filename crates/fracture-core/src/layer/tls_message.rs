//! TLS message layer: handshake, alert, ChangeCipherSpec and application
//! data messages over content-typed chunks.

use std::collections::BTreeMap;

use bytes::{Buf, BytesMut};
use fracture_proto::{
    ProtocolError,
    quic::PacketSpace,
    tls::{ApplicationData, ContentType, TlsMessage},
};
use tracing::trace;

use super::{
    Chunk, Layer, LayerKind, LayerOutput, LayerProcessingResult, SendRequest, misrouted,
    send_configured,
};
use crate::{error::PipelineError, pipeline, state::ConnectionState, units::Unit};

/// Frames TLS messages into chunks tagged with their content type.
///
/// Consecutive handshake messages share one chunk so the layer below can
/// pack them into a single record. Handshake data that arrives split across
/// chunks is buffered per content type (and QUIC space) until complete.
#[derive(Debug, Default)]
pub struct TlsMessageLayer {
    buffers: BTreeMap<(ContentType, Option<PacketSpace>), BytesMut>,
}

impl TlsMessageLayer {
    /// Creates the layer with empty buffers.
    pub fn new() -> Self {
        Self::default()
    }
}

fn push_chunk(chunks: &mut Vec<Chunk>, chunk: Chunk) {
    if let Some(last) = chunks.last_mut() {
        let mergeable = chunk.content_type == Some(ContentType::HANDSHAKE)
            && last.content_type == chunk.content_type
            && last.space == chunk.space;
        if mergeable {
            let mut data = BytesMut::from(&last.data[..]);
            data.extend_from_slice(&chunk.data);
            last.data = data.freeze();
            return;
        }
    }
    chunks.push(chunk);
}

impl Layer for TlsMessageLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::TlsMessage
    }

    fn send(
        &mut self,
        request: SendRequest,
        state: &mut ConnectionState,
    ) -> Result<LayerOutput, PipelineError> {
        let mut result = LayerProcessingResult::new(LayerKind::TlsMessage);
        let mut chunks = Vec::new();
        let space = request.hints.packet_space;

        for mut configured in request.units {
            let Unit::Tls(message) = &mut configured.unit else {
                return Err(misrouted(LayerKind::TlsMessage, &configured.unit));
            };
            let content_type = message.content_type();
            if let Some(bytes) =
                send_configured(message, configured.should_prepare, state, &mut result)?
            {
                let mut chunk = Chunk::new(bytes).with_content_type(content_type);
                chunk.space = space;
                push_chunk(&mut chunks, chunk);
            }
            result.record_unit(configured.unit);
        }

        for upper in request.chunks {
            result.bytes_consumed += upper.data.len();
            let mut message = TlsMessage::ApplicationData(ApplicationData::new(upper.data));
            if let Some(bytes) = send_configured(&mut message, true, state, &mut result)? {
                let mut chunk =
                    Chunk::new(bytes).with_content_type(ContentType::APPLICATION_DATA);
                chunk.space = upper.space.or(space);
                chunk.stream_id = upper.stream_id;
                push_chunk(&mut chunks, chunk);
            }
            result.record_unit(message);
        }

        trace!(chunks = chunks.len(), produced = result.bytes_produced, "tls messages framed");
        Ok(LayerOutput::new(result, chunks))
    }

    fn receive(&mut self, chunks: Vec<Chunk>, state: &mut ConnectionState) -> LayerOutput {
        let mut result = LayerProcessingResult::new(LayerKind::TlsMessage);
        let mut upward = Vec::new();

        for chunk in chunks {
            result.bytes_consumed += chunk.data.len();
            let content_type = chunk.content_type.unwrap_or(ContentType::APPLICATION_DATA);
            let buffer = self.buffers.entry((content_type, chunk.space)).or_default();
            buffer.extend_from_slice(&chunk.data);

            while !buffer.is_empty() {
                match pipeline::receive::<TlsMessage>(&buffer[..], &content_type, state) {
                    Ok(inbound) => {
                        buffer.advance(inbound.consumed);
                        if let Some(adjustment) = inbound.adjustment {
                            result.record_error(adjustment);
                        }
                        if let TlsMessage::ApplicationData(app) = &inbound.unit {
                            let data = app.data.get().cloned().unwrap_or_default();
                            let mut up = Chunk::new(data)
                                .with_content_type(ContentType::APPLICATION_DATA);
                            up.space = chunk.space;
                            up.stream_id = chunk.stream_id;
                            upward.push(up);
                        }
                        result.record_unit(inbound.unit);
                    },
                    Err(ProtocolError::Incomplete { .. }) => break,
                    Err(err) => {
                        result.record_error(err);
                        buffer.clear();
                    },
                }
            }
        }

        self.buffers.retain(|_, buffer| !buffer.is_empty());
        result.buffered = self.buffered();
        LayerOutput::new(result, upward)
    }

    fn buffered(&self) -> usize {
        self.buffers.values().map(BytesMut::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use fracture_proto::tls::{
        Alert, AlertDescription, AlertLevel, HandshakeBody, HandshakeMessage, HandshakeType,
    };

    use super::*;
    use crate::{
        layer::LayerHints,
        state::ConnectionConfig,
        unit::{ConfiguredUnit, UnitKind},
    };

    fn state() -> ConnectionState {
        ConnectionState::new(ConnectionConfig::client().with_seed(7)).unwrap()
    }

    fn server_hello_done() -> HandshakeMessage {
        HandshakeMessage::new(HandshakeBody::ServerHelloDone)
    }

    #[test]
    fn consecutive_handshake_messages_share_a_chunk() {
        let mut layer = TlsMessageLayer::new();
        let mut state = state();
        let request = SendRequest {
            units: vec![
                ConfiguredUnit::prepared(server_hello_done()),
                ConfiguredUnit::prepared(server_hello_done()),
                ConfiguredUnit::prepared(Alert::new(
                    AlertLevel::WARNING,
                    AlertDescription::CLOSE_NOTIFY,
                )),
            ],
            hints: LayerHints::default(),
            chunks: Vec::new(),
        };

        let out = layer.send(request, &mut state).unwrap();
        assert_eq!(out.chunks.len(), 2);
        assert_eq!(&out.chunks[0].data[..], &[14, 0, 0, 0, 14, 0, 0, 0]);
        assert_eq!(out.chunks[1].content_type, Some(ContentType::ALERT));
        assert_eq!(out.result.units.len(), 3);
        assert_eq!(out.result.bytes_produced, 10);
    }

    #[test]
    fn upper_chunks_become_application_data() {
        let mut layer = TlsMessageLayer::new();
        let mut state = state();
        let request = SendRequest { chunks: vec![Chunk::new(&b"GET /"[..])], ..Default::default() };

        let out = layer.send(request, &mut state).unwrap();
        assert_eq!(out.chunks[0].content_type, Some(ContentType::APPLICATION_DATA));
        assert_eq!(out.result.kinds(), vec![UnitKind::ApplicationData]);
        assert_eq!(state.tls().app_data_sent(), 5);
    }

    #[test]
    fn handshake_split_across_chunks_is_reassembled() {
        let mut layer = TlsMessageLayer::new();
        let mut state = state();
        let hs = |data: &'static [u8]| {
            Chunk::new(Bytes::from_static(data)).with_content_type(ContentType::HANDSHAKE)
        };

        let first = layer.receive(vec![hs(&[14, 0])], &mut state);
        assert!(first.result.units.is_empty());
        assert_eq!(first.result.buffered, 2);

        let second = layer.receive(vec![hs(&[0, 0, 14])], &mut state);
        assert_eq!(
            second.result.kinds(),
            vec![UnitKind::Handshake(HandshakeType::SERVER_HELLO_DONE)]
        );
        assert_eq!(second.result.buffered, 1);
        assert!(state.tls().server_hello_done());
    }

    #[test]
    fn undefined_content_type_is_recorded_and_dropped() {
        let mut layer = TlsMessageLayer::new();
        let mut state = state();
        let chunk = Chunk::new(&b"\x01\x02"[..]).with_content_type(ContentType(99));

        let out = layer.receive(vec![chunk], &mut state);
        assert!(matches!(
            out.result.errors[0],
            PipelineError::Protocol(ProtocolError::Parse { .. })
        ));
        assert_eq!(layer.buffered(), 0);
    }

    #[test]
    fn application_data_is_passed_up() {
        let mut layer = TlsMessageLayer::new();
        let mut state = state();
        let chunk =
            Chunk::new(&b"hello"[..]).with_content_type(ContentType::APPLICATION_DATA).on_stream(4);

        let out = layer.receive(vec![chunk], &mut state);
        assert_eq!(out.chunks.len(), 1);
        assert_eq!(&out.chunks[0].data[..], b"hello");
        assert_eq!(out.chunks[0].stream_id, Some(4));
        assert_eq!(state.tls().app_data_received(), 5);
    }
}
