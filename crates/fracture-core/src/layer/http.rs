//! HTTP/1.1 layer.

use bytes::{Buf, BytesMut};
use fracture_proto::{ProtocolError, http::HttpMessage};

use super::{
    Chunk, Layer, LayerKind, LayerOutput, LayerProcessingResult, SendRequest, misrouted,
    send_configured,
};
use crate::{error::PipelineError, pipeline, state::ConnectionState, units::Unit};

/// Encodes HTTP messages into chunks and decodes them from a byte stream.
///
/// This is always the top layer, so upper chunks are rejected and received
/// messages are not passed further up.
#[derive(Debug, Default)]
pub struct HttpLayer {
    buffer: BytesMut,
}

impl HttpLayer {
    /// Creates the layer with an empty receive buffer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for HttpLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Http
    }

    fn send(
        &mut self,
        request: SendRequest,
        state: &mut ConnectionState,
    ) -> Result<LayerOutput, PipelineError> {
        if !request.chunks.is_empty() {
            return Err(PipelineError::Configuration(
                "the HTTP layer has no layer above it".to_string(),
            ));
        }
        let mut result = LayerProcessingResult::new(LayerKind::Http);
        let mut chunks = Vec::new();
        for configured in request.units {
            let mut message = match configured.unit {
                Unit::Http(message) => message,
                other => return Err(misrouted(LayerKind::Http, &other)),
            };
            if let Some(bytes) =
                send_configured(&mut message, configured.should_prepare, state, &mut result)?
            {
                chunks.push(Chunk::new(bytes));
            }
            result.record_unit(message);
        }
        Ok(LayerOutput::new(result, chunks))
    }

    fn receive(&mut self, chunks: Vec<Chunk>, state: &mut ConnectionState) -> LayerOutput {
        let mut result = LayerProcessingResult::new(LayerKind::Http);
        for chunk in chunks {
            result.bytes_consumed += chunk.data.len();
            self.buffer.extend_from_slice(&chunk.data);
        }

        while !self.buffer.is_empty() {
            match pipeline::receive::<HttpMessage>(&self.buffer, &(), state) {
                Ok(inbound) => {
                    self.buffer.advance(inbound.consumed);
                    if let Some(adjustment) = inbound.adjustment {
                        result.record_error(adjustment);
                    }
                    result.record_unit(inbound.unit);
                },
                Err(ProtocolError::Incomplete { .. }) => break,
                Err(err) => {
                    result.record_error(err);
                    self.buffer.clear();
                },
            }
        }

        result.buffered = self.buffer.len();
        LayerOutput::new(result, Vec::new())
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{state::ConnectionConfig, unit::ConfiguredUnit};

    fn state() -> ConnectionState {
        ConnectionState::new(ConnectionConfig::server()).unwrap()
    }

    #[test]
    fn request_becomes_one_chunk() {
        let mut state = ConnectionState::new(ConnectionConfig::client()).unwrap();
        let request = SendRequest {
            units: vec![ConfiguredUnit::prepared(HttpMessage::request("GET", "/"))],
            ..Default::default()
        };
        let out = HttpLayer::new().send(request, &mut state).unwrap();
        assert_eq!(&out.chunks[0].data[..], b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(state.http().requests_sent(), 1);
    }

    #[test]
    fn body_split_across_chunks_waits_for_content_length() {
        let mut layer = HttpLayer::new();
        let mut state = state();
        let head = Chunk::new(&b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nab"[..]);
        let first = layer.receive(vec![head], &mut state);
        assert!(first.result.units.is_empty());

        let second = layer.receive(vec![Chunk::new(&b"cd"[..])], &mut state);
        let message = second.result.units[0].as_http().unwrap();
        assert_eq!(message.body.get().map(|b| &b[..]), Some(&b"abcd"[..]));
        assert_eq!(state.http().requests_received(), 1);
        assert_eq!(layer.buffered(), 0);
    }

    #[test]
    fn malformed_header_is_recorded() {
        let mut layer = HttpLayer::new();
        let chunk = Chunk::new(&b"GET / HTTP/1.1\r\nbroken\r\n\r\n"[..]);
        let out = layer.receive(vec![chunk], &mut state());
        assert_eq!(out.result.errors.len(), 1);
        assert_eq!(layer.buffered(), 0);
    }
}
