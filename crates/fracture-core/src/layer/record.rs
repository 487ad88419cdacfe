//! TLS record layer.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};
use fracture_proto::{
    ProtocolError,
    tls::{ContentType, Record},
};
use tracing::{debug, trace};

use super::{
    Chunk, Layer, LayerKind, LayerOutput, LayerProcessingResult, SendRequest, misrouted,
    send_configured,
};
use crate::{
    error::PipelineError,
    pipeline,
    state::ConnectionState,
    unit::ConfiguredUnit,
    units::{Unit, open_record},
};

/// Fragments content-typed chunks into records and protects them.
///
/// Records configured with their own payload are sent first, as given.
/// Records configured without payload act as templates: each fragment of
/// upper data is poured into the next template (keeping whatever fields the
/// template pins) before fresh records are created.
///
/// Fragment sizes come from, in order: the explicit record lengths in the
/// hints, the hinted maximum fragment length, and finally the negotiated
/// or configured maximum fragment length.
#[derive(Debug, Default)]
pub struct RecordLayer {
    buffer: BytesMut,
}

impl RecordLayer {
    /// Creates the layer with an empty receive buffer.
    pub fn new() -> Self {
        Self::default()
    }
}

struct Fragmenter {
    explicit: VecDeque<usize>,
    max: usize,
}

impl Fragmenter {
    fn next_len(&mut self, remaining: usize) -> usize {
        self.explicit.pop_front().unwrap_or(self.max).min(remaining)
    }

    fn split(&mut self, mut data: Bytes) -> Vec<Bytes> {
        let mut pieces = Vec::new();
        loop {
            let len = self.next_len(data.len());
            pieces.push(data.split_to(len));
            if data.is_empty() {
                return pieces;
            }
        }
    }
}

impl Layer for RecordLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Record
    }

    fn send(
        &mut self,
        request: SendRequest,
        state: &mut ConnectionState,
    ) -> Result<LayerOutput, PipelineError> {
        let mut result = LayerProcessingResult::new(LayerKind::Record);
        let mut wire = BytesMut::new();
        let mut templates = VecDeque::new();
        let hints = request.hints;

        for mut configured in request.units {
            let Unit::Record(record) = &mut configured.unit else {
                return Err(misrouted(LayerKind::Record, &configured.unit));
            };
            if !record.has_payload() {
                templates.push_back(configured);
                continue;
            }
            if let Some(bytes) =
                send_configured(record, configured.should_prepare, state, &mut result)?
            {
                wire.extend_from_slice(&bytes);
            }
            result.record_unit(configured.unit);
        }

        let mut fragmenter = Fragmenter {
            explicit: hints.record_lengths.iter().copied().collect(),
            max: hints.max_fragment_length.unwrap_or_else(|| state.max_fragment_length()).max(1),
        };
        let default_type = hints.content_type.unwrap_or(ContentType::APPLICATION_DATA);

        for chunk in request.chunks {
            result.bytes_consumed += chunk.data.len();
            let content_type = chunk.content_type.unwrap_or(default_type);
            for piece in fragmenter.split(chunk.data) {
                let (mut record, should_prepare) = match templates.pop_front() {
                    Some(ConfiguredUnit { unit: Unit::Record(record), should_prepare }) => {
                        (record, should_prepare)
                    },
                    _ => (Record::default(), true),
                };
                record.content_type.set_computed(content_type);
                record.computations.plaintext.set_computed(piece);
                let sent = send_configured(&mut record, should_prepare, state, &mut result)?;
                if let Some(bytes) = sent {
                    wire.extend_from_slice(&bytes);
                }
                result.record_unit(record);
            }
        }

        for template in templates {
            let ConfiguredUnit { unit: Unit::Record(mut record), should_prepare } = template else {
                continue;
            };
            record.content_type.set_computed(default_type);
            record.computations.plaintext.set_computed(Bytes::new());
            if let Some(bytes) = send_configured(&mut record, should_prepare, state, &mut result)? {
                wire.extend_from_slice(&bytes);
            }
            result.record_unit(record);
        }

        debug!(records = result.units.len(), bytes = wire.len(), "records framed");
        let chunks = if wire.is_empty() { Vec::new() } else { vec![Chunk::new(wire.freeze())] };
        Ok(LayerOutput::new(result, chunks))
    }

    fn receive(&mut self, chunks: Vec<Chunk>, state: &mut ConnectionState) -> LayerOutput {
        let mut result = LayerProcessingResult::new(LayerKind::Record);
        let mut upward = Vec::new();

        for chunk in chunks {
            result.bytes_consumed += chunk.data.len();
            self.buffer.extend_from_slice(&chunk.data);
        }

        while !self.buffer.is_empty() {
            let (mut record, consumed) = match pipeline::decode::<Record>(&self.buffer, &()) {
                Ok(decoded) => decoded,
                Err(ProtocolError::Incomplete { .. }) => break,
                Err(err) => {
                    result.record_error(err);
                    self.buffer.clear();
                    break;
                },
            };
            self.buffer.advance(consumed);

            let opened = open_record(&mut record, state);
            if let Some(adjustment) = pipeline::apply_inbound(&record, state) {
                result.record_error(adjustment);
            }
            match opened {
                Ok(()) => {
                    let content_type = record.content_type.get().copied();
                    let plaintext = record.computations.plaintext.get().cloned();
                    trace!(?content_type, consumed, "record opened");
                    if let (Some(content_type), Some(plaintext)) = (content_type, plaintext) {
                        upward.push(Chunk::new(plaintext).with_content_type(content_type));
                    }
                },
                Err(err) => result.record_error(err),
            }
            result.record_unit(record);
        }

        result.buffered = self.buffer.len();
        LayerOutput::new(result, upward)
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use fracture_proto::{
        Overridable,
        tls::{CipherSuite, ProtocolVersion},
    };

    use super::*;
    use crate::{
        crypto::CryptoError,
        layer::LayerHints,
        state::{ConnectionConfig, Direction},
        unit::WireUnit,
    };

    fn state() -> ConnectionState {
        ConnectionState::new(ConnectionConfig::client().with_seed(1)).unwrap()
    }

    fn handshake(data: &'static [u8]) -> Chunk {
        Chunk::new(data).with_content_type(ContentType::HANDSHAKE)
    }

    fn plaintext_lengths(result: &LayerProcessingResult) -> Vec<usize> {
        result
            .units
            .iter()
            .filter_map(|unit| unit.as_record())
            .map(|record| record.computations.plaintext.get().map_or(0, Bytes::len))
            .collect()
    }

    #[test]
    fn one_chunk_becomes_one_record_payload() {
        let mut layer = RecordLayer::new();
        let request =
            SendRequest { chunks: vec![handshake(b"\x0e\x00\x00\x00")], ..Default::default() };

        let out = layer.send(request, &mut state()).unwrap();
        assert_eq!(out.chunks.len(), 1);
        assert_eq!(&out.chunks[0].data[..], &[22, 3, 1, 0, 4, 14, 0, 0, 0]);
    }

    #[test]
    fn explicit_lengths_then_maximum_fragment() {
        let mut layer = RecordLayer::new();
        let hints = LayerHints {
            record_lengths: vec![1],
            max_fragment_length: Some(3),
            ..Default::default()
        };
        let request =
            SendRequest { hints, chunks: vec![handshake(b"abcdefgh")], ..Default::default() };

        let out = layer.send(request, &mut state()).unwrap();
        assert_eq!(plaintext_lengths(&out.result), vec![1, 3, 3, 1]);
        assert_eq!(out.result.bytes_produced, 8 + 4 * 5);
    }

    #[test]
    fn templates_keep_pinned_fields() {
        let mut layer = RecordLayer::new();
        let mut template = Record::default();
        template.version = Overridable::explicit(ProtocolVersion(0x0399));
        let leftover = Record::default();
        let request = SendRequest {
            units: vec![ConfiguredUnit::prepared(template), ConfiguredUnit::prepared(leftover)],
            chunks: vec![handshake(b"\x0e\x00\x00\x00")],
            ..Default::default()
        };

        let out = layer.send(request, &mut state()).unwrap();
        assert_eq!(&out.chunks[0].data[..9], &[22, 3, 0x99, 0, 4, 14, 0, 0, 0]);
        assert_eq!(&out.chunks[0].data[9..], &[23, 3, 1, 0, 0]);
        assert_eq!(plaintext_lengths(&out.result), vec![4, 0]);
    }

    #[test]
    fn records_split_across_chunks_are_buffered() {
        let mut layer = RecordLayer::new();
        let mut state = state();
        let first = layer.receive(vec![Chunk::new(&[21u8, 3, 3, 0, 2, 2][..])], &mut state);
        assert!(first.chunks.is_empty());
        assert_eq!(first.result.buffered, 6);

        let second =
            layer.receive(vec![Chunk::new(&[40u8, 23, 3, 3, 0, 1, 0xaa, 22][..])], &mut state);
        assert_eq!(second.chunks.len(), 2);
        assert_eq!(second.chunks[0].content_type, Some(ContentType::ALERT));
        assert_eq!(&second.chunks[0].data[..], &[2, 40]);
        assert_eq!(second.result.buffered, 1);
        assert_eq!(state.tls().read().next_sequence().number, 2);
    }

    #[test]
    fn bad_mac_is_recorded_and_not_delivered() {
        let suite = CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA;
        let config = ConnectionConfig::client().with_seed(1);
        let mut sender = ConnectionState::new(config.clone()).unwrap();
        let mut receiver = ConnectionState::new(config).unwrap();
        for state in [&mut sender, &mut receiver] {
            state.tls.selected_suite = Some(suite);
            state.tls.selected_version = Some(ProtocolVersion::TLS1_2);
            state.tls.client_random = Some(Bytes::from_static(&[1; 32]));
            state.tls.server_random = Some(Bytes::from_static(&[2; 32]));
        }
        let mut ccs = Record::with_content(ContentType::CHANGE_CIPHER_SPEC, &[1u8][..]);
        ccs.compute_defaults(&mut sender.prepare_context()).unwrap();
        ccs.apply_effects(&mut sender, Direction::Outbound).unwrap();

        let mut record = Record::with_content(ContentType::APPLICATION_DATA, &b"x"[..]);
        record.computations.mac = Overridable::explicit(Bytes::from(vec![9; 20]));
        let mut wire = WireUnit::encode(&ccs).unwrap().to_vec();
        record.compute_defaults(&mut sender.prepare_context()).unwrap();
        wire.extend_from_slice(&WireUnit::encode(&record).unwrap());

        let mut layer = RecordLayer::new();
        let out = layer.receive(vec![Chunk::new(wire)], &mut receiver);
        assert_eq!(out.chunks.len(), 1);
        assert_eq!(out.chunks[0].content_type, Some(ContentType::CHANGE_CIPHER_SPEC));
        assert_eq!(out.result.errors, vec![PipelineError::Crypto(CryptoError::BadMac)]);
        assert_eq!(receiver.tls().read().epoch(), 1);
    }
}
