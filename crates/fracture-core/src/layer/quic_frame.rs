//! QUIC frame layer.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use fracture_proto::{
    quic::{CryptoFrame, Frame, PacketSpace, StreamFrame},
    tls::ContentType,
};
use tracing::trace;

use super::{
    Chunk, Layer, LayerKind, LayerOutput, LayerProcessingResult, SendRequest, misrouted,
    send_configured,
};
use crate::{
    error::PipelineError,
    pipeline,
    state::ConnectionState,
    unit::WireUnit,
    units::{QuicFrame, Unit},
};

/// Largest CRYPTO or STREAM payload cut from one upper chunk.
const MAX_FRAME_DATA: usize = 1000;

/// Largest frame payload packed into one packet.
const MAX_PACKET_PAYLOAD: usize = 1100;

#[derive(Debug, Default)]
struct CryptoStream {
    next: u64,
    pending: BTreeMap<u64, Bytes>,
}

impl CryptoStream {
    /// Stores `data` at `offset` and returns whatever became contiguous.
    fn insert(&mut self, offset: u64, data: Bytes) -> Option<Bytes> {
        let end = offset + data.len() as u64;
        if end <= self.next {
            return None;
        }
        let kept = self.pending.entry(offset).or_default();
        if data.len() > kept.len() {
            *kept = data;
        }

        let mut ready = BytesMut::new();
        while let Some(entry) = self.pending.first_entry() {
            let start = *entry.key();
            if start > self.next {
                break;
            }
            let data = entry.remove();
            let end = start + data.len() as u64;
            if end > self.next {
                ready.extend_from_slice(&data[(self.next - start) as usize..]);
                self.next = end;
            }
        }
        (!ready.is_empty()).then(|| ready.freeze())
    }

    fn buffered(&self) -> usize {
        self.pending.values().map(Bytes::len).sum()
    }
}

/// Carries upper-layer data in CRYPTO and STREAM frames and packs frames
/// into per-space packet payloads.
///
/// Handshake chunks become CRYPTO frames in their packet number space.
/// Application data, or any chunk once a stream is hinted, becomes STREAM
/// frames in the application space. Received CRYPTO data is reassembled
/// in offset order before being passed up; STREAM data is passed up as it
/// arrives.
#[derive(Debug, Default)]
pub struct QuicFrameLayer {
    crypto: BTreeMap<PacketSpace, CryptoStream>,
}

impl QuicFrameLayer {
    /// Creates the layer with no reassembly state.
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Default)]
struct Packing {
    chunks: BTreeMap<PacketSpace, Vec<Chunk>>,
}

impl Packing {
    fn push(&mut self, space: PacketSpace, bytes: Bytes, ack_eliciting: bool) {
        let chunks = self.chunks.entry(space).or_default();
        match chunks.last_mut() {
            Some(last) if last.data.len() + bytes.len() <= MAX_PACKET_PAYLOAD => {
                let mut data = BytesMut::from(&last.data[..]);
                data.extend_from_slice(&bytes);
                last.data = data.freeze();
                last.ack_eliciting |= ack_eliciting;
            },
            _ => chunks.push(Chunk::new(bytes).in_space(space).ack_eliciting(ack_eliciting)),
        }
    }

    fn into_chunks(self) -> Vec<Chunk> {
        self.chunks.into_values().flatten().collect()
    }
}

impl Layer for QuicFrameLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::QuicFrame
    }

    fn send(
        &mut self,
        request: SendRequest,
        state: &mut ConnectionState,
    ) -> Result<LayerOutput, PipelineError> {
        let mut result = LayerProcessingResult::new(LayerKind::QuicFrame);
        let mut packing = Packing::default();
        let hints = request.hints;

        let mut frames = Vec::new();
        for configured in request.units {
            let frame = match configured.unit {
                Unit::QuicFrame(frame) => frame,
                other => return Err(misrouted(LayerKind::QuicFrame, &other)),
            };
            frames.push((frame, configured.should_prepare));
        }
        for chunk in request.chunks {
            result.bytes_consumed += chunk.data.len();
            let stream_id = chunk.stream_id.or(hints.stream_id).or_else(|| {
                (chunk.content_type == Some(ContentType::APPLICATION_DATA)).then_some(0)
            });
            let space = match stream_id {
                Some(_) => PacketSpace::Application,
                None => chunk.space.or(hints.packet_space).unwrap_or(PacketSpace::Initial),
            };
            let mut data = chunk.data;
            loop {
                let piece = data.split_to(data.len().min(MAX_FRAME_DATA));
                let frame = match stream_id {
                    Some(id) => Frame::Stream(StreamFrame::new(id, piece)),
                    None => Frame::Crypto(CryptoFrame::new(piece)),
                };
                frames.push((QuicFrame::new(space, frame), true));
                if data.is_empty() {
                    break;
                }
            }
        }

        for (mut frame, should_prepare) in frames {
            if let Some(bytes) = send_configured(&mut frame, should_prepare, state, &mut result)? {
                packing.push(frame.space, bytes, frame.ack_eliciting());
            }
            result.record_unit(frame);
        }

        let chunks = packing.into_chunks();
        trace!(frames = result.units.len(), payloads = chunks.len(), "frames packed");
        Ok(LayerOutput::new(result, chunks))
    }

    fn receive(&mut self, chunks: Vec<Chunk>, state: &mut ConnectionState) -> LayerOutput {
        let mut result = LayerProcessingResult::new(LayerKind::QuicFrame);
        let mut upward = Vec::new();

        for chunk in chunks {
            result.bytes_consumed += chunk.data.len();
            let space = chunk.space.unwrap_or(PacketSpace::Initial);
            let mut rest = &chunk.data[..];

            while !rest.is_empty() {
                let (frame, consumed) = match pipeline::decode::<Frame>(rest, &()) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        result.record_error(err);
                        break;
                    },
                };
                rest = &rest[consumed..];
                let frame = QuicFrame::new(space, frame);
                if let Some(adjustment) = pipeline::apply_inbound(&frame, state) {
                    result.record_error(adjustment);
                }

                match &frame.frame {
                    Frame::Crypto(crypto) => {
                        let offset = crypto.offset.get().copied().unwrap_or(0);
                        let data = crypto.data.get().cloned().unwrap_or_default();
                        let stream = self.crypto.entry(space).or_default();
                        if let Some(ready) = stream.insert(offset, data) {
                            upward.push(
                                Chunk::new(ready)
                                    .with_content_type(ContentType::HANDSHAKE)
                                    .in_space(space),
                            );
                        }
                    },
                    Frame::Stream(stream) => {
                        let data = stream.data.get().cloned().unwrap_or_default();
                        let mut up = Chunk::new(data)
                            .with_content_type(ContentType::APPLICATION_DATA)
                            .in_space(space);
                        up.stream_id = stream.stream_id.get().copied();
                        upward.push(up);
                    },
                    _ => {},
                }
                result.record_unit(frame);
            }
        }

        result.buffered = self.buffered();
        LayerOutput::new(result, upward)
    }

    fn buffered(&self) -> usize {
        self.crypto.values().map(CryptoStream::buffered).sum()
    }
}

#[cfg(test)]
mod tests {
    use fracture_proto::quic::{AckFrame, frame_type};

    use super::*;
    use crate::{
        state::ConnectionConfig,
        unit::{ConfiguredUnit, UnitKind},
    };

    fn state() -> ConnectionState {
        ConnectionState::new(ConnectionConfig::client().with_seed(5)).unwrap()
    }

    fn handshake(data: impl Into<Bytes>, space: PacketSpace) -> Chunk {
        Chunk::new(data).with_content_type(ContentType::HANDSHAKE).in_space(space)
    }

    fn crypto_frame(offset: u64, data: &'static [u8]) -> Vec<u8> {
        let mut frame = CryptoFrame::new(data);
        frame.offset.set_computed(offset);
        frame.length.set_computed(data.len() as u64);
        let mut out = Vec::new();
        Frame::Crypto(frame).encode(&mut out).unwrap();
        out
    }

    #[test]
    fn crypto_data_is_split_and_packed_per_space() {
        let mut layer = QuicFrameLayer::new();
        let mut state = state();
        let request = SendRequest {
            chunks: vec![
                handshake(vec![1u8; 2500], PacketSpace::Initial),
                handshake(vec![2u8; 10], PacketSpace::Handshake),
            ],
            ..Default::default()
        };

        let out = layer.send(request, &mut state).unwrap();
        assert_eq!(out.result.units.len(), 4);
        let spaces: Vec<_> = out.chunks.iter().map(|c| c.space).collect();
        assert_eq!(
            spaces,
            vec![
                Some(PacketSpace::Initial),
                Some(PacketSpace::Initial),
                Some(PacketSpace::Initial),
                Some(PacketSpace::Handshake)
            ]
        );
        assert!(out.chunks.iter().all(|c| c.ack_eliciting));
        assert_eq!(state.quic().space(PacketSpace::Initial).crypto_sent(), 2500);
    }

    #[test]
    fn application_data_goes_to_a_stream() {
        let mut layer = QuicFrameLayer::new();
        let mut state = state();
        let chunk = Chunk::new(&b"hi"[..]).with_content_type(ContentType::APPLICATION_DATA);
        let request = SendRequest { chunks: vec![chunk], ..Default::default() };

        let out = layer.send(request, &mut state).unwrap();
        assert_eq!(out.chunks[0].space, Some(PacketSpace::Application));
        assert_eq!(out.result.kinds(), vec![UnitKind::QuicFrame(frame_type::STREAM)]);
        assert_eq!(state.quic().stream_sent(0), 2);
    }

    #[test]
    fn configured_ack_is_not_ack_eliciting() {
        let mut layer = QuicFrameLayer::new();
        let mut state = state();
        state.quic.space_mut(PacketSpace::Initial).received.insert(0);
        state.quic.space_mut(PacketSpace::Initial).largest_received = Some(0);
        let ack = QuicFrame::new(PacketSpace::Initial, Frame::Ack(AckFrame::default()));
        let request =
            SendRequest { units: vec![ConfiguredUnit::prepared(ack)], ..Default::default() };

        let out = layer.send(request, &mut state).unwrap();
        assert_eq!(out.chunks.len(), 1);
        assert!(!out.chunks[0].ack_eliciting);
    }

    #[test]
    fn out_of_order_crypto_is_reassembled() {
        let mut layer = QuicFrameLayer::new();
        let mut state = state();
        let chunk = |bytes: Vec<u8>| Chunk::new(bytes).in_space(PacketSpace::Handshake);

        let early = layer.receive(vec![chunk(crypto_frame(3, b"def"))], &mut state);
        assert!(early.chunks.is_empty());
        assert_eq!(early.result.buffered, 3);

        let late = layer.receive(vec![chunk(crypto_frame(0, b"abc"))], &mut state);
        assert_eq!(late.chunks.len(), 1);
        assert_eq!(&late.chunks[0].data[..], b"abcdef");
        assert_eq!(late.chunks[0].content_type, Some(ContentType::HANDSHAKE));
        assert_eq!(late.chunks[0].space, Some(PacketSpace::Handshake));
        assert_eq!(late.result.buffered, 0);
        assert!(state.quic().space(PacketSpace::Handshake).ack_pending());
    }

    #[test]
    fn malformed_frame_stops_the_payload() {
        let mut layer = QuicFrameLayer::new();
        let mut state = state();
        let out = layer.receive(vec![Chunk::new(&[0x01u8, 0x06, 0x00][..])], &mut state);
        assert_eq!(out.result.kinds(), vec![UnitKind::QuicFrame(frame_type::PING)]);
        assert_eq!(out.result.errors.len(), 1);
    }

    #[test]
    fn duplicate_crypto_is_ignored() {
        let mut stream = CryptoStream::default();
        assert_eq!(stream.insert(0, Bytes::from_static(b"ab")), Some(Bytes::from_static(b"ab")));
        assert_eq!(stream.insert(0, Bytes::from_static(b"ab")), None);
        assert_eq!(stream.insert(1, Bytes::from_static(b"bcd")), Some(Bytes::from_static(b"cd")));
    }
}
