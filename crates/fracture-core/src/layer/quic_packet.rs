//! QUIC packet layer.

use bytes::{Bytes, BytesMut};
use fracture_proto::{
    Overridable,
    quic::{Packet, PacketSpace, PacketType, SAMPLE_LEN, apply_mask, peek_header},
};
use tracing::{debug, trace};

use super::{
    Chunk, Layer, LayerKind, LayerOutput, LayerProcessingResult, SendRequest, send_configured,
};
use crate::{error::PipelineError, pipeline, state::ConnectionState, units::Unit};

/// Wraps frame payloads in packets and packets in datagrams.
///
/// Each chunk from the frame layer becomes one packet of its space's type.
/// Packet numbers, header protection and payload sealing are derived by the
/// packet unit itself. Without the coalesce hint every packet is its own
/// datagram; with it, long-header packets share a datagram until a
/// short-header packet closes it.
#[derive(Debug, Default)]
pub struct QuicPacketLayer;

impl QuicPacketLayer {
    /// Creates the layer.
    pub fn new() -> Self {
        Self
    }
}

fn zero_extended_sample(packet: &[u8], offset: usize) -> [u8; SAMPLE_LEN] {
    let mut sample = [0u8; SAMPLE_LEN];
    let available = packet.get(offset..).unwrap_or_default();
    let n = available.len().min(SAMPLE_LEN);
    sample[..n].copy_from_slice(&available[..n]);
    sample
}

/// Removes header protection from one packet and decodes it, returning the
/// packet and its unprotected header bytes.
fn unprotect(
    packet: &[u8],
    packet_type: PacketType,
    pn_offset: usize,
    state: &ConnectionState,
) -> Result<(Packet, Bytes), PipelineError> {
    let space = packet_type.space();
    let sample = zero_extended_sample(packet, pn_offset + 4);
    let mask = state.crypto().quic_header_mask(space, &sample)?;
    let first = packet.first().copied().unwrap_or_default();
    let pn_len = usize::from((first ^ (mask[0] & packet_type.protected_bits())) & 0x03) + 1;

    let mut clear = packet.to_vec();
    apply_mask(&mut clear, packet_type, pn_offset, pn_len, &mask);
    let expected = state.quic().space(space).largest_received().map_or(0, |pn| pn + 1);
    let mut decoded =
        Packet::decode_unprotected(&clear, state.quic().local_cid().len(), expected)?;
    decoded.computations.header_mask = Overridable::computed(Bytes::copy_from_slice(&mask));
    clear.truncate((pn_offset + pn_len).min(clear.len()));
    Ok((decoded, clear.into()))
}

/// Opens the payload of an unprotected packet, filling in its plaintext.
fn open(packet: &mut Packet, header: &[u8], state: &ConnectionState) -> Result<(), PipelineError> {
    let space = packet.packet_type.space();
    let pn = packet.packet_number.value("packet.packet_number")?;
    let payload = packet.payload.resolve("packet.payload")?;
    let plaintext = state.crypto().quic_open(space, state.role().peer(), pn, header, payload)?;
    packet.computations.plaintext.set_computed(plaintext);
    Ok(())
}

impl Layer for QuicPacketLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::QuicPacket
    }

    fn send(
        &mut self,
        request: SendRequest,
        state: &mut ConnectionState,
    ) -> Result<LayerOutput, PipelineError> {
        let mut result = LayerProcessingResult::new(LayerKind::QuicPacket);
        let mut packets = Vec::new();

        for configured in request.units {
            let packet = match configured.unit {
                Unit::QuicPacket(packet) => packet,
                other => return Err(super::misrouted(LayerKind::QuicPacket, &other)),
            };
            packets.push((packet, configured.should_prepare));
        }
        for chunk in request.chunks {
            result.bytes_consumed += chunk.data.len();
            let space =
                chunk.space.or(request.hints.packet_space).unwrap_or(PacketSpace::Initial);
            let mut packet = Packet::new(space.packet_type());
            packet.computations.plaintext.set_computed(chunk.data);
            packet.computations.ack_eliciting = chunk.ack_eliciting;
            packets.push((packet, true));
        }

        let mut datagrams: Vec<BytesMut> = Vec::new();
        let mut open_datagram = false;
        for (mut packet, should_prepare) in packets {
            let Some(bytes) = send_configured(&mut packet, should_prepare, state, &mut result)?
            else {
                result.record_unit(packet);
                continue;
            };
            match datagrams.last_mut() {
                Some(datagram) if request.hints.coalesce && open_datagram => {
                    datagram.extend_from_slice(&bytes);
                },
                _ => datagrams.push(BytesMut::from(&bytes[..])),
            }
            open_datagram = packet.packet_type.is_long();
            trace!(kind = ?packet.packet_type, len = bytes.len(), "packet built");
            result.record_unit(packet);
        }

        debug!(packets = result.units.len(), datagrams = datagrams.len(), "packets sent");
        let chunks = datagrams.into_iter().map(|datagram| Chunk::new(datagram.freeze()));
        Ok(LayerOutput::new(result, chunks.collect()))
    }

    fn receive(&mut self, chunks: Vec<Chunk>, state: &mut ConnectionState) -> LayerOutput {
        let mut result = LayerProcessingResult::new(LayerKind::QuicPacket);
        let mut upward = Vec::new();

        for chunk in chunks {
            result.bytes_consumed += chunk.data.len();
            let mut rest = chunk.data;

            while !rest.is_empty() {
                let header = match peek_header(&rest, state.quic().local_cid().len()) {
                    Ok(header) => header,
                    Err(err) => {
                        result.record_error(err);
                        break;
                    },
                };
                let bytes = rest.split_to(header.packet_len.min(rest.len()));
                let space = header.packet_type.space();

                let unprotected = unprotect(&bytes, header.packet_type, header.pn_offset, state);
                let (mut packet, clear_header) = match unprotected {
                    Ok(unprotected) => unprotected,
                    Err(err) => {
                        result.record_error(err);
                        continue;
                    },
                };
                let opened = open(&mut packet, &clear_header, state);
                if let Some(adjustment) = pipeline::apply_inbound(&packet, state) {
                    result.record_error(adjustment);
                }
                match opened {
                    Ok(()) => {
                        let plaintext =
                            packet.computations.plaintext.get().cloned().unwrap_or_default();
                        upward.push(Chunk::new(plaintext).in_space(space));
                    },
                    Err(err) => result.record_error(err),
                }
                result.record_unit(packet);
            }
        }

        LayerOutput::new(result, upward)
    }

    fn buffered(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use fracture_proto::quic::PacketType;

    use super::*;
    use crate::{
        state::{ConnectionConfig, DEFAULT_CLIENT_CID},
        unit::{UnitKind, WireUnit},
    };

    fn pair() -> (ConnectionState, ConnectionState) {
        let client = ConnectionState::new(ConnectionConfig::client().with_seed(1)).unwrap();
        let server = ConnectionState::new(ConnectionConfig::server().with_seed(2)).unwrap();
        (client, server)
    }

    fn payload(space: PacketSpace, data: &'static [u8]) -> Chunk {
        Chunk::new(data).in_space(space).ack_eliciting(true)
    }

    #[test]
    fn client_initial_fills_the_datagram_and_opens_on_the_server() {
        let (mut client, mut server) = pair();
        let request = SendRequest {
            chunks: vec![payload(PacketSpace::Initial, b"\x06\x00\x02hi")],
            ..Default::default()
        };
        let sent = QuicPacketLayer::new().send(request, &mut client).unwrap();
        assert_eq!(sent.chunks.len(), 1);
        assert_eq!(sent.chunks[0].data.len(), 1200);
        assert_eq!(client.quic().space(PacketSpace::Initial).unacknowledged().len(), 1);

        let received = QuicPacketLayer::new().receive(sent.chunks.clone(), &mut server);
        assert!(received.result.errors.is_empty());
        assert_eq!(received.chunks.len(), 1);
        assert!(received.chunks[0].data.starts_with(b"\x06\x00\x02hi"));
        assert_eq!(received.chunks[0].space, Some(PacketSpace::Initial));
        assert_eq!(server.quic().remote_cid(), &DEFAULT_CLIENT_CID[..]);
        assert_eq!(server.quic().space(PacketSpace::Initial).largest_received(), Some(0));

        let packet = received.result.units[0].as_quic_packet().unwrap();
        assert_eq!(WireUnit::encode(packet).unwrap(), sent.chunks[0].data);
    }

    #[test]
    fn coalescing_packs_long_headers_into_one_datagram() {
        let (_, mut server) = pair();
        let chunks = vec![
            payload(PacketSpace::Initial, b"\x01"),
            payload(PacketSpace::Handshake, b"\x01"),
            payload(PacketSpace::Application, b"\x01"),
            payload(PacketSpace::Application, b"\x01"),
        ];
        let request = SendRequest {
            chunks: chunks.clone(),
            hints: crate::layer::LayerHints { coalesce: true, ..Default::default() },
            ..Default::default()
        };
        let coalesced = QuicPacketLayer::new().send(request, &mut server).unwrap();
        assert_eq!(coalesced.chunks.len(), 2);

        let (_, mut server) = pair();
        let request = SendRequest { chunks, ..Default::default() };
        let separate = QuicPacketLayer::new().send(request, &mut server).unwrap();
        assert_eq!(separate.chunks.len(), 4);
    }

    #[test]
    fn coalesced_datagram_yields_every_packet() {
        let (mut client, mut server) = pair();
        let request = SendRequest {
            chunks: vec![
                payload(PacketSpace::Handshake, b"\x01"),
                payload(PacketSpace::Handshake, b"\x01"),
            ],
            hints: crate::layer::LayerHints { coalesce: true, ..Default::default() },
            ..Default::default()
        };
        let sent = QuicPacketLayer::new().send(request, &mut server).unwrap();
        assert_eq!(sent.chunks.len(), 1);

        let received = QuicPacketLayer::new().receive(sent.chunks, &mut client);
        assert_eq!(
            received.result.kinds(),
            vec![UnitKind::QuicPacket(PacketType::Handshake); 2]
        );
        assert_eq!(client.quic().space(PacketSpace::Handshake).largest_received(), Some(1));
    }

    #[test]
    fn truncated_datagram_is_recorded() {
        let (mut client, _) = pair();
        let datagram = Chunk::new(&[0xc0u8, 0, 0][..]);
        let out = QuicPacketLayer::new().receive(vec![datagram], &mut client);
        assert_eq!(out.result.errors.len(), 1);
        assert!(out.chunks.is_empty());
    }
}
