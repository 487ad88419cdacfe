//! QUIC frame and packet units.
//!
//! Frames derive offsets and acknowledgement ranges from per-space state.
//! Packets derive their header from the connection ids and packet number
//! space, then seal the payload and compute the header protection mask
//! through the crypto collaborator.

use std::collections::BTreeSet;

use bytes::{Bytes, BytesMut};
use fracture_proto::{
    ProtocolError,
    codec::fit_u8,
    quic::{
        AckFrame, AckRange, Frame, Packet, PacketSpace, PacketType, SAMPLE_LEN, StreamFlags,
        number,
    },
};

use crate::{
    error::{AdjustmentError, PipelineError},
    state::{CloseInfo, ConnectionState, Direction, PrepareContext, Role, SentPacket, SpaceState},
    unit::{UnitKind, WireUnit},
};

/// A frame and the packet number space it travels in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicFrame {
    /// Packet number space
    pub space: PacketSpace,
    /// The frame
    pub frame: Frame,
}

impl QuicFrame {
    /// Creates a frame for `space`.
    pub fn new(space: PacketSpace, frame: Frame) -> Self {
        Self { space, frame }
    }
}

impl WireUnit for QuicFrame {
    fn kind(&self) -> UnitKind {
        UnitKind::QuicFrame(self.frame.kind_code())
    }

    fn compute_defaults(&mut self, ctx: &mut PrepareContext<'_>) -> Result<(), PipelineError> {
        let quic = ctx.quic;
        let space = quic.space(self.space);

        match &mut self.frame {
            Frame::Ack(ack) => prepare_ack(ack, space)?,
            Frame::Crypto(crypto) => {
                crypto.offset.set_computed(space.crypto_sent());
                let len = crypto.data.resolve("crypto.data")?.len() as u64;
                crypto.length.set_computed(len);
            },
            Frame::Stream(stream) => {
                let stream_id = stream.stream_id.value("stream.stream_id")?;
                stream.offset.set_computed(quic.stream_sent(stream_id));
                let offset = stream.offset.value("stream.offset")?;
                let len = stream.data.resolve("stream.data")?.len() as u64;
                stream.length.set_computed(len);

                let mut flags = StreamFlags::LEN;
                if offset > 0 {
                    flags |= StreamFlags::OFF;
                }
                if stream.fin {
                    flags |= StreamFlags::FIN;
                }
                stream.flags.set_computed(flags);
            },
            Frame::ConnectionClose(close) => {
                close.error_code.compute_if_unset(|| 0);
                if !close.application {
                    close.frame_type.compute_if_unset(|| 0);
                }
                close.reason.compute_if_unset(Bytes::new);
                let len = close.reason.resolve("close.reason")?.len() as u64;
                close.reason_length.set_computed(len);
            },
            Frame::Padding { .. }
            | Frame::Ping
            | Frame::MaxData { .. }
            | Frame::HandshakeDone => {},
        }
        Ok(())
    }

    fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut out = BytesMut::new();
        self.frame.encode(&mut out)?;
        Ok(out.freeze())
    }

    fn apply_effects(
        &self,
        state: &mut ConnectionState,
        direction: Direction,
    ) -> Result<(), AdjustmentError> {
        let role = state.role();
        let quic = &mut state.quic;
        if direction == Direction::Inbound && self.frame.ack_eliciting() {
            quic.space_mut(self.space).ack_pending = true;
        }

        match (&self.frame, direction) {
            (Frame::Crypto(crypto), _) => {
                let end = crypto.offset.value("crypto.offset")?
                    + crypto.data.resolve("crypto.data")?.len() as u64;
                let space = quic.space_mut(self.space);
                let offset = match direction {
                    Direction::Outbound => &mut space.crypto_sent,
                    Direction::Inbound => &mut space.crypto_received,
                };
                *offset = (*offset).max(end);
            },
            (Frame::Stream(stream), _) => {
                let stream_id = stream.stream_id.value("stream.stream_id")?;
                let end = stream.offset.get().copied().unwrap_or(0)
                    + stream.data.resolve("stream.data")?.len() as u64;
                let offsets = match direction {
                    Direction::Outbound => &mut quic.stream_sent,
                    Direction::Inbound => &mut quic.stream_received,
                };
                let offset = offsets.entry(stream_id).or_insert(0);
                *offset = (*offset).max(end);
            },
            (Frame::Ack(_), Direction::Outbound) => {
                quic.space_mut(self.space).ack_pending = false;
            },
            (Frame::Ack(ack), Direction::Inbound) => {
                let largest = ack.largest_acknowledged.value("ack.largest_acknowledged")?;
                let acknowledged = acknowledged_ranges(ack)?;
                let space = quic.space_mut(self.space);
                space.largest_acked = Some(space.largest_acked.map_or(largest, |l| l.max(largest)));
                space.sent.retain(|pn, _| {
                    !acknowledged.iter().any(|&(low, high)| (low..=high).contains(pn))
                });
                if space.largest_sent.is_none_or(|sent| largest > sent) {
                    return Err(AdjustmentError::Inconsistent {
                        unit: "ACK frame",
                        reason: format!("acknowledges packet {largest} which was never sent"),
                    });
                }
            },
            (Frame::MaxData { maximum }, Direction::Inbound) => {
                quic.peer_max_data = Some(maximum.value("max_data.maximum")?);
            },
            (Frame::ConnectionClose(close), _) => {
                let reason = close.reason.resolve("close.reason")?;
                quic.close = Some(CloseInfo {
                    application: close.application,
                    error_code: close.error_code.value("close.error_code")?,
                    reason: String::from_utf8_lossy(reason).into_owned(),
                    direction,
                });
            },
            (Frame::HandshakeDone, _) => {
                quic.handshake_done = true;
                let sender = match direction {
                    Direction::Outbound => role,
                    Direction::Inbound => role.peer(),
                };
                if sender != Role::Server {
                    return Err(AdjustmentError::Inconsistent {
                        unit: "HANDSHAKE_DONE",
                        reason: "only servers send HANDSHAKE_DONE".to_string(),
                    });
                }
            },
            _ => {},
        }
        Ok(())
    }

    fn ack_eliciting(&self) -> bool {
        self.frame.ack_eliciting()
    }
}

fn prepare_ack(ack: &mut AckFrame, space: &SpaceState) -> Result<(), ProtocolError> {
    let Some(largest) = space.largest_received() else {
        return Ok(());
    };
    let (first_range, ranges) = ack_ranges(space.received());
    ack.largest_acknowledged.set_computed(largest);
    ack.ack_delay.set_computed(0);
    ack.first_range.set_computed(first_range);
    ack.ranges.set_computed(ranges);
    let count = ack.ranges.resolve("ack.ranges")?.len() as u64;
    ack.range_count.set_computed(count);
    Ok(())
}

/// Encodes received packet numbers as a first range and additional ranges,
/// largest first (RFC 9000 Section 19.3.1).
fn ack_ranges(received: &BTreeSet<u64>) -> (u64, Vec<AckRange>) {
    let mut blocks: Vec<(u64, u64)> = Vec::new();
    for &pn in received.iter().rev() {
        match blocks.last_mut() {
            Some((smallest, _)) if *smallest == pn + 1 => *smallest = pn,
            _ => blocks.push((pn, pn)),
        }
    }

    let mut blocks = blocks.into_iter();
    let Some((mut previous_smallest, largest)) = blocks.next() else {
        return (0, Vec::new());
    };
    let first_range = largest - previous_smallest;
    let ranges = blocks
        .map(|(smallest, block_largest)| {
            let range = AckRange {
                gap: previous_smallest - block_largest - 2,
                length: block_largest - smallest,
            };
            previous_smallest = smallest;
            range
        })
        .collect();
    (first_range, ranges)
}

/// Inclusive packet number intervals an ACK frame covers.
fn acknowledged_ranges(ack: &AckFrame) -> Result<Vec<(u64, u64)>, ProtocolError> {
    let largest = ack.largest_acknowledged.value("ack.largest_acknowledged")?;
    let mut smallest = largest.saturating_sub(ack.first_range.value("ack.first_range")?);
    let mut intervals = vec![(smallest, largest)];
    for range in ack.ranges.get().map(Vec::as_slice).unwrap_or_default() {
        let Some(high) = smallest.checked_sub(range.gap + 2) else {
            break;
        };
        let low = high.saturating_sub(range.length);
        intervals.push((low, high));
        smallest = low;
    }
    Ok(intervals)
}

impl WireUnit for Packet {
    fn kind(&self) -> UnitKind {
        UnitKind::QuicPacket(self.packet_type)
    }

    fn compute_defaults(&mut self, ctx: &mut PrepareContext<'_>) -> Result<(), PipelineError> {
        let quic = ctx.quic;
        let crypto = ctx.crypto;
        let role = ctx.role();
        let space_id = self.packet_type.space();
        let space = quic.space(space_id);

        self.packet_number.set_computed(space.next_packet_number());
        let pn = self.packet_number.value("packet.packet_number")?;
        let pn_len = number::encode_length(pn, space.largest_acked());
        self.packet_number_length.set_computed(pn_len as u8);
        let pn_len = usize::from(self.packet_number_length.value("packet.packet_number_length")?);
        self.first_byte.set_computed(self.packet_type.first_byte(pn_len));

        self.dcid.set_computed(quic.remote_cid().clone());
        if self.packet_type.is_long() {
            self.version.set_computed(quic.version());
            self.scid.set_computed(quic.local_cid().clone());
            let dcid_len = self.dcid.resolve("packet.dcid")?.len();
            self.dcid_length.set_computed(fit_u8("packet.dcid_length", dcid_len)?);
            let scid_len = self.scid.resolve("packet.scid")?.len();
            self.scid_length.set_computed(fit_u8("packet.scid_length", scid_len)?);
            if self.packet_type == PacketType::Initial {
                self.token.compute_if_unset(Bytes::new);
                let token_len = self.token.resolve("packet.token")?.len() as u64;
                self.token_length.set_computed(token_len);
            }
        }

        // The header protection sample must lie inside the payload.
        let tag_len = crypto.quic_tag_len();
        let plaintext = self.computations.plaintext.resolve("packet.plaintext")?.clone();
        let sample_floor = (4 + SAMPLE_LEN).saturating_sub(pn_len + tag_len);
        let mut padded_len = plaintext.len().max(sample_floor);
        if role == Role::Client && self.packet_type == PacketType::Initial {
            let datagram = ctx.config.quic.initial_datagram_size;
            self.length.set_computed(datagram as u64);
            let pn_offset = self.encode_header(&mut BytesMut::new())?;
            let total = pn_offset + pn_len + padded_len + tag_len;
            padded_len += datagram.saturating_sub(total);
        }
        if padded_len > plaintext.len() {
            let mut padded = BytesMut::from(&plaintext[..]);
            padded.resize(padded_len, 0);
            self.computations.plaintext.set_computed(padded.freeze());
        }
        let plaintext = self.computations.plaintext.resolve("packet.plaintext")?.clone();
        if self.packet_type.is_long() {
            self.length.set_computed((pn_len + plaintext.len() + tag_len) as u64);
        }

        let mut header = BytesMut::new();
        self.encode_header(&mut header)?;
        if !self.payload.is_explicit() {
            let sealed = crypto.quic_seal(space_id, role, pn, &header, &plaintext)?;
            self.payload.set_computed(sealed);
        }

        let payload = self.payload.resolve("packet.payload")?;
        let mut sample = [0u8; SAMPLE_LEN];
        let available = payload.get(4usize.saturating_sub(pn_len)..).unwrap_or_default();
        let n = available.len().min(SAMPLE_LEN);
        sample[..n].copy_from_slice(&available[..n]);
        let mask = crypto.quic_header_mask(space_id, &sample)?;
        self.computations.header_mask.set_computed(Bytes::copy_from_slice(&mask));
        Ok(())
    }

    fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut out = BytesMut::new();
        Packet::encode(self, &mut out)?;
        Ok(out.freeze())
    }

    fn apply_effects(
        &self,
        state: &mut ConnectionState,
        direction: Direction,
    ) -> Result<(), AdjustmentError> {
        let pn = self.packet_number.value("packet.packet_number")?;
        let space = state.quic.space_mut(self.packet_type.space());

        match direction {
            Direction::Outbound => {
                space.next_packet_number = space.next_packet_number.max(pn.saturating_add(1));
                space.largest_sent = Some(space.largest_sent.map_or(pn, |l| l.max(pn)));
                if self.computations.ack_eliciting {
                    let size = self.payload.get().map_or(0, Bytes::len);
                    space.sent.insert(pn, SentPacket { ack_eliciting: true, size });
                }
            },
            Direction::Inbound => {
                space.received.insert(pn);
                space.largest_received = Some(space.largest_received.map_or(pn, |l| l.max(pn)));

                if self.packet_type.is_long() {
                    let version = self.version.value("packet.version")?;
                    let quic = &mut state.quic;
                    if !quic.peer_cid_confirmed {
                        quic.remote_cid = self.scid.resolve("packet.scid")?.clone();
                        quic.peer_cid_confirmed = true;
                    }
                    if version != quic.version {
                        return Err(AdjustmentError::Unsupported {
                            field: "packet.version",
                            value: format!("{version:#x}"),
                            reason: format!("connection uses {:#x}", quic.version),
                        });
                    }
                }
            },
        }
        Ok(())
    }

    fn ack_eliciting(&self) -> bool {
        self.computations.ack_eliciting
    }
}

#[cfg(test)]
mod tests {
    use fracture_proto::{
        Overridable,
        quic::{CryptoFrame, StreamFrame},
    };

    use super::*;
    use crate::state::ConnectionConfig;

    fn client() -> ConnectionState {
        ConnectionState::new(ConnectionConfig::client().with_seed(5)).unwrap()
    }

    fn send<U: WireUnit>(mut unit: U, state: &mut ConnectionState) -> U {
        unit.compute_defaults(&mut state.prepare_context()).unwrap();
        unit.apply_effects(state, Direction::Outbound).unwrap();
        unit
    }

    #[test]
    fn ack_ranges_describe_gaps() {
        let received: BTreeSet<u64> = [0, 1, 2, 5, 6, 9].into_iter().collect();
        let (first, ranges) = ack_ranges(&received);
        assert_eq!(first, 0);
        assert_eq!(ranges, vec![AckRange { gap: 1, length: 1 }, AckRange { gap: 1, length: 2 }]);
    }

    #[test]
    fn ack_ranges_round_trip_through_intervals() {
        let received: BTreeSet<u64> = [3, 4, 8, 10, 11, 12].into_iter().collect();
        let (first_range, ranges) = ack_ranges(&received);
        let ack = AckFrame {
            largest_acknowledged: Overridable::computed(12),
            first_range: Overridable::computed(first_range),
            ranges: Overridable::computed(ranges),
            ..AckFrame::default()
        };
        assert_eq!(acknowledged_ranges(&ack).unwrap(), vec![(10, 12), (8, 8), (3, 4)]);
    }

    #[test]
    fn crypto_offsets_continue_across_frames() {
        let mut state = client();
        let frame = |data: &'static [u8]| {
            QuicFrame::new(PacketSpace::Initial, Frame::Crypto(CryptoFrame::new(data)))
        };
        send(frame(b"abcd"), &mut state);
        let second = send(frame(b"ef"), &mut state);
        let Frame::Crypto(crypto) = &second.frame else { panic!("not CRYPTO") };
        assert_eq!(crypto.offset.get(), Some(&4));
        assert_eq!(state.quic().space(PacketSpace::Initial).crypto_sent(), 6);
    }

    #[test]
    fn stream_flags_follow_offset_and_fin() {
        let mut state = client();
        let app_frame =
            |frame: StreamFrame| QuicFrame::new(PacketSpace::Application, Frame::Stream(frame));
        let first = send(app_frame(StreamFrame::new(0, &b"GET"[..])), &mut state);
        let Frame::Stream(stream) = &first.frame else { panic!("not STREAM") };
        assert_eq!(stream.flags.get(), Some(&StreamFlags::LEN));

        let mut last = StreamFrame::new(0, &b" /"[..]);
        last.fin = true;
        let second = send(app_frame(last), &mut state);
        let Frame::Stream(stream) = &second.frame else { panic!("not STREAM") };
        assert_eq!(
            stream.flags.get(),
            Some(&(StreamFlags::LEN | StreamFlags::OFF | StreamFlags::FIN))
        );
        assert_eq!(state.quic().stream_sent(0), 5);
    }

    #[test]
    fn ack_of_unsent_packet_is_inconsistent() {
        let mut state = client();
        let ack = AckFrame {
            largest_acknowledged: Overridable::computed(3),
            first_range: Overridable::computed(0),
            ranges: Overridable::computed(Vec::new()),
            ..AckFrame::default()
        };
        let err = QuicFrame::new(PacketSpace::Initial, Frame::Ack(ack))
            .apply_effects(&mut state, Direction::Inbound)
            .unwrap_err();
        assert!(matches!(err, AdjustmentError::Inconsistent { unit: "ACK frame", .. }));
        assert_eq!(state.quic().space(PacketSpace::Initial).largest_acked(), Some(3));
    }

    #[test]
    fn client_initial_fills_minimum_datagram() {
        let mut state = client();
        let mut packet = Packet::new(PacketType::Initial);
        packet.computations.plaintext.set_computed(Bytes::from_static(&[0x01; 10]));
        packet.computations.ack_eliciting = true;
        let packet = send(packet, &mut state);

        assert_eq!(WireUnit::encode(&packet).unwrap().len(), 1200);
        let space = state.quic().space(PacketSpace::Initial);
        assert_eq!(space.next_packet_number(), 1);
        assert!(space.unacknowledged().contains_key(&0));
    }

    #[test]
    fn server_initial_is_not_padded_beyond_sample() {
        let mut state = ConnectionState::new(ConnectionConfig::server()).unwrap();
        let mut packet = Packet::new(PacketType::Initial);
        packet.computations.plaintext.set_computed(Bytes::from_static(&[0x01]));
        let packet = send(packet, &mut state);

        // pn(1) needs 3 payload bytes before the 16-byte tag to cover the sample
        assert_eq!(packet.computations.plaintext.get().map(Bytes::len), Some(3));
        assert_eq!(packet.length.get(), Some(&20));
    }

    #[test]
    fn inbound_long_header_adopts_peer_cid() {
        let mut server = ConnectionState::new(ConnectionConfig::server()).unwrap();
        let mut client = client();
        let mut packet = Packet::new(PacketType::Initial);
        packet.scid = Overridable::explicit(Bytes::from_static(&[0xab; 4]));
        packet.computations.plaintext.set_computed(Bytes::from_static(&[0x01]));
        let packet = send(packet, &mut client);

        packet.apply_effects(&mut server, Direction::Inbound).unwrap();
        assert_eq!(&server.quic().remote_cid()[..], &[0xab; 4]);
        assert_eq!(server.quic().space(PacketSpace::Initial).largest_received(), Some(0));
    }

    #[test]
    fn server_receiving_handshake_done_is_inconsistent() {
        let mut server = ConnectionState::new(ConnectionConfig::server()).unwrap();
        let err = QuicFrame::new(PacketSpace::Application, Frame::HandshakeDone)
            .apply_effects(&mut server, Direction::Inbound)
            .unwrap_err();
        assert!(matches!(err, AdjustmentError::Inconsistent { unit: "HANDSHAKE_DONE", .. }));
        assert!(server.quic().space(PacketSpace::Application).ack_pending());
    }
}
