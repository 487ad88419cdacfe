//! QUIC version 1 wire catalog: variable-length integers, frames and
//! packet headers. Payload protection is left to the crypto collaborator.

mod frame;
pub mod number;
mod packet;
pub mod varint;

pub use frame::{
    AckFrame, AckRange, ConnectionCloseFrame, CryptoFrame, EcnCounts, Frame, StreamFlags,
    StreamFrame, frame_type,
};
pub use packet::{
    Packet, PacketComputations, PacketSpace, PacketType, ProtectedHeader, SAMPLE_LEN, apply_mask,
    peek_header,
};
