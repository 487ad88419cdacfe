//! Decoder fuzzer across the whole wire catalog.
//!
//! The first input byte selects the decoder, the rest is the unit. Every
//! decoder must return `Ok` or `Err` without panicking, and units that decode
//! cleanly must re-encode to exactly the bytes they consumed.

#![no_main]

use fracture_proto::{
    http::HttpMessage,
    quic::{Frame, Packet, peek_header},
    tls::{ContentType, HandshakeMessage, Record, TlsMessage},
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&selector, input)) = data.split_first() else {
        return;
    };

    match selector % 6 {
        0 => {
            if let Ok((record, used)) = Record::decode(input) {
                let mut out = Vec::new();
                record.encode(&mut out).expect("decoded record must re-encode");
                assert_eq!(out, &input[..used]);
            }
        },
        1 => {
            if let Ok((message, used)) = HandshakeMessage::decode(input) {
                let mut out = Vec::new();
                message.encode(&mut out).expect("decoded handshake must re-encode");
                assert_eq!(out, &input[..used]);
            }
        },
        2 => {
            for content_type in [ContentType::ALERT, ContentType::CHANGE_CIPHER_SPEC] {
                let _ = TlsMessage::decode(content_type, input);
            }
        },
        3 => {
            let mut rest = input;
            while !rest.is_empty() {
                let Ok((frame, used)) = Frame::decode(rest) else { break };
                let mut out = Vec::new();
                frame.encode(&mut out).expect("decoded frame must re-encode");
                // Non-minimal varints are legal input but re-encode minimally
                assert!(out.len() <= used);
                rest = &rest[used..];
            }
        },
        4 => {
            if let Ok(header) = peek_header(input, 8) {
                let packet = &input[..header.packet_len];
                let _ = Packet::decode_unprotected(packet, 8, 0);
            }
        },
        _ => {
            let _ = HttpMessage::decode(input);
        },
    }
});
