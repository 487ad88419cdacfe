//! Property-based tests for the toy crypto backend.
//!
//! The harness relies on these laws: CBC decryption inverts encryption for
//! any aligned input, and QUIC packet protection opens only what it sealed.

use bytes::Bytes;
use fracture_core::{
    CryptoBackend, Role,
    crypto::{KeyDerivationInput, RecordKeys},
};
use fracture_harness::ToyCrypto;
use fracture_proto::{
    quic::PacketSpace,
    tls::{CipherSuite, ProtocolVersion},
};
use proptest::prelude::*;

fn keys(suite: CipherSuite, client_random: [u8; 32]) -> RecordKeys {
    let input = KeyDerivationInput {
        suite,
        version: ProtocolVersion::TLS1_2,
        client_random: Bytes::copy_from_slice(&client_random),
        server_random: Bytes::from_static(&[9; 32]),
        writer: Role::Client,
    };
    ToyCrypto.derive_record_keys(&input).unwrap()
}

fn suite_strategy() -> impl Strategy<Value = CipherSuite> {
    prop_oneof![
        Just(CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA),
        Just(CipherSuite::TLS_RSA_WITH_AES_256_CBC_SHA),
    ]
}

#[test]
fn prop_cbc_decrypt_inverts_encrypt() {
    proptest!(|(
        suite in suite_strategy(),
        client_random in any::<[u8; 32]>(),
        iv in any::<[u8; 16]>(),
        blocks in prop::collection::vec(any::<[u8; 16]>(), 1..8),
    )| {
        let keys = keys(suite, client_random);
        let plaintext: Vec<u8> = blocks.concat();
        let ciphertext = ToyCrypto.encrypt_cbc(&keys, &iv, &plaintext).unwrap();
        prop_assert_eq!(ciphertext.len(), plaintext.len());
        let opened = ToyCrypto.decrypt_cbc(&keys, &iv, &ciphertext).unwrap();
        prop_assert_eq!(&opened[..], &plaintext[..]);
    });
}

#[test]
fn prop_quic_open_rejects_any_single_bit_flip() {
    proptest!(|(
        packet_number in any::<u64>(),
        payload in prop::collection::vec(any::<u8>(), 1..64),
        flip in any::<prop::sample::Index>(),
        bit in 0u8..8,
    )| {
        let space = PacketSpace::Application;
        let header = b"header";
        let sealed =
            ToyCrypto.quic_seal(space, Role::Server, packet_number, header, &payload).unwrap();
        let opened =
            ToyCrypto.quic_open(space, Role::Server, packet_number, header, &sealed).unwrap();
        prop_assert_eq!(&opened[..], &payload[..]);

        let mut tampered = sealed.to_vec();
        let at = flip.index(tampered.len());
        tampered[at] ^= 1 << bit;
        prop_assert!(
            ToyCrypto.quic_open(space, Role::Server, packet_number, header, &tampered).is_err()
        );
    });
}
