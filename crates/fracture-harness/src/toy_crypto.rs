//! Reversible stand-in for the crypto collaborator.
//!
//! [`ToyCrypto`] is not cryptography. Every key, MAC and keystream is a
//! SHA-256 expansion of its inputs, and the CBC block transform is a XOR with
//! a key-derived block. What it does preserve is structure: ciphertext
//! depends on the key and the chaining IV, a record MAC depends on the MAC
//! key and its input, and a QUIC tag covers header and payload. That is
//! enough for padding and MAC checks to fail the way they would against a
//! real server.

use bytes::Bytes;
use fracture_core::{
    CryptoBackend, CryptoError, Role,
    crypto::{KeyDerivationInput, RecordKeys},
};
use fracture_proto::quic::PacketSpace;
use sha2::{Digest, Sha256};

/// Length of TLS 1.x Finished verify data.
const VERIFY_DATA_LEN: usize = 12;

/// Deterministic toy backend; see the module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToyCrypto;

/// SHA-256 in counter mode over `label` and `parts`, cut to `len` bytes.
fn expand(label: &[u8], parts: &[&[u8]], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter = 0u32;
    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(label);
        hasher.update(counter.to_be_bytes());
        for part in parts {
            hasher.update((part.len() as u32).to_be_bytes());
            hasher.update(part);
        }
        out.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    out.truncate(len);
    out
}

fn role_label(role: Role) -> &'static [u8] {
    match role {
        Role::Client => b"client",
        Role::Server => b"server",
    }
}

fn space_label(space: PacketSpace) -> &'static [u8] {
    match space {
        PacketSpace::Initial => b"initial",
        PacketSpace::Handshake => b"handshake",
        PacketSpace::Application => b"application",
    }
}

fn check_cbc(keys: &RecordKeys, iv: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let block_size = keys.params.block_size;
    if data.is_empty() || data.len() % block_size != 0 {
        return Err(CryptoError::BadLength { length: data.len(), block_size });
    }
    if iv.len() != block_size {
        return Err(CryptoError::Backend(format!(
            "IV of {} bytes for a {block_size}-byte block",
            iv.len()
        )));
    }
    Ok(expand(b"block", &[&keys.enc_key[..]], block_size))
}

fn quic_tag(parts: [&[u8]; 3], header: &[u8], body: &[u8]) -> Vec<u8> {
    let [space, sender, packet_number] = parts;
    expand(b"quic tag", &[space, sender, packet_number, header, body], 16)
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

impl CryptoBackend for ToyCrypto {
    fn derive_record_keys(&self, input: &KeyDerivationInput) -> Result<RecordKeys, CryptoError> {
        let params =
            input.suite.cbc_parameters().ok_or(CryptoError::UnsupportedSuite(input.suite))?;
        let version = input.version.0.to_be_bytes();
        let suite = input.suite.0.to_be_bytes();
        let parts: [&[u8]; 5] = [
            role_label(input.writer),
            &version,
            &suite,
            &input.client_random[..],
            &input.server_random[..],
        ];
        Ok(RecordKeys {
            suite: input.suite,
            params,
            mac_key: expand(b"mac key", &parts, params.mac_len).into(),
            enc_key: expand(b"enc key", &parts, params.key_len).into(),
            iv: expand(b"iv", &parts, params.block_size).into(),
        })
    }

    fn record_mac(&self, keys: &RecordKeys, input: &[u8]) -> Result<Bytes, CryptoError> {
        Ok(expand(b"record mac", &[&keys.mac_key[..], input], keys.params.mac_len).into())
    }

    fn encrypt_cbc(
        &self,
        keys: &RecordKeys,
        iv: &[u8],
        plaintext: &[u8],
    ) -> Result<Bytes, CryptoError> {
        let block_key = check_cbc(keys, iv, plaintext)?;
        let mut out = Vec::with_capacity(plaintext.len());
        let mut previous = iv.to_vec();
        for block in plaintext.chunks(block_key.len()) {
            let cipher = xor(&xor(block, &previous), &block_key);
            out.extend_from_slice(&cipher);
            previous = cipher;
        }
        Ok(out.into())
    }

    fn decrypt_cbc(
        &self,
        keys: &RecordKeys,
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<Bytes, CryptoError> {
        let block_key = check_cbc(keys, iv, ciphertext)?;
        let mut out = Vec::with_capacity(ciphertext.len());
        let mut previous = iv;
        for block in ciphertext.chunks(block_key.len()) {
            out.extend_from_slice(&xor(&xor(block, &block_key), previous));
            previous = block;
        }
        Ok(out.into())
    }

    fn verify_data(&self, sender: Role, transcript: &[u8]) -> Result<Bytes, CryptoError> {
        Ok(expand(b"finished", &[role_label(sender), transcript], VERIFY_DATA_LEN).into())
    }

    fn quic_header_mask(&self, space: PacketSpace, sample: &[u8]) -> Result<[u8; 5], CryptoError> {
        let mut mask = [0u8; 5];
        let len = mask.len();
        mask.copy_from_slice(&expand(b"hp", &[space_label(space), sample], len));
        Ok(mask)
    }

    fn quic_seal(
        &self,
        space: PacketSpace,
        sender: Role,
        packet_number: u64,
        header: &[u8],
        plaintext: &[u8],
    ) -> Result<Bytes, CryptoError> {
        let pn = packet_number.to_be_bytes();
        let parts: [&[u8]; 3] = [space_label(space), role_label(sender), &pn];
        let mut sealed = xor(plaintext, &expand(b"quic key", &parts, plaintext.len()));
        let tag = quic_tag(parts, header, &sealed);
        sealed.extend_from_slice(&tag[..self.quic_tag_len()]);
        Ok(sealed.into())
    }

    fn quic_open(
        &self,
        space: PacketSpace,
        sender: Role,
        packet_number: u64,
        header: &[u8],
        payload: &[u8],
    ) -> Result<Bytes, CryptoError> {
        let body_len =
            payload.len().checked_sub(self.quic_tag_len()).ok_or(CryptoError::Authentication)?;
        let (body, tag) = payload.split_at(body_len);
        let pn = packet_number.to_be_bytes();
        let parts: [&[u8]; 3] = [space_label(space), role_label(sender), &pn];
        let expected = quic_tag(parts, header, body);
        if expected[..self.quic_tag_len()] != *tag {
            return Err(CryptoError::Authentication);
        }
        Ok(xor(body, &expand(b"quic key", &parts, body.len())).into())
    }
}

#[cfg(test)]
mod tests {
    use fracture_proto::tls::{CipherSuite, ProtocolVersion};

    use super::*;

    fn keys(writer: Role) -> RecordKeys {
        let input = KeyDerivationInput {
            suite: CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA,
            version: ProtocolVersion::TLS1_2,
            client_random: Bytes::from_static(&[1; 32]),
            server_random: Bytes::from_static(&[2; 32]),
            writer,
        };
        ToyCrypto.derive_record_keys(&input).unwrap()
    }

    #[test]
    fn keys_are_per_direction_and_reproducible() {
        assert_eq!(keys(Role::Client), keys(Role::Client));
        assert_ne!(keys(Role::Client).enc_key, keys(Role::Server).enc_key);
        assert_eq!(keys(Role::Client).mac_key.len(), 20);
    }

    #[test]
    fn cbc_round_trip_chains_blocks() {
        let keys = keys(Role::Client);
        let iv = [7u8; 16];
        let plaintext = [0x42u8; 32];
        let ciphertext = ToyCrypto.encrypt_cbc(&keys, &iv, &plaintext).unwrap();
        assert_ne!(&ciphertext[..16], &ciphertext[16..]);
        let opened = ToyCrypto.decrypt_cbc(&keys, &iv, &ciphertext).unwrap();
        assert_eq!(&opened[..], &plaintext[..]);
    }

    #[test]
    fn flipping_a_ciphertext_bit_flips_the_next_plaintext_block() {
        let keys = keys(Role::Client);
        let iv = [0u8; 16];
        let mut ciphertext = ToyCrypto.encrypt_cbc(&keys, &iv, &[0u8; 32]).unwrap().to_vec();
        ciphertext[15] ^= 0x01;
        let opened = ToyCrypto.decrypt_cbc(&keys, &iv, &ciphertext).unwrap();
        assert_eq!(opened[31], 0x01);
    }

    #[test]
    fn unaligned_ciphertext_is_rejected() {
        let err = ToyCrypto.decrypt_cbc(&keys(Role::Server), &[0; 16], &[0; 17]).unwrap_err();
        assert_eq!(err, CryptoError::BadLength { length: 17, block_size: 16 });
    }

    #[test]
    fn mac_depends_on_input() {
        let keys = keys(Role::Client);
        let a = ToyCrypto.record_mac(&keys, b"a").unwrap();
        assert_eq!(a.len(), 20);
        assert_ne!(a, ToyCrypto.record_mac(&keys, b"b").unwrap());
    }

    #[test]
    fn quic_seal_opens_and_rejects_tampering() {
        let space = PacketSpace::Initial;
        let sealed = ToyCrypto.quic_seal(space, Role::Client, 3, b"hdr", b"frames").unwrap();
        assert_eq!(sealed.len(), 6 + 16);
        let opened = ToyCrypto.quic_open(space, Role::Client, 3, b"hdr", &sealed).unwrap();
        assert_eq!(&opened[..], b"frames");

        assert_eq!(
            ToyCrypto.quic_open(space, Role::Server, 3, b"hdr", &sealed),
            Err(CryptoError::Authentication)
        );
        let mut tampered = sealed.to_vec();
        tampered[0] ^= 1;
        assert_eq!(
            ToyCrypto.quic_open(space, Role::Client, 3, b"hdr", &tampered),
            Err(CryptoError::Authentication)
        );
    }

    #[test]
    fn verify_data_depends_on_sender() {
        let client = ToyCrypto.verify_data(Role::Client, b"transcript").unwrap();
        let server = ToyCrypto.verify_data(Role::Server, b"transcript").unwrap();
        assert_eq!(client.len(), 12);
        assert_ne!(client, server);
    }
}
