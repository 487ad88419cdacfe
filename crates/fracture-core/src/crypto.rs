//! Cryptographic collaborator boundary.
//!
//! The pipeline never implements ciphers itself. Record protection, key
//! derivation, Finished verify data and QUIC packet protection are requested
//! from a [`CryptoBackend`] held by the connection state. Padding and MAC
//! layout stay in the pipeline so that malformed records can be built from
//! correct primitives.
//!
//! [`NullCrypto`] is the backend used when none is configured: it derives
//! zeroed keys and leaves payloads unencrypted, which keeps every byte on the
//! wire predictable.

use std::fmt;

use bytes::Bytes;
use fracture_proto::{
    quic::PacketSpace,
    tls::{CbcParameters, CipherSuite, ProtocolVersion},
};
use thiserror::Error;

use crate::state::Role;

/// Failures reported by the crypto collaborator or by record unprotection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The backend has no implementation for the suite
    #[error("cipher suite {0} is not supported")]
    UnsupportedSuite(CipherSuite),

    /// Inputs needed to derive or use keys are missing
    #[error("missing key material: {0}")]
    MissingKeys(&'static str),

    /// Ciphertext is not a whole number of blocks
    #[error("ciphertext length {length} is not a positive multiple of {block_size}")]
    BadLength {
        /// Ciphertext length
        length: usize,
        /// Cipher block size
        block_size: usize,
    },

    /// CBC padding did not verify
    #[error("invalid CBC padding")]
    BadPadding,

    /// Record MAC did not verify
    #[error("record MAC mismatch")]
    BadMac,

    /// AEAD tag did not verify
    #[error("packet authentication failed")]
    Authentication,

    /// Backend-specific failure
    #[error("crypto backend failure: {0}")]
    Backend(String),
}

/// Keys protecting one direction of one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordKeys {
    /// Suite the keys were derived for
    pub suite: CipherSuite,
    /// Block and MAC sizes of the suite
    pub params: CbcParameters,
    /// MAC key
    pub mac_key: Bytes,
    /// Encryption key
    pub enc_key: Bytes,
    /// Initial CBC IV; only used by versions without explicit IVs
    pub iv: Bytes,
}

/// Inputs to record key derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDerivationInput {
    /// Negotiated suite
    pub suite: CipherSuite,
    /// Negotiated version
    pub version: ProtocolVersion,
    /// Client hello random
    pub client_random: Bytes,
    /// Server hello random
    pub server_random: Bytes,
    /// Endpoint whose writes the keys protect
    pub writer: Role,
}

/// Cryptographic operations the pipeline delegates.
///
/// Implementations must be deterministic in their inputs: two endpoints
/// deriving keys from the same input get the same keys.
pub trait CryptoBackend: fmt::Debug + Send + Sync {
    /// Derives the record keys for `input.writer`'s direction.
    fn derive_record_keys(&self, input: &KeyDerivationInput) -> Result<RecordKeys, CryptoError>;

    /// MAC over the pseudo-header and plaintext of a record.
    fn record_mac(&self, keys: &RecordKeys, input: &[u8]) -> Result<Bytes, CryptoError>;

    /// CBC-encrypts block-aligned `plaintext`.
    fn encrypt_cbc(
        &self,
        keys: &RecordKeys,
        iv: &[u8],
        plaintext: &[u8],
    ) -> Result<Bytes, CryptoError>;

    /// CBC-decrypts block-aligned `ciphertext`. Padding is left in place.
    fn decrypt_cbc(
        &self,
        keys: &RecordKeys,
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<Bytes, CryptoError>;

    /// Finished verify data for messages sent by `sender`.
    fn verify_data(&self, sender: Role, transcript: &[u8]) -> Result<Bytes, CryptoError>;

    /// Header protection mask for `sample`.
    fn quic_header_mask(&self, space: PacketSpace, sample: &[u8]) -> Result<[u8; 5], CryptoError>;

    /// Protects a packet payload; `header` is the unprotected header.
    fn quic_seal(
        &self,
        space: PacketSpace,
        sender: Role,
        packet_number: u64,
        header: &[u8],
        plaintext: &[u8],
    ) -> Result<Bytes, CryptoError>;

    /// Removes payload protection.
    fn quic_open(
        &self,
        space: PacketSpace,
        sender: Role,
        packet_number: u64,
        header: &[u8],
        payload: &[u8],
    ) -> Result<Bytes, CryptoError>;

    /// Bytes the AEAD adds to every packet payload.
    fn quic_tag_len(&self) -> usize {
        16
    }
}

/// Backend that protects nothing.
///
/// Keys are all-zero, MACs are zero bytes of the suite's MAC length, CBC
/// "encryption" is the identity and QUIC payloads get a zero tag.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCrypto;

impl NullCrypto {
    const VERIFY_DATA_LEN: usize = 12;
}

fn check_blocks(len: usize, block_size: usize) -> Result<(), CryptoError> {
    if len == 0 || len % block_size != 0 {
        return Err(CryptoError::BadLength { length: len, block_size });
    }
    Ok(())
}

impl CryptoBackend for NullCrypto {
    fn derive_record_keys(&self, input: &KeyDerivationInput) -> Result<RecordKeys, CryptoError> {
        let params =
            input.suite.cbc_parameters().ok_or(CryptoError::UnsupportedSuite(input.suite))?;
        Ok(RecordKeys {
            suite: input.suite,
            params,
            mac_key: Bytes::from(vec![0; params.mac_len]),
            enc_key: Bytes::from(vec![0; params.key_len]),
            iv: Bytes::from(vec![0; params.block_size]),
        })
    }

    fn record_mac(&self, keys: &RecordKeys, _input: &[u8]) -> Result<Bytes, CryptoError> {
        Ok(Bytes::from(vec![0; keys.params.mac_len]))
    }

    fn encrypt_cbc(
        &self,
        keys: &RecordKeys,
        _iv: &[u8],
        plaintext: &[u8],
    ) -> Result<Bytes, CryptoError> {
        check_blocks(plaintext.len(), keys.params.block_size)?;
        Ok(Bytes::copy_from_slice(plaintext))
    }

    fn decrypt_cbc(
        &self,
        keys: &RecordKeys,
        _iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<Bytes, CryptoError> {
        check_blocks(ciphertext.len(), keys.params.block_size)?;
        Ok(Bytes::copy_from_slice(ciphertext))
    }

    fn verify_data(&self, _sender: Role, _transcript: &[u8]) -> Result<Bytes, CryptoError> {
        Ok(Bytes::from(vec![0; Self::VERIFY_DATA_LEN]))
    }

    fn quic_header_mask(
        &self,
        _space: PacketSpace,
        _sample: &[u8],
    ) -> Result<[u8; 5], CryptoError> {
        Ok([0; 5])
    }

    fn quic_seal(
        &self,
        _space: PacketSpace,
        _sender: Role,
        _packet_number: u64,
        _header: &[u8],
        plaintext: &[u8],
    ) -> Result<Bytes, CryptoError> {
        let mut sealed = Vec::with_capacity(plaintext.len() + self.quic_tag_len());
        sealed.extend_from_slice(plaintext);
        sealed.resize(plaintext.len() + self.quic_tag_len(), 0);
        Ok(sealed.into())
    }

    fn quic_open(
        &self,
        _space: PacketSpace,
        _sender: Role,
        _packet_number: u64,
        _header: &[u8],
        payload: &[u8],
    ) -> Result<Bytes, CryptoError> {
        let body_len =
            payload.len().checked_sub(self.quic_tag_len()).ok_or(CryptoError::Authentication)?;
        Ok(Bytes::copy_from_slice(&payload[..body_len]))
    }
}
