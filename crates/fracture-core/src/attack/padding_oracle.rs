//! CBC padding-oracle record vectors.
//!
//! Every vector is an application-data record whose padding is pinned with
//! an explicit override, so compute-defaults still derives the MAC, IV and
//! ciphertext around it but never repairs the padding. Given `content`
//! bytes of plaintext and MAC, well-formed padding needs
//! `p = block_size - content % block_size` bytes; most families use
//! `p + block_size` bytes so there is always a non-length byte to corrupt.
//!
//! A single length byte claims at most 256 bytes of padding, so
//! [`VectorKind::LengthByteTooLarge`] is only generated while the padded
//! plaintext is shorter than that.
//!
//! ```text
//! plaintext ('A' * n) | MAC | padding (family specific) ─▶ CBC ─▶ fragment
//! ```

use bytes::Bytes;
use fracture_proto::tls::{CipherSuite, ContentType, ProtocolVersion, Record};
use serde::{Deserialize, Serialize};

use super::GeneratorError;
use crate::{layer::LayerKind, unit::ConfiguredUnit, workflow::WorkflowTrace};

/// Byte filling the application data of every vector.
pub const FILLER: u8 = b'A';

/// How a vector's padding is malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VectorKind {
    /// Length byte is right, every other padding byte is wrong
    LastByteCorrectOthersWrong,
    /// First padding byte flipped
    FirstByteFlipped,
    /// A padding byte in the middle flipped
    MiddleByteFlipped,
    /// Length byte flipped
    LengthByteFlipped,
    /// Length byte claims one byte more than the padding holds
    LengthByteOffByOne,
    /// Padding claims more bytes than the record holds; omitted once the
    /// padded plaintext reaches 256 bytes
    LengthByteTooLarge,
    /// No MAC; well-formed padding takes its place
    MissingMac,
    /// Padding of zero bytes
    ZeroPadding,
}

impl VectorKind {
    /// Every family, in generation order.
    pub const ALL: [Self; 8] = [
        Self::LastByteCorrectOthersWrong,
        Self::FirstByteFlipped,
        Self::MiddleByteFlipped,
        Self::LengthByteFlipped,
        Self::LengthByteOffByOne,
        Self::LengthByteTooLarge,
        Self::MissingMac,
        Self::ZeroPadding,
    ];
}

/// One malformed record and the family it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddingOracleVector {
    /// Family
    pub kind: VectorKind,
    /// Record with explicit content type, version, plaintext and padding
    pub record: Record,
}

impl PaddingOracleVector {
    /// Appends the malformed record and a generic receive to `prefix`.
    ///
    /// `prefix` is expected to complete a handshake so the record is sent
    /// under negotiated keys. The trace continues on failure: a peer that
    /// resets the connection is itself an oracle response.
    pub fn into_trace(self, prefix: WorkflowTrace) -> WorkflowTrace {
        prefix
            .send_units(LayerKind::Record, [ConfiguredUnit::prepared(self.record)])
            .generic_receive()
            .continue_on_failure()
    }
}

/// Builds one vector per [`VectorKind`] for `app_len` bytes of application
/// data under `suite` and `version`, leaving out families the layout cannot
/// express.
///
/// # Errors
///
/// Returns [`GeneratorError::NotCbc`] for suites without CBC parameters and
/// [`GeneratorError::UnsupportedVersion`] outside TLS 1.0 to 1.2.
pub fn generate(
    suite: CipherSuite,
    version: ProtocolVersion,
    app_len: usize,
) -> Result<Vec<PaddingOracleVector>, GeneratorError> {
    let params = suite.cbc_parameters().ok_or(GeneratorError::NotCbc(suite))?;
    if !(ProtocolVersion::TLS1_0..=ProtocolVersion::TLS1_2).contains(&version) {
        return Err(GeneratorError::UnsupportedVersion(version));
    }
    let layout = Layout { block_size: params.block_size, mac_len: params.mac_len, app_len };

    let vectors = VectorKind::ALL
        .into_iter()
        .filter_map(|kind| {
            let padding = layout.padding(kind)?;
            let mut record = Record::default();
            record.content_type.set_explicit(ContentType::APPLICATION_DATA);
            record.version.set_explicit(version);
            record.computations.plaintext.set_explicit(Bytes::from(vec![FILLER; app_len]));
            if kind == VectorKind::MissingMac {
                record.computations.mac.set_explicit(Bytes::new());
            }
            record.computations.padding.set_explicit(Bytes::from(padding));
            Some(PaddingOracleVector { kind, record })
        })
        .collect();
    tracing::debug!(?suite, ?version, app_len, "generated padding oracle vectors");
    Ok(vectors)
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    block_size: usize,
    mac_len: usize,
    app_len: usize,
}

impl Layout {
    /// Padding that aligns `content` bytes, at least `min` long.
    fn aligned(&self, content: usize, min: usize) -> usize {
        let short = (content + min) % self.block_size;
        if short == 0 { min } else { min + self.block_size - short }
    }

    fn padding(&self, kind: VectorKind) -> Option<Vec<u8>> {
        let content = self.app_len + self.mac_len;
        let len = self.aligned(content, self.block_size + 1);
        let length_byte = (len - 1) as u8;
        let last = len - 1;

        let mut padding = vec![length_byte; len];
        match kind {
            VectorKind::LastByteCorrectOthersWrong => {
                padding[..last].fill(length_byte.wrapping_add(1));
            },
            VectorKind::FirstByteFlipped => padding[0] ^= 0x80,
            VectorKind::MiddleByteFlipped => padding[len / 2] ^= 0x80,
            VectorKind::LengthByteFlipped => padding[last] ^= 0x80,
            VectorKind::LengthByteOffByOne => padding[last] = length_byte.wrapping_add(1),
            VectorKind::LengthByteTooLarge => {
                if content + len > usize::from(u8::MAX) {
                    return None;
                }
                padding.fill(u8::MAX);
            },
            VectorKind::MissingMac => {
                let len = self.aligned(self.app_len, self.mac_len + 1);
                padding = vec![(len - 1) as u8; len];
            },
            VectorKind::ZeroPadding => padding.fill(0),
        }
        Some(padding)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::{
        crypto::{CryptoBackend, KeyDerivationInput, NullCrypto},
        pipeline,
        state::{ConnectionConfig, ConnectionState, Role},
        workflow::{Action, FailurePolicy},
    };

    const SUITE: CipherSuite = CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA;

    fn keyed(version: ProtocolVersion) -> ConnectionState {
        let mut state = ConnectionState::new(ConnectionConfig::client().with_seed(9)).unwrap();
        let keys = NullCrypto
            .derive_record_keys(&KeyDerivationInput {
                suite: SUITE,
                version,
                client_random: Bytes::new(),
                server_random: Bytes::new(),
                writer: Role::Client,
            })
            .unwrap();
        state.tls.write.activate(keys);
        state
    }

    fn padding(vector: &PaddingOracleVector) -> &[u8] {
        vector.record.computations.padding.get().unwrap()
    }

    #[test]
    fn rejects_suites_and_versions_without_cbc_records() {
        let gcm = CipherSuite::TLS_RSA_WITH_AES_128_GCM_SHA256;
        assert_eq!(
            generate(gcm, ProtocolVersion::TLS1_2, 16).unwrap_err(),
            GeneratorError::NotCbc(gcm)
        );
        assert_eq!(
            generate(SUITE, ProtocolVersion::TLS1_3, 16).unwrap_err(),
            GeneratorError::UnsupportedVersion(ProtocolVersion::TLS1_3)
        );
        assert_eq!(
            generate(SUITE, ProtocolVersion::SSL3_0, 16).unwrap_err(),
            GeneratorError::UnsupportedVersion(ProtocolVersion::SSL3_0)
        );
    }

    #[test]
    fn every_family_has_a_distinct_aligned_layout() {
        for app_len in [0, 1, 11, 12, 40] {
            let vectors = generate(SUITE, ProtocolVersion::TLS1_1, app_len).unwrap();
            assert_eq!(vectors.len(), VectorKind::ALL.len());

            let layouts: HashSet<&[u8]> = vectors.iter().map(padding).collect();
            assert_eq!(layouts.len(), vectors.len(), "app_len {app_len}");

            for vector in &vectors {
                let mac = if vector.kind == VectorKind::MissingMac { 0 } else { 20 };
                let total = app_len + mac + padding(vector).len();
                assert_eq!(total % 16, 0, "{:?} with app_len {app_len}", vector.kind);
            }
        }
    }

    #[test]
    fn padding_patterns() {
        // 11 + 20 bytes of content leave room for one byte, so 17 bytes of padding.
        let vectors = generate(SUITE, ProtocolVersion::TLS1_2, 11).unwrap();
        let of = |kind| padding(vectors.iter().find(|v| v.kind == kind).unwrap()).to_vec();

        let mut expected = vec![16; 17];
        expected[0] = 0x90;
        assert_eq!(of(VectorKind::FirstByteFlipped), expected);

        let others_wrong = of(VectorKind::LastByteCorrectOthersWrong);
        assert_eq!(others_wrong[16], 16);
        assert!(others_wrong[..16].iter().all(|&b| b == 17));

        assert_eq!(of(VectorKind::LengthByteOffByOne)[16], 17);
        assert_eq!(of(VectorKind::LengthByteTooLarge), vec![0xff; 17]);
        assert_eq!(of(VectorKind::ZeroPadding), vec![0; 17]);
        assert_eq!(of(VectorKind::MissingMac), vec![20; 21]);
    }

    #[test]
    fn oversized_length_claims_exceed_the_record() {
        for app_len in [16, 200, 203, 204, 219, 300, 1000] {
            let vectors = generate(SUITE, ProtocolVersion::TLS1_2, app_len).unwrap();
            let too_large = vectors.iter().find(|v| v.kind == VectorKind::LengthByteTooLarge);
            let others = vectors.iter().filter(|v| v.kind != VectorKind::LengthByteTooLarge);
            assert_eq!(others.count(), VectorKind::ALL.len() - 1, "app_len {app_len}");

            match too_large {
                Some(vector) => {
                    let claimed = usize::from(*padding(vector).last().unwrap()) + 1;
                    let held = app_len + 20 + padding(vector).len();
                    assert!(claimed > held, "app_len {app_len}: {claimed} <= {held}");
                },
                None => {
                    let zero = vectors.iter().find(|v| v.kind == VectorKind::ZeroPadding).unwrap();
                    let held = app_len + 20 + padding(zero).len();
                    assert!(held >= 256, "app_len {app_len} lost the family at {held} bytes");
                },
            }
        }
    }

    #[test]
    fn vectors_encode_with_their_padding_intact() {
        let mut state = keyed(ProtocolVersion::TLS1_2);
        for vector in generate(SUITE, ProtocolVersion::TLS1_2, 5).unwrap() {
            let expected = padding(&vector).to_vec();
            let mut record = vector.record;
            let out = pipeline::send(&mut record, true, &mut state).unwrap();

            let (decoded, consumed) = Record::decode(&out.bytes).unwrap();
            assert_eq!(consumed, out.bytes.len());
            assert_eq!(decoded.content_type.get(), Some(&ContentType::APPLICATION_DATA));
            let fragment = decoded.fragment.get().unwrap();
            assert_eq!(fragment.len() % 16, 0);
            assert!(fragment.ends_with(&expected), "{:?}", vector.kind);
        }
    }

    #[test]
    fn vector_trace_continues_on_failure() {
        let vector = generate(SUITE, ProtocolVersion::TLS1_0, 3).unwrap().remove(0);
        let trace = vector.into_trace(WorkflowTrace::new().generic_receive());

        assert_eq!(trace.policy(), FailurePolicy::Continue);
        let actions: Vec<&Action> = trace.actions().iter().map(|a| a.action()).collect();
        assert_eq!(actions.len(), 3);
        assert!(matches!(actions[1], Action::Send { configurations }
            if configurations[0].layer == LayerKind::Record));
        assert_eq!(actions[2], &Action::GenericReceive);
    }
}
