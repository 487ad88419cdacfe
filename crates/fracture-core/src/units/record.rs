//! TLS record units and CBC record protection.
//!
//! A protected record's fragment is assembled as
//!
//! ```text
//! [explicit IV] || CBC( plaintext || MAC || padding )
//! ```
//!
//! where the IV is written only for TLS 1.1 and later. Every intermediate
//! lives in [`RecordComputations`](fracture_proto::tls::RecordComputations),
//! so any of them can be overridden while the rest are still derived.
//!
//! Epochs change on the record layer: sending or receiving a record of
//! content type ChangeCipherSpec activates fresh keys for that direction,
//! so the following record in the same flight is already protected.

use bytes::{BufMut, Bytes, BytesMut};
use fracture_proto::{
    ProtocolError,
    codec::fit_u16,
    tls::{ContentType, ProtocolVersion, Record},
};

use crate::{
    crypto::{CryptoError, KeyDerivationInput},
    error::{AdjustmentError, PipelineError},
    state::{ConnectionState, Direction, PrepareContext},
    unit::{UnitKind, WireUnit},
};

/// Bytes the MAC covers: sequence number, header fields and plaintext.
///
/// # Errors
///
/// Returns [`ProtocolError::ValueOutOfRange`] when the plaintext length does
/// not fit its 16-bit field.
pub fn mac_input(
    sequence: u64,
    content_type: ContentType,
    version: ProtocolVersion,
    plaintext: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    let len = fit_u16("record.plaintext", plaintext.len())?;
    let mut input = Vec::with_capacity(13 + plaintext.len());
    input.put_u64(sequence);
    input.put_u8(content_type.0);
    input.put_u16(version.0);
    input.put_u16(len);
    input.put_slice(plaintext);
    Ok(input)
}

/// Well-formed CBC padding for `content_len` bytes, length byte included.
pub(crate) fn valid_padding(content_len: usize, block_size: usize) -> Bytes {
    let count = block_size - content_len % block_size;
    Bytes::from(vec![(count - 1) as u8; count])
}

impl WireUnit for Record {
    fn kind(&self) -> UnitKind {
        UnitKind::Record
    }

    fn compute_defaults(&mut self, ctx: &mut PrepareContext<'_>) -> Result<(), PipelineError> {
        self.version.set_computed(ctx.tls.record_version());
        if !self.fragment.is_explicit() {
            let fragment = protect(self, ctx)?;
            self.fragment.set_computed(fragment);
        }
        let len = self.fragment.resolve("record.fragment")?.len();
        self.length.set_computed(fit_u16("record.length", len)?);
        Ok(())
    }

    fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut out = BytesMut::new();
        Record::encode(self, &mut out)?;
        Ok(out.freeze())
    }

    fn apply_effects(
        &self,
        state: &mut ConnectionState,
        direction: Direction,
    ) -> Result<(), AdjustmentError> {
        let records = match direction {
            Direction::Outbound => &mut state.tls.write,
            Direction::Inbound => &mut state.tls.read,
        };
        records.advance();
        if let Some(block_size) = records.keys().map(|keys| keys.params.block_size) {
            let fragment = self.fragment.resolve("record.fragment")?;
            if fragment.len() >= block_size {
                records.set_residue(fragment.slice(fragment.len() - block_size..));
            }
        }

        if self.content_type.get() == Some(&ContentType::CHANGE_CIPHER_SPEC) {
            activate_next_epoch(state, direction)?;
        }
        Ok(())
    }
}

fn protect(record: &mut Record, ctx: &mut PrepareContext<'_>) -> Result<Bytes, PipelineError> {
    let tls = ctx.tls;
    let crypto = ctx.crypto;
    let plaintext = record.computations.plaintext.resolve("record.plaintext")?.clone();
    let Some(keys) = tls.write().keys() else {
        return Ok(plaintext);
    };

    let version = record.version.value("record.version")?;
    let content_type = record.content_type.value("record.content_type")?;
    let sequence = tls.write().next_sequence().number;
    record.computations.sequence_number = Some(sequence);

    let mac = crypto.record_mac(keys, &mac_input(sequence, content_type, version, &plaintext)?)?;
    record.computations.mac.set_computed(mac);
    let mac = record.computations.mac.resolve("record.mac")?;

    let block_size = keys.params.block_size;
    let padding = valid_padding(plaintext.len() + mac.len(), block_size);
    record.computations.padding.set_computed(padding);
    let padding = record.computations.padding.resolve("record.padding")?;

    let explicit_iv = version.uses_explicit_iv();
    if explicit_iv {
        record.computations.iv.compute_if_unset(|| ctx.random_bytes(block_size));
    } else if let Some(residue) = tls.write().cbc_residue() {
        record.computations.iv.set_computed(residue.clone());
    }
    let iv = record.computations.iv.resolve("record.iv")?;

    let mut body = BytesMut::with_capacity(plaintext.len() + mac.len() + padding.len());
    body.put_slice(&plaintext);
    body.put_slice(mac);
    body.put_slice(padding);
    let ciphertext = crypto.encrypt_cbc(keys, iv, &body)?;

    let mut fragment = BytesMut::with_capacity(iv.len() + ciphertext.len());
    if explicit_iv {
        fragment.put_slice(iv);
    }
    fragment.put_slice(&ciphertext);
    Ok(fragment.freeze())
}

fn activate_next_epoch(
    state: &mut ConnectionState,
    direction: Direction,
) -> Result<(), AdjustmentError> {
    let missing = |what: &str| AdjustmentError::Inconsistent {
        unit: "ChangeCipherSpec record",
        reason: format!("{what} not negotiated"),
    };
    let tls = state.tls();
    let input = KeyDerivationInput {
        suite: tls.selected_suite().ok_or_else(|| missing("cipher suite"))?,
        version: tls.record_version(),
        client_random: tls.client_random().cloned().ok_or_else(|| missing("client random"))?,
        server_random: tls.server_random().cloned().ok_or_else(|| missing("server random"))?,
        writer: match direction {
            Direction::Outbound => state.role(),
            Direction::Inbound => state.role().peer(),
        },
    };
    let keys = state.crypto().derive_record_keys(&input)?;

    match direction {
        Direction::Outbound => state.tls.write.activate(keys),
        Direction::Inbound => state.tls.read.activate(keys),
    }
    Ok(())
}

/// Removes protection from a received record, filling in its computations.
///
/// Without active read keys the fragment is the plaintext. Otherwise the
/// padding is verified before the MAC, and the two failures are reported as
/// [`CryptoError::BadPadding`] and [`CryptoError::BadMac`]. The plaintext is
/// filled in even when the MAC does not verify.
///
/// # Errors
///
/// Returns [`PipelineError::Crypto`] when the record does not unprotect.
pub fn open_record(record: &mut Record, state: &ConnectionState) -> Result<(), PipelineError> {
    let fragment = record.fragment.resolve("record.fragment")?.clone();
    let read = state.tls().read();
    let Some(keys) = read.keys() else {
        record.computations.plaintext.set_computed(fragment);
        return Ok(());
    };

    let version = record.version.value("record.version")?;
    let content_type = record.content_type.value("record.content_type")?;
    let block_size = keys.params.block_size;
    let (iv, ciphertext) = if version.uses_explicit_iv() {
        if fragment.len() < block_size {
            return Err(CryptoError::BadLength { length: fragment.len(), block_size }.into());
        }
        (fragment.slice(..block_size), fragment.slice(block_size..))
    } else {
        let iv = read.cbc_residue().cloned().ok_or(CryptoError::MissingKeys("CBC residue"))?;
        (iv, fragment)
    };
    if ciphertext.is_empty() || ciphertext.len() % block_size != 0 {
        return Err(CryptoError::BadLength { length: ciphertext.len(), block_size }.into());
    }

    let decrypted = state.crypto().decrypt_cbc(keys, &iv, &ciphertext)?;
    record.computations.iv.set_computed(iv);

    let Some(&last) = decrypted.last() else {
        return Err(CryptoError::BadPadding.into());
    };
    let padding_len = usize::from(last) + 1;
    if padding_len > decrypted.len()
        || !decrypted[decrypted.len() - padding_len..].iter().all(|&byte| byte == last)
    {
        return Err(CryptoError::BadPadding.into());
    }
    let content_end = decrypted.len() - padding_len;
    record.computations.padding.set_computed(decrypted.slice(content_end..));

    let mac_len = keys.params.mac_len;
    if content_end < mac_len {
        return Err(CryptoError::BadMac.into());
    }
    let plaintext = decrypted.slice(..content_end - mac_len);
    let mac = decrypted.slice(content_end - mac_len..content_end);
    let sequence = read.next_sequence().number;
    let input = mac_input(sequence, content_type, version, &plaintext)?;
    let expected = state.crypto().record_mac(keys, &input)?;

    record.computations.sequence_number = Some(sequence);
    record.computations.mac.set_computed(mac.clone());
    record.computations.plaintext.set_computed(plaintext);
    if expected != mac {
        return Err(CryptoError::BadMac.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use fracture_proto::{Overridable, tls::CipherSuite};

    use super::*;
    use crate::{
        crypto::{CryptoBackend, NullCrypto},
        state::{ConnectionConfig, Role},
    };

    const SUITE: CipherSuite = CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA;

    fn keyed(role: Role, version: ProtocolVersion) -> ConnectionState {
        let config = match role {
            Role::Client => ConnectionConfig::client(),
            Role::Server => ConnectionConfig::server(),
        };
        let mut state = ConnectionState::new(config.with_seed(3)).unwrap();
        state.tls.selected_suite = Some(SUITE);
        state.tls.selected_version = Some(version);
        state.tls.client_random = Some(Bytes::from_static(&[1; 32]));
        state.tls.server_random = Some(Bytes::from_static(&[2; 32]));
        let keys = NullCrypto
            .derive_record_keys(&KeyDerivationInput {
                suite: SUITE,
                version,
                client_random: Bytes::new(),
                server_random: Bytes::new(),
                writer: Role::Client,
            })
            .unwrap();
        state.tls.write.activate(keys.clone());
        state.tls.read.activate(keys);
        state
    }

    fn sent(mut record: Record, state: &mut ConnectionState) -> Record {
        record.compute_defaults(&mut state.prepare_context()).unwrap();
        record.apply_effects(state, Direction::Outbound).unwrap();
        record
    }

    fn received(record: &Record) -> Record {
        let (decoded, _) = Record::decode(&WireUnit::encode(record).unwrap()).unwrap();
        decoded
    }

    #[test]
    fn clear_records_carry_plaintext() {
        let mut state = ConnectionState::new(ConnectionConfig::client()).unwrap();
        let record = sent(Record::with_content(ContentType::HANDSHAKE, &b"hello"[..]), &mut state);
        assert_eq!(record.fragment.get().map(|f| &f[..]), Some(&b"hello"[..]));
        assert_eq!(record.length.get(), Some(&5));
        assert_eq!(record.version.get(), Some(&ProtocolVersion::TLS1_0));
    }

    #[test]
    fn protected_layout_with_explicit_iv() {
        let mut state = keyed(Role::Client, ProtocolVersion::TLS1_2);
        let record =
            sent(Record::with_content(ContentType::APPLICATION_DATA, &b"hello"[..]), &mut state);
        let fragment = record.fragment.get().unwrap();

        // iv(16) + plaintext(5) + mac(20) + padding(7)
        assert_eq!(fragment.len(), 48);
        assert_eq!(&fragment[16..21], b"hello");
        assert_eq!(&fragment[41..], &[6; 7]);
        assert_eq!(record.computations.sequence_number, Some(0));
    }

    #[test]
    fn oversized_plaintext_is_out_of_range_for_the_mac() {
        let mut state = keyed(Role::Client, ProtocolVersion::TLS1_2);
        let mut record = Record::with_content(ContentType::APPLICATION_DATA, vec![0; 70_000]);
        let err = record.compute_defaults(&mut state.prepare_context()).unwrap_err();
        assert_eq!(
            err,
            PipelineError::Protocol(ProtocolError::ValueOutOfRange {
                field: "record.plaintext",
                value: 70_000,
                max: 65_535,
            })
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn protected_record_opens_on_the_other_side() {
        let mut client = keyed(Role::Client, ProtocolVersion::TLS1_2);
        let server = keyed(Role::Server, ProtocolVersion::TLS1_2);
        let record =
            sent(Record::with_content(ContentType::APPLICATION_DATA, &b"ping"[..]), &mut client);

        let mut inbound = received(&record);
        open_record(&mut inbound, &server).unwrap();
        assert_eq!(inbound.computations.plaintext.get().map(|p| &p[..]), Some(&b"ping"[..]));
        assert_eq!(WireUnit::encode(&inbound).unwrap(), WireUnit::encode(&record).unwrap());
    }

    #[test]
    fn bad_padding_is_reported_before_mac() {
        let mut client = keyed(Role::Client, ProtocolVersion::TLS1_2);
        let server = keyed(Role::Server, ProtocolVersion::TLS1_2);
        let mut record = Record::with_content(ContentType::APPLICATION_DATA, &b"hello"[..]);
        let padding = Bytes::from_static(&[0, 0, 0, 0, 0, 0, 6]);
        record.computations.padding = Overridable::explicit(padding);
        let record = sent(record, &mut client);

        let mut inbound = received(&record);
        assert_eq!(open_record(&mut inbound, &server), Err(CryptoError::BadPadding.into()));
    }

    #[test]
    fn missing_mac_is_a_mac_failure() {
        let mut client = keyed(Role::Client, ProtocolVersion::TLS1_2);
        let server = keyed(Role::Server, ProtocolVersion::TLS1_2);
        let mut record = Record::with_content(ContentType::APPLICATION_DATA, &b"hello"[..]);
        record.computations.mac = Overridable::explicit(Bytes::new());
        let record = sent(record, &mut client);
        assert_eq!(record.computations.padding.get().map(Bytes::len), Some(11));

        let mut inbound = received(&record);
        assert_eq!(open_record(&mut inbound, &server), Err(CryptoError::BadMac.into()));
    }

    #[test]
    fn tls10_chains_iv_from_previous_ciphertext() {
        let mut state = keyed(Role::Client, ProtocolVersion::TLS1_0);
        let app = |fill: u8| Record::with_content(ContentType::APPLICATION_DATA, vec![fill; 11]);
        let first = sent(app(1), &mut state);
        assert_eq!(first.computations.iv.get().map(|iv| &iv[..]), Some(&[0u8; 16][..]));
        let fragment = first.fragment.get().unwrap().clone();
        assert_eq!(fragment.len(), 32);

        let second = sent(app(2), &mut state);
        assert_eq!(second.computations.iv.get(), Some(&fragment.slice(16..)));
    }

    #[test]
    fn sequence_numbers_increase_per_record() {
        let mut state = keyed(Role::Client, ProtocolVersion::TLS1_2);
        let numbers: Vec<_> = (0..3)
            .map(|_| {
                let record = Record::with_content(ContentType::APPLICATION_DATA, &b"x"[..]);
                sent(record, &mut state).computations.sequence_number
            })
            .collect();
        assert_eq!(numbers, vec![Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn change_cipher_spec_record_starts_new_epoch() {
        let mut state = keyed(Role::Client, ProtocolVersion::TLS1_2);
        let epoch = state.tls().write().epoch();
        sent(Record::with_content(ContentType::CHANGE_CIPHER_SPEC, &[1u8][..]), &mut state);
        assert_eq!(state.tls().write().epoch(), epoch + 1);
        assert_eq!(state.tls().write().next_sequence().number, 0);
    }

    #[test]
    fn change_cipher_spec_record_without_suite_fails() {
        let mut state = ConnectionState::new(ConnectionConfig::client()).unwrap();
        let mut record = Record::with_content(ContentType::CHANGE_CIPHER_SPEC, &[1u8][..]);
        record.compute_defaults(&mut state.prepare_context()).unwrap();
        assert!(matches!(
            record.apply_effects(&mut state, Direction::Outbound),
            Err(AdjustmentError::Inconsistent { .. })
        ));
        assert_eq!(state.tls().write().epoch(), 0);
    }
}
