//! Connection configuration and mutable connection state.
//!
//! [`ConnectionState`] is the single record every layer reads from and
//! writes to while processing units. It holds everything a unit may need to
//! compute its defaults (negotiated parameters, sequence numbers, keys) and
//! everything a received unit may change.
//!
//! Mutation happens in exactly one place: a unit's apply-effects step. The
//! per-protocol contexts expose read-only getters; their setters are
//! crate-private.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use bytes::Bytes;
use fracture_proto::{
    quic::PacketSpace,
    tls::{AlertDescription, AlertLevel, CipherSuite, ProtocolVersion},
};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::{
    crypto::{CryptoBackend, NullCrypto, RecordKeys},
    error::ConfigError,
};

/// Largest fragment a TLS record length field can describe.
const MAX_FRAGMENT_LIMIT: usize = u16::MAX as usize;

/// Longest QUIC connection id (RFC 9000 Section 17.2).
const MAX_CID_LEN: usize = 20;

/// Connection id the client uses for itself by default.
pub const DEFAULT_CLIENT_CID: [u8; 8] = [0xc1, 0, 0, 0, 0, 0, 0, 1];

/// Connection id the server uses for itself by default.
pub const DEFAULT_SERVER_CID: [u8; 8] = [0x5e, 0, 0, 0, 0, 0, 0, 1];

/// Which end of the connection this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Role {
    /// Initiates the connection
    #[default]
    Client,
    /// Accepts the connection
    Server,
}

impl Role {
    /// The opposite role.
    #[must_use]
    pub fn peer(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Direction a unit travels relative to this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Sent by this endpoint
    Outbound,
    /// Received from the peer
    Inbound,
}

/// QUIC parameters of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuicConfig {
    /// Version written into long headers
    pub version: u32,
    /// Connection id this endpoint is addressed by
    pub local_cid: Vec<u8>,
    /// Connection id used to address the peer until it announces its own
    pub remote_cid: Vec<u8>,
    /// Minimum size of datagrams carrying a client Initial packet
    pub initial_datagram_size: usize,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            version: 1,
            local_cid: DEFAULT_CLIENT_CID.to_vec(),
            remote_cid: DEFAULT_SERVER_CID.to_vec(),
            initial_datagram_size: 1200,
        }
    }
}

/// HTTP parameters of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Value of the computed Host header
    pub host: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { host: "localhost".to_string() }
    }
}

/// Static configuration of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Role this endpoint plays
    pub role: Role,
    /// Highest TLS version offered or accepted
    pub highest_version: ProtocolVersion,
    /// Cipher suites offered (client) or accepted in preference order (server)
    pub cipher_suites: Vec<CipherSuite>,
    /// Largest record fragment sent unless negotiated lower
    pub max_fragment_length: usize,
    /// Seed for all computed randomness; `None` draws from OS entropy
    pub seed: Option<u64>,
    /// QUIC parameters
    pub quic: QuicConfig,
    /// HTTP parameters
    pub http: HttpConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            role: Role::Client,
            highest_version: ProtocolVersion::TLS1_2,
            cipher_suites: vec![
                CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA,
                CipherSuite::TLS_RSA_WITH_AES_256_CBC_SHA,
            ],
            max_fragment_length: 1 << 14,
            seed: None,
            quic: QuicConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Default client configuration.
    pub fn client() -> Self {
        Self::default()
    }

    /// Default server configuration, with connection ids mirrored.
    pub fn server() -> Self {
        Self {
            role: Role::Server,
            quic: QuicConfig {
                local_cid: DEFAULT_SERVER_CID.to_vec(),
                remote_cid: DEFAULT_CLIENT_CID.to_vec(),
                ..QuicConfig::default()
            },
            ..Self::default()
        }
    }

    /// Sets the randomness seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Replaces the cipher suite list.
    #[must_use]
    pub fn with_cipher_suites(mut self, suites: impl Into<Vec<CipherSuite>>) -> Self {
        self.cipher_suites = suites.into();
        self
    }

    /// Checks that the pipeline can operate with this configuration.
    ///
    /// # Errors
    ///
    /// - `max_fragment_length` is zero or exceeds what a record can carry
    /// - the cipher suite list is empty
    /// - a connection id is longer than 20 bytes
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_fragment_length == 0 || self.max_fragment_length > MAX_FRAGMENT_LIMIT {
            return Err(ConfigError::Invalid {
                field: "max_fragment_length",
                reason: format!(
                    "{} is outside 1..={MAX_FRAGMENT_LIMIT}",
                    self.max_fragment_length
                ),
            });
        }
        if self.cipher_suites.is_empty() {
            return Err(ConfigError::Invalid {
                field: "cipher_suites",
                reason: "at least one suite is required".to_string(),
            });
        }
        let cids = [
            ("quic.local_cid", &self.quic.local_cid),
            ("quic.remote_cid", &self.quic.remote_cid),
        ];
        for (field, cid) in cids {
            if cid.len() > MAX_CID_LEN {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{} bytes exceeds {MAX_CID_LEN}", cid.len()),
                });
            }
        }
        Ok(())
    }
}

/// Position of a record in its direction's sequence.
///
/// Ordered by epoch, then by number: a record sent after a key change sorts
/// after every record sent before it, even though the number restarts at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordSequence {
    /// Key epoch, incremented on every ChangeCipherSpec
    pub epoch: u16,
    /// Record number within the epoch
    pub number: u64,
}

/// Record protection state of one direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordDirection {
    epoch: u16,
    next_number: u64,
    last: Option<RecordSequence>,
    keys: Option<RecordKeys>,
    cbc_residue: Option<Bytes>,
}

impl RecordDirection {
    /// Current key epoch.
    pub fn epoch(&self) -> u16 {
        self.epoch
    }

    /// Sequence the next record in this direction will use.
    pub fn next_sequence(&self) -> RecordSequence {
        RecordSequence { epoch: self.epoch, number: self.next_number }
    }

    /// Sequence of the last record processed, if any.
    pub fn last_sequence(&self) -> Option<RecordSequence> {
        self.last
    }

    /// Active keys; `None` while records travel in the clear.
    pub fn keys(&self) -> Option<&RecordKeys> {
        self.keys.as_ref()
    }

    /// Last ciphertext block, the implicit IV of the next TLS 1.0 record.
    pub fn cbc_residue(&self) -> Option<&Bytes> {
        self.cbc_residue.as_ref()
    }

    pub(crate) fn advance(&mut self) -> RecordSequence {
        let current = self.next_sequence();
        self.last = Some(current);
        self.next_number += 1;
        current
    }

    pub(crate) fn set_residue(&mut self, block: Bytes) {
        self.cbc_residue = Some(block);
    }

    pub(crate) fn activate(&mut self, keys: RecordKeys) {
        self.epoch = self.epoch.wrapping_add(1);
        self.next_number = 0;
        self.cbc_residue = Some(keys.iv.clone());
        self.keys = Some(keys);
    }
}

/// TLS negotiation and record state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsContext {
    pub(crate) client_version: Option<ProtocolVersion>,
    pub(crate) selected_version: Option<ProtocolVersion>,
    pub(crate) selected_suite: Option<CipherSuite>,
    pub(crate) offered_suites: Vec<CipherSuite>,
    pub(crate) client_random: Option<Bytes>,
    pub(crate) server_random: Option<Bytes>,
    pub(crate) session_id: Option<Bytes>,
    pub(crate) max_fragment_length: Option<usize>,
    pub(crate) transcript: Vec<u8>,
    pub(crate) write: RecordDirection,
    pub(crate) read: RecordDirection,
    pub(crate) client_verify_data: Option<Bytes>,
    pub(crate) server_verify_data: Option<Bytes>,
    pub(crate) server_hello_done: bool,
    pub(crate) change_cipher_specs: usize,
    pub(crate) alerts_sent: Vec<(AlertLevel, AlertDescription)>,
    pub(crate) alerts_received: Vec<(AlertLevel, AlertDescription)>,
    pub(crate) app_data_sent: u64,
    pub(crate) app_data_received: u64,
}

impl TlsContext {
    /// Version the client offered in its hello.
    pub fn client_version(&self) -> Option<ProtocolVersion> {
        self.client_version
    }

    /// Version chosen by the ServerHello.
    pub fn selected_version(&self) -> Option<ProtocolVersion> {
        self.selected_version
    }

    /// Cipher suite chosen by the ServerHello.
    pub fn selected_suite(&self) -> Option<CipherSuite> {
        self.selected_suite
    }

    /// Suites listed in the ClientHello.
    pub fn offered_suites(&self) -> &[CipherSuite] {
        &self.offered_suites
    }

    /// Client hello random.
    pub fn client_random(&self) -> Option<&Bytes> {
        self.client_random.as_ref()
    }

    /// Server hello random.
    pub fn server_random(&self) -> Option<&Bytes> {
        self.server_random.as_ref()
    }

    /// Session id chosen by the server.
    pub fn session_id(&self) -> Option<&Bytes> {
        self.session_id.as_ref()
    }

    /// Fragment limit negotiated through the max_fragment_length extension.
    pub fn max_fragment_length(&self) -> Option<usize> {
        self.max_fragment_length
    }

    /// Concatenated handshake messages in processing order.
    pub fn transcript(&self) -> &[u8] {
        &self.transcript
    }

    /// Outbound record state.
    pub fn write(&self) -> &RecordDirection {
        &self.write
    }

    /// Inbound record state.
    pub fn read(&self) -> &RecordDirection {
        &self.read
    }

    /// Verify data of the client's Finished.
    pub fn client_verify_data(&self) -> Option<&Bytes> {
        self.client_verify_data.as_ref()
    }

    /// Verify data of the server's Finished.
    pub fn server_verify_data(&self) -> Option<&Bytes> {
        self.server_verify_data.as_ref()
    }

    /// Whether a ServerHelloDone has been processed.
    pub fn server_hello_done(&self) -> bool {
        self.server_hello_done
    }

    /// ChangeCipherSpec messages processed in either direction.
    pub fn change_cipher_specs(&self) -> usize {
        self.change_cipher_specs
    }

    /// Alerts this endpoint sent.
    pub fn alerts_sent(&self) -> &[(AlertLevel, AlertDescription)] {
        &self.alerts_sent
    }

    /// Alerts received from the peer.
    pub fn alerts_received(&self) -> &[(AlertLevel, AlertDescription)] {
        &self.alerts_received
    }

    /// Application data bytes sent.
    pub fn app_data_sent(&self) -> u64 {
        self.app_data_sent
    }

    /// Application data bytes received.
    pub fn app_data_received(&self) -> u64 {
        self.app_data_received
    }

    /// Version written into record headers: the negotiated one, or TLS 1.0
    /// before negotiation.
    pub fn record_version(&self) -> ProtocolVersion {
        self.selected_version.unwrap_or(ProtocolVersion::TLS1_0)
    }
}

/// A packet this endpoint sent that has not been acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentPacket {
    /// Whether the peer must acknowledge it
    pub ack_eliciting: bool,
    /// Encoded payload size
    pub size: usize,
}

/// Per packet number space bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpaceState {
    pub(crate) next_packet_number: u64,
    pub(crate) largest_sent: Option<u64>,
    pub(crate) largest_acked: Option<u64>,
    pub(crate) largest_received: Option<u64>,
    pub(crate) received: BTreeSet<u64>,
    pub(crate) ack_pending: bool,
    pub(crate) sent: BTreeMap<u64, SentPacket>,
    pub(crate) crypto_sent: u64,
    pub(crate) crypto_received: u64,
}

impl SpaceState {
    /// Packet number the next packet in this space will use.
    pub fn next_packet_number(&self) -> u64 {
        self.next_packet_number
    }

    /// Largest packet number sent.
    pub fn largest_sent(&self) -> Option<u64> {
        self.largest_sent
    }

    /// Largest packet number the peer acknowledged.
    pub fn largest_acked(&self) -> Option<u64> {
        self.largest_acked
    }

    /// Largest packet number received.
    pub fn largest_received(&self) -> Option<u64> {
        self.largest_received
    }

    /// Every packet number received.
    pub fn received(&self) -> &BTreeSet<u64> {
        &self.received
    }

    /// Whether an ack-eliciting frame arrived since the last ACK was sent.
    pub fn ack_pending(&self) -> bool {
        self.ack_pending
    }

    /// Sent packets still awaiting acknowledgement.
    pub fn unacknowledged(&self) -> &BTreeMap<u64, SentPacket> {
        &self.sent
    }

    /// Next CRYPTO offset to send.
    pub fn crypto_sent(&self) -> u64 {
        self.crypto_sent
    }

    /// End of the highest CRYPTO data received.
    pub fn crypto_received(&self) -> u64 {
        self.crypto_received
    }
}

/// Reason a connection was closed with CONNECTION_CLOSE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Application rather than transport close
    pub application: bool,
    /// Error code
    pub error_code: u64,
    /// Reason phrase, lossily decoded
    pub reason: String,
    /// Which side sent it
    pub direction: Direction,
}

/// QUIC connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicContext {
    pub(crate) version: u32,
    pub(crate) local_cid: Bytes,
    pub(crate) remote_cid: Bytes,
    pub(crate) peer_cid_confirmed: bool,
    pub(crate) spaces: [SpaceState; 3],
    pub(crate) stream_sent: BTreeMap<u64, u64>,
    pub(crate) stream_received: BTreeMap<u64, u64>,
    pub(crate) peer_max_data: Option<u64>,
    pub(crate) handshake_done: bool,
    pub(crate) close: Option<CloseInfo>,
}

impl QuicContext {
    fn new(config: &QuicConfig) -> Self {
        Self {
            version: config.version,
            local_cid: Bytes::from(config.local_cid.clone()),
            remote_cid: Bytes::from(config.remote_cid.clone()),
            peer_cid_confirmed: false,
            spaces: Default::default(),
            stream_sent: BTreeMap::new(),
            stream_received: BTreeMap::new(),
            peer_max_data: None,
            handshake_done: false,
            close: None,
        }
    }

    /// Version written into long headers.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Connection id this endpoint is addressed by.
    pub fn local_cid(&self) -> &Bytes {
        &self.local_cid
    }

    /// Connection id used to address the peer.
    pub fn remote_cid(&self) -> &Bytes {
        &self.remote_cid
    }

    /// Bookkeeping of one packet number space.
    pub fn space(&self, space: PacketSpace) -> &SpaceState {
        &self.spaces[space.index()]
    }

    /// Next offset to send on a stream.
    pub fn stream_sent(&self, stream_id: u64) -> u64 {
        self.stream_sent.get(&stream_id).copied().unwrap_or(0)
    }

    /// End of the highest data received on a stream.
    pub fn stream_received(&self, stream_id: u64) -> u64 {
        self.stream_received.get(&stream_id).copied().unwrap_or(0)
    }

    /// Connection flow control limit announced by the peer.
    pub fn peer_max_data(&self) -> Option<u64> {
        self.peer_max_data
    }

    /// Whether HANDSHAKE_DONE has been sent or received.
    pub fn handshake_done(&self) -> bool {
        self.handshake_done
    }

    /// Close information once CONNECTION_CLOSE was processed.
    pub fn close(&self) -> Option<&CloseInfo> {
        self.close.as_ref()
    }

    pub(crate) fn space_mut(&mut self, space: PacketSpace) -> &mut SpaceState {
        &mut self.spaces[space.index()]
    }
}

/// HTTP exchange counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpContext {
    pub(crate) requests_sent: usize,
    pub(crate) requests_received: usize,
    pub(crate) responses_sent: usize,
    pub(crate) responses_received: usize,
    pub(crate) last_status: Option<u16>,
}

impl HttpContext {
    /// Requests sent.
    pub fn requests_sent(&self) -> usize {
        self.requests_sent
    }

    /// Requests received.
    pub fn requests_received(&self) -> usize {
        self.requests_received
    }

    /// Responses sent.
    pub fn responses_sent(&self) -> usize {
        self.responses_sent
    }

    /// Responses received.
    pub fn responses_received(&self) -> usize {
        self.responses_received
    }

    /// Status code of the last response received.
    pub fn last_status(&self) -> Option<u16> {
        self.last_status
    }
}

/// Mutable per-connection record shared by all layers.
///
/// One state belongs to one connection; it is never shared between
/// concurrently running workflows.
#[derive(Debug)]
pub struct ConnectionState {
    config: ConnectionConfig,
    pub(crate) tls: TlsContext,
    pub(crate) quic: QuicContext,
    pub(crate) http: HttpContext,
    crypto: Arc<dyn CryptoBackend>,
    rng: ChaCha20Rng,
}

impl ConnectionState {
    /// Creates a fresh state with [`NullCrypto`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration does not validate.
    pub fn new(config: ConnectionConfig) -> Result<Self, ConfigError> {
        Self::with_crypto(config, Arc::new(NullCrypto))
    }

    /// Creates a fresh state using `crypto` for all protection.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration does not validate.
    pub fn with_crypto(
        config: ConnectionConfig,
        crypto: Arc<dyn CryptoBackend>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => ChaCha20Rng::seed_from_u64(seed),
            None => ChaCha20Rng::from_entropy(),
        };
        Ok(Self {
            quic: QuicContext::new(&config.quic),
            tls: TlsContext::default(),
            http: HttpContext::default(),
            config,
            crypto,
            rng,
        })
    }

    /// Static configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Role this endpoint plays.
    pub fn role(&self) -> Role {
        self.config.role
    }

    /// TLS state.
    pub fn tls(&self) -> &TlsContext {
        &self.tls
    }

    /// QUIC state.
    pub fn quic(&self) -> &QuicContext {
        &self.quic
    }

    /// HTTP state.
    pub fn http(&self) -> &HttpContext {
        &self.http
    }

    /// Crypto collaborator.
    pub fn crypto(&self) -> &dyn CryptoBackend {
        self.crypto.as_ref()
    }

    /// Fragment limit in force: negotiated, else configured.
    pub fn max_fragment_length(&self) -> usize {
        self.tls.max_fragment_length.unwrap_or(self.config.max_fragment_length)
    }

    pub(crate) fn prepare_context(&mut self) -> PrepareContext<'_> {
        PrepareContext {
            config: &self.config,
            tls: &self.tls,
            quic: &self.quic,
            http: &self.http,
            crypto: self.crypto.as_ref(),
            rng: &mut self.rng,
        }
    }
}

/// Read-only view of connection state handed to compute-defaults.
///
/// Everything except the randomness source is immutable, so computing
/// defaults can never change the connection.
pub struct PrepareContext<'a> {
    /// Static configuration
    pub config: &'a ConnectionConfig,
    /// TLS state
    pub tls: &'a TlsContext,
    /// QUIC state
    pub quic: &'a QuicContext,
    /// HTTP state
    pub http: &'a HttpContext,
    /// Crypto collaborator
    pub crypto: &'a dyn CryptoBackend,
    rng: &'a mut ChaCha20Rng,
}

impl PrepareContext<'_> {
    /// Draws `len` bytes from the connection's seeded generator.
    pub fn random_bytes(&mut self, len: usize) -> Bytes {
        let mut buf = vec![0u8; len];
        self.rng.fill_bytes(&mut buf);
        Bytes::from(buf)
    }

    /// Role this endpoint plays.
    pub fn role(&self) -> Role {
        self.config.role
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(ConnectionConfig::client().validate().is_ok());
        assert!(ConnectionConfig::server().validate().is_ok());
    }

    #[test]
    fn zero_fragment_length_is_rejected() {
        let config = ConnectionConfig { max_fragment_length: 0, ..ConnectionConfig::default() };
        assert!(matches!(
            ConnectionState::new(config),
            Err(ConfigError::Invalid { field: "max_fragment_length", .. })
        ));
    }

    #[test]
    fn oversized_cid_is_rejected() {
        let mut config = ConnectionConfig::default();
        config.quic.remote_cid = vec![0; 21];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "quic.remote_cid", .. })
        ));
    }

    #[test]
    fn seeded_states_draw_identical_bytes() {
        let config = ConnectionConfig::default().with_seed(7);
        let mut a = ConnectionState::new(config.clone()).unwrap();
        let mut b = ConnectionState::new(config).unwrap();
        assert_eq!(
            a.prepare_context().random_bytes(32),
            b.prepare_context().random_bytes(32)
        );
    }

    #[test]
    fn sequences_order_by_epoch_first() {
        let mut direction = RecordDirection::default();
        for _ in 0..5 {
            direction.advance();
        }
        let before = direction.last_sequence().unwrap();
        direction.activate(RecordKeys {
            suite: CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA,
            params: CipherSuite::TLS_RSA_WITH_AES_128_CBC_SHA.cbc_parameters().unwrap(),
            mac_key: Bytes::new(),
            enc_key: Bytes::new(),
            iv: Bytes::from_static(&[0; 16]),
        });
        let after = direction.advance();
        assert_eq!(after, RecordSequence { epoch: 1, number: 0 });
        assert!(after > before);
    }

    #[test]
    fn server_config_mirrors_connection_ids() {
        let client = ConnectionConfig::client();
        let server = ConnectionConfig::server();
        assert_eq!(client.quic.local_cid, server.quic.remote_cid);
        assert_eq!(client.quic.remote_cid, server.quic.local_cid);
    }
}
