//! Scripted peer running as a turmoil host.
//!
//! The peer owns a server-role Layer Stack per connection. Each time bytes
//! arrive it hands the receive result and its Connection State to a
//! behaviour closure, which decides what to send back and whether to hang
//! up. Every exchange is appended to a shared [`PeerLog`] so oracles can see
//! what the peer observed.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use fracture_core::{
    ConfiguredUnit, ConnectionConfig, ConnectionState, CryptoBackend, CryptoError,
    LayerConfiguration, LayerKind, LayerStack, LayerStackProcessingResult, PipelineError,
    ReceiveEnd, StackError, StopCondition, UnitKind, transport::DatagramChannel,
};
use fracture_proto::tls::{
    Alert, AlertDescription, AlertLevel, ChangeCipherSpec, Finished, HandshakeBody,
    HandshakeMessage, HandshakeType, ServerHello, TlsMessage,
};
use tracing::{debug, warn};
use turmoil::{Sim, net::TcpListener};

use crate::{
    sim_transport::{PEER_PORT, Preset, SimDatagram, accept_stream},
    toy_crypto::ToyCrypto,
};

/// Default wait for each peer read.
pub const PEER_TIMEOUT: Duration = Duration::from_millis(200);

/// What the peer does after a receive.
#[derive(Debug, Clone, Default)]
pub struct PeerReply {
    /// Units to push through the peer's stack
    pub configurations: Vec<LayerConfiguration>,
    /// Bytes written to the channel as-is, after the configurations
    pub raw: Option<Bytes>,
    /// Close the connection afterwards
    pub close: bool,
}

impl PeerReply {
    /// Stay silent.
    pub fn nothing() -> Self {
        Self::default()
    }

    /// Send `configurations`.
    pub fn send(configurations: Vec<LayerConfiguration>) -> Self {
        Self { configurations, ..Self::default() }
    }

    /// Write `bytes` without going through the layers.
    pub fn raw(bytes: impl Into<Bytes>) -> Self {
        Self { raw: Some(bytes.into()), ..Self::default() }
    }

    /// Hang up without sending.
    pub fn close() -> Self {
        Self { close: true, ..Self::default() }
    }

    /// Hang up after this reply.
    #[must_use]
    pub fn then_close(mut self) -> Self {
        self.close = true;
        self
    }
}

/// Behaviour closure deciding each reply.
pub type Behaviour =
    Arc<dyn Fn(&LayerStackProcessingResult, &ConnectionState) -> PeerReply + Send + Sync>;

/// One receive-and-reply round on the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    /// Index of the accepted connection, starting at zero
    pub connection: usize,
    /// Kinds decoded from what arrived, top layer first
    pub received: Vec<UnitKind>,
    /// Non-fatal errors the peer's layers recorded
    pub errors: Vec<PipelineError>,
    /// Kinds the peer sent back
    pub replied: Vec<UnitKind>,
    /// Whether the peer hung up after this round
    pub closed: bool,
}

/// Shared, append-only record of peer events.
#[derive(Debug, Clone, Default)]
pub struct PeerLog(Arc<Mutex<Vec<PeerEvent>>>);

impl PeerLog {
    fn push(&self, event: PeerEvent) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }

    /// Copy of the events so far.
    pub fn events(&self) -> Vec<PeerEvent> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// A simulated server answering through a [`Behaviour`].
#[derive(Clone)]
pub struct ScriptedPeer {
    preset: Preset,
    config: ConnectionConfig,
    crypto: Arc<dyn CryptoBackend>,
    behaviour: Behaviour,
    timeout: Duration,
    log: PeerLog,
}

impl ScriptedPeer {
    /// Creates a server-role peer for `preset` using [`ToyCrypto`].
    pub fn new(
        preset: Preset,
        behaviour: impl Fn(&LayerStackProcessingResult, &ConnectionState) -> PeerReply
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            preset,
            config: ConnectionConfig::server().with_seed(0x5e),
            crypto: Arc::new(ToyCrypto),
            behaviour: Arc::new(behaviour),
            timeout: PEER_TIMEOUT,
            log: PeerLog::default(),
        }
    }

    /// A TLS server that completes a handshake and answers record
    /// protection failures with a fatal alert.
    pub fn tls_server(alerts: AlertPolicy) -> Self {
        Self::new(Preset::Tls, tls_server(alerts))
    }

    /// Replaces the peer's connection configuration.
    #[must_use]
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the crypto backend.
    #[must_use]
    pub fn with_crypto(mut self, crypto: Arc<dyn CryptoBackend>) -> Self {
        self.crypto = crypto;
        self
    }

    /// Sets how long each read waits.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Stack preset the peer runs.
    pub fn preset(&self) -> Preset {
        self.preset
    }

    /// Handle to the events this peer records.
    pub fn log(&self) -> PeerLog {
        self.log.clone()
    }

    /// Registers the peer as host `name` in `sim`.
    pub fn install(self, sim: &mut Sim<'_>, name: &str) -> PeerLog {
        let log = self.log();
        sim.host(name, move || {
            let peer = self.clone();
            async move { peer.serve().await }
        });
        log
    }

    async fn serve(self) -> turmoil::Result {
        if self.preset.is_datagram() {
            let socket = SimDatagram::bind().await?;
            let stack = self.preset.stack(DatagramChannel::new(socket, self.timeout));
            self.run_session(0, stack).await?;
            return Ok(());
        }

        let listener = TcpListener::bind(("0.0.0.0", PEER_PORT)).await?;
        for connection in 0.. {
            let channel = accept_stream(&listener, self.timeout).await?;
            self.run_session(connection, self.preset.stack(channel)).await?;
        }
        Ok(())
    }

    async fn run_session(&self, connection: usize, stack: LayerStack) -> turmoil::Result {
        let mut state = ConnectionState::with_crypto(self.config.clone(), self.crypto.clone())?;
        if let Err(err) = self.session(connection, stack, &mut state).await {
            warn!(connection, %err, "peer session aborted");
        }
        Ok(())
    }

    async fn session(
        &self,
        connection: usize,
        mut stack: LayerStack,
        state: &mut ConnectionState,
    ) -> Result<(), StackError> {
        loop {
            let received = stack.receive(&StopCondition::Bytes(1), state).await?;
            if received.bytes_received == 0 {
                match received.end {
                    Some(ReceiveEnd::Eof) => break,
                    _ => continue,
                }
            }

            let reply = (self.behaviour)(&received, state);
            let mut replied = Vec::new();
            if !reply.configurations.is_empty() {
                replied = stack.send(reply.configurations, state).await?.kinds();
            }
            if let Some(raw) = &reply.raw {
                stack.channel().send_data(raw).await?;
            }
            debug!(connection, received = ?received.kinds(), ?replied, "peer round");
            self.log.push(PeerEvent {
                connection,
                received: received.kinds(),
                errors: received.errors().cloned().collect(),
                replied,
                closed: reply.close,
            });
            if reply.close {
                stack.close().await?;
                break;
            }
        }
        Ok(())
    }
}

/// Alerts a TLS server sends when a protected record does not open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlertPolicy {
    /// `bad_record_mac` for every failure
    #[default]
    Uniform,
    /// `decryption_failed` for bad padding, `bad_record_mac` for a bad MAC
    Distinguishing,
}

impl AlertPolicy {
    fn alert_for(self, error: &PipelineError) -> Option<AlertDescription> {
        let PipelineError::Crypto(error) = error else {
            return None;
        };
        match (self, error) {
            (Self::Distinguishing, CryptoError::BadPadding | CryptoError::BadLength { .. }) => {
                Some(AlertDescription::DECRYPTION_FAILED)
            },
            (_, CryptoError::BadPadding | CryptoError::BadLength { .. } | CryptoError::BadMac) => {
                Some(AlertDescription::BAD_RECORD_MAC)
            },
            _ => None,
        }
    }
}

fn tls_messages(units: impl IntoIterator<Item = TlsMessage>) -> LayerConfiguration {
    LayerConfiguration::new(LayerKind::TlsMessage)
        .with_units(units.into_iter().map(ConfiguredUnit::prepared))
}

fn handshake(body: HandshakeBody) -> TlsMessage {
    TlsMessage::Handshake(HandshakeMessage::new(body))
}

/// Behaviour of a minimal TLS 1.x server.
///
/// Answers a ClientHello with ServerHello and ServerHelloDone, a client
/// Finished with ChangeCipherSpec and Finished, and the first record that
/// fails to open with a fatal alert chosen by `alerts` before hanging up.
pub fn tls_server(
    alerts: AlertPolicy,
) -> impl Fn(&LayerStackProcessingResult, &ConnectionState) -> PeerReply + Send + Sync + 'static {
    move |received, _state| {
        if let Some(description) = received.errors().find_map(|err| alerts.alert_for(err)) {
            let alert = Alert::new(AlertLevel::FATAL, description);
            return PeerReply::send(vec![tls_messages([TlsMessage::Alert(alert)])]).then_close();
        }

        let mut messages = Vec::new();
        if received.contains(UnitKind::Handshake(HandshakeType::CLIENT_HELLO)) {
            messages.push(handshake(HandshakeBody::ServerHello(ServerHello::default())));
            messages.push(handshake(HandshakeBody::ServerHelloDone));
        }
        if received.contains(UnitKind::Handshake(HandshakeType::FINISHED)) {
            messages.push(TlsMessage::ChangeCipherSpec(ChangeCipherSpec::default()));
            messages.push(handshake(HandshakeBody::Finished(Finished::default())));
        }
        if messages.is_empty() {
            PeerReply::nothing()
        } else {
            PeerReply::send(vec![tls_messages(messages)])
        }
    }
}

/// Behaviour of a QUIC server that answers a ClientHello with a
/// ServerHello in the Initial space and ignores everything else.
pub fn quic_server()
-> impl Fn(&LayerStackProcessingResult, &ConnectionState) -> PeerReply + Send + Sync + 'static {
    |received, _state| {
        if received.contains(UnitKind::Handshake(HandshakeType::CLIENT_HELLO)) {
            let hello = handshake(HandshakeBody::ServerHello(ServerHello::default()));
            PeerReply::send(vec![tls_messages([hello])])
        } else {
            PeerReply::nothing()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinguishing_policy_separates_padding_from_mac() {
        let padding = PipelineError::Crypto(CryptoError::BadPadding);
        let mac = PipelineError::Crypto(CryptoError::BadMac);
        let policy = AlertPolicy::Distinguishing;
        assert_eq!(policy.alert_for(&padding), Some(AlertDescription::DECRYPTION_FAILED));
        assert_eq!(policy.alert_for(&mac), Some(AlertDescription::BAD_RECORD_MAC));
        let uniform = AlertPolicy::Uniform.alert_for(&padding);
        assert_eq!(uniform, Some(AlertDescription::BAD_RECORD_MAC));
        let parse = PipelineError::Configuration("x".into());
        assert_eq!(policy.alert_for(&parse), None);
    }

    #[test]
    fn reply_builders_compose() {
        let reply = PeerReply::raw(&b"\x15"[..]).then_close();
        assert!(reply.close);
        assert!(reply.configurations.is_empty());
        assert_eq!(reply.raw.as_deref(), Some(&b"\x15"[..]));
        assert!(!PeerReply::nothing().close);
    }
}
