//! The layer stack: layers composed over a transport channel.
//!
//! A send fans each [`LayerConfiguration`] out to its layer and walks the
//! stack top-down, feeding each layer's output chunks into the layer below
//! and finally into the channel. A receive walks bottom-up for every fetch
//! until its [`StopCondition`] holds, the fetch times out, or the peer
//! closes.
//!
//! ```text
//!  send                                  receive
//!   │  ┌──────────────────────────────┐    ▲
//!   ├─▶│ TlsMessageLayer              │────┤  units recorded per layer
//!   │  ├──────────────────────────────┤    │
//!   ├─▶│ RecordLayer                  │────┤
//!   │  └──────────────────────────────┘    │
//!   ▼         TransportChannel             │
//! ```

use std::{collections::HashSet, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    error::{PipelineError, StackError},
    layer::{
        Chunk, HttpLayer, Layer, LayerConfiguration, LayerKind, LayerProcessingResult,
        QuicFrameLayer, QuicPacketLayer, RecordLayer, SendRequest, TlsMessageLayer,
    },
    state::ConnectionState,
    transport::{SocketState, TransportChannel},
    unit::{UnitKind, WireUnit},
    units::Unit,
};

/// When a receive stops pulling from the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopCondition {
    /// The given kinds have all arrived. Kinds decoded by the same layer
    /// must arrive in this order, with other units allowed in between;
    /// kinds from different layers are matched independently since layers
    /// keep no order relative to each other.
    Kinds(Vec<UnitKind>),
    /// A unit of this kind has arrived
    FirstOf(UnitKind),
    /// At least this many bytes have been read from the channel
    Bytes(usize),
    /// Only a timeout or the end of the stream stops the receive
    Timeout,
}

impl StopCondition {
    fn is_satisfied(&self, result: &LayerStackProcessingResult) -> bool {
        match self {
            Self::Kinds(expected) => {
                let mut cursors = vec![0; result.layers.len()];
                expected.iter().all(|kind| {
                    result.layers.iter().zip(&mut cursors).any(|(layer, cursor)| {
                        match layer.units[*cursor..].iter().position(|unit| unit.kind() == *kind) {
                            Some(offset) => {
                                *cursor += offset + 1;
                                true
                            },
                            None => false,
                        }
                    })
                })
            },
            Self::FirstOf(kind) => result.contains(*kind),
            Self::Bytes(count) => result.bytes_received >= *count,
            Self::Timeout => false,
        }
    }
}

/// Why a receive ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiveEnd {
    /// The stop condition held
    Satisfied,
    /// A fetch returned nothing within the channel timeout
    Timeout,
    /// The channel is closed
    Eof,
}

/// Aggregated outcome of one stack send or receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerStackProcessingResult {
    /// One result per layer, top layer first
    pub layers: Vec<LayerProcessingResult>,
    /// Bytes written to the channel
    pub bytes_sent: usize,
    /// Bytes read from the channel
    pub bytes_received: usize,
    /// Time from the start of the operation until it returned
    pub elapsed: Duration,
    /// How a receive ended; `None` for sends
    pub end: Option<ReceiveEnd>,
}

impl LayerStackProcessingResult {
    fn new(kinds: impl IntoIterator<Item = LayerKind>) -> Self {
        Self {
            layers: kinds.into_iter().map(LayerProcessingResult::new).collect(),
            bytes_sent: 0,
            bytes_received: 0,
            elapsed: Duration::ZERO,
            end: None,
        }
    }

    /// Every unit, top layer first and in wire order within a layer.
    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.layers.iter().flat_map(|layer| layer.units.iter())
    }

    /// Kinds of [`units`](Self::units).
    pub fn kinds(&self) -> Vec<UnitKind> {
        self.units().map(WireUnit::kind).collect()
    }

    /// Every non-fatal error, top layer first.
    pub fn errors(&self) -> impl Iterator<Item = &PipelineError> {
        self.layers.iter().flat_map(|layer| layer.errors.iter())
    }

    /// Returns true if any layer recorded an error.
    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    /// Result of the given layer.
    pub fn layer(&self, kind: LayerKind) -> Option<&LayerProcessingResult> {
        self.layers.iter().find(|layer| layer.layer == kind)
    }

    /// Returns true if a unit of `kind` was processed.
    pub fn contains(&self, kind: UnitKind) -> bool {
        self.units().any(|unit| unit.kind() == kind)
    }
}

/// Ordered layers over one transport channel.
pub struct LayerStack {
    layers: Vec<Box<dyn Layer>>,
    channel: Box<dyn TransportChannel>,
}

impl fmt::Debug for LayerStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerStack")
            .field("layers", &self.layer_kinds())
            .field("datagram", &self.channel.is_datagram())
            .finish()
    }
}

impl LayerStack {
    /// Builds a stack from layers listed top first.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Configuration`] for an empty stack or a layer
    /// listed twice.
    pub fn new(
        layers: Vec<Box<dyn Layer>>,
        channel: Box<dyn TransportChannel>,
    ) -> Result<Self, StackError> {
        if layers.is_empty() {
            return Err(StackError::Configuration("a stack needs at least one layer".into()));
        }
        let mut seen = HashSet::new();
        for layer in &layers {
            if !seen.insert(layer.kind()) {
                return Err(StackError::Configuration(format!(
                    "{} layer listed twice",
                    layer.kind()
                )));
            }
        }
        Ok(Self { layers, channel })
    }

    /// TLS messages over records.
    pub fn tls(channel: impl TransportChannel + 'static) -> Self {
        Self {
            layers: vec![Box::new(TlsMessageLayer::new()), Box::new(RecordLayer::new())],
            channel: Box::new(channel),
        }
    }

    /// HTTP over TLS.
    pub fn https(channel: impl TransportChannel + 'static) -> Self {
        Self {
            layers: vec![
                Box::new(HttpLayer::new()),
                Box::new(TlsMessageLayer::new()),
                Box::new(RecordLayer::new()),
            ],
            channel: Box::new(channel),
        }
    }

    /// Plain HTTP.
    pub fn http(channel: impl TransportChannel + 'static) -> Self {
        Self { layers: vec![Box::new(HttpLayer::new())], channel: Box::new(channel) }
    }

    /// TLS messages over QUIC frames over QUIC packets.
    pub fn quic(channel: impl TransportChannel + 'static) -> Self {
        Self {
            layers: vec![
                Box::new(TlsMessageLayer::new()),
                Box::new(QuicFrameLayer::new()),
                Box::new(QuicPacketLayer::new()),
            ],
            channel: Box::new(channel),
        }
    }

    /// Layer kinds, top first.
    pub fn layer_kinds(&self) -> Vec<LayerKind> {
        self.layers.iter().map(|layer| layer.kind()).collect()
    }

    /// The underlying channel.
    pub fn channel(&mut self) -> &mut dyn TransportChannel {
        self.channel.as_mut()
    }

    /// Sends the configured units through the stack.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Configuration`] if a configuration names a layer
    /// the stack lacks or names a layer twice, [`StackError::Layer`] for a
    /// fatal layer error, and [`StackError::Transport`] if the write fails.
    /// Units already handed to the channel stay sent.
    pub async fn send(
        &mut self,
        configurations: Vec<LayerConfiguration>,
        state: &mut ConnectionState,
    ) -> Result<LayerStackProcessingResult, StackError> {
        let started = Instant::now();
        let mut requests: Vec<SendRequest> =
            self.layers.iter().map(|_| SendRequest::default()).collect();
        let mut configured = HashSet::new();
        for configuration in configurations {
            let layer = configuration.layer;
            let Some(index) = self.layers.iter().position(|l| l.kind() == layer) else {
                return Err(StackError::Configuration(format!("no {layer} layer in this stack")));
            };
            if !configured.insert(layer) {
                return Err(StackError::Configuration(format!("{layer} layer configured twice")));
            }
            requests[index].units = configuration.units;
            requests[index].hints = configuration.hints;
        }

        let mut result = LayerStackProcessingResult::new(self.layer_kinds());
        let mut chunks: Vec<Chunk> = Vec::new();
        for ((layer, mut request), slot) in
            self.layers.iter_mut().zip(requests).zip(result.layers.iter_mut())
        {
            request.chunks = std::mem::take(&mut chunks);
            let output = layer
                .send(request, state)
                .map_err(|source| StackError::Layer { layer: layer.kind(), source })?;
            *slot = output.result;
            chunks = output.chunks;
        }

        if self.channel.is_datagram() {
            for chunk in &chunks {
                self.channel.send_data(&chunk.data).await?;
                result.bytes_sent += chunk.data.len();
            }
        } else if !chunks.is_empty() {
            let wire: Vec<u8> = chunks.iter().flat_map(|chunk| chunk.data.to_vec()).collect();
            self.channel.send_data(&wire).await?;
            result.bytes_sent = wire.len();
        }

        result.elapsed = started.elapsed();
        tracing::debug!(
            bytes = result.bytes_sent,
            units = result.units().count(),
            errors = result.errors().count(),
            "stack send"
        );
        Ok(result)
    }

    /// Pulls from the channel until `stop` holds, a fetch times out, or the
    /// channel closes.
    ///
    /// A timeout is not an error: the result reports
    /// [`ReceiveEnd::Timeout`] with whatever arrived.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Transport`] if the channel fails.
    pub async fn receive(
        &mut self,
        stop: &StopCondition,
        state: &mut ConnectionState,
    ) -> Result<LayerStackProcessingResult, StackError> {
        let started = Instant::now();
        let mut result = LayerStackProcessingResult::new(self.layer_kinds());

        let end = loop {
            if stop.is_satisfied(&result) {
                break ReceiveEnd::Satisfied;
            }
            let data = self.channel.fetch_data().await?;
            if data.is_empty() {
                break match self.channel.socket_state().await {
                    SocketState::Closed => ReceiveEnd::Eof,
                    _ => ReceiveEnd::Timeout,
                };
            }
            result.bytes_received += data.len();

            let mut chunks = vec![Chunk::new(data)];
            for (layer, slot) in self.layers.iter_mut().zip(result.layers.iter_mut()).rev() {
                let output = layer.receive(chunks, state);
                slot.merge(output.result);
                chunks = output.chunks;
            }
        };

        result.end = Some(end);
        result.elapsed = started.elapsed();
        tracing::debug!(
            bytes = result.bytes_received,
            units = result.units().count(),
            ?end,
            "stack receive"
        );
        Ok(result)
    }

    /// Closes the channel.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Transport`] if the shutdown fails.
    pub async fn close(&mut self) -> Result<(), StackError> {
        self.channel.close().await.map_err(StackError::from)
    }
}
