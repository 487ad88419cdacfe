//! Scenario builder API.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use fracture_core::{
    ConnectionConfig, ConnectionState, CryptoBackend, TraceStatus, WorkflowExecutor,
    WorkflowTrace,
};
use tracing::{debug, info};

use crate::{
    peer::{self, AlertPolicy, PeerReply, ScriptedPeer},
    scenario::{OracleFn, World},
    sim_transport::Preset,
    toy_crypto::ToyCrypto,
};

/// Host name the scripted peer runs under.
pub const PEER_HOST: &str = "peer";

/// Host name the client trace runs under.
pub const CLIENT_HOST: &str = "client";

/// Default wait for each client read.
const CLIENT_TIMEOUT: Duration = Duration::from_millis(500);

/// Scenario builder.
///
/// Configure the client, the peer and the trace, then attach an oracle to
/// get something that can run.
pub struct Scenario {
    preset: Preset,
    client_config: ConnectionConfig,
    crypto: Arc<dyn CryptoBackend>,
    peer: Option<ScriptedPeer>,
    trace: WorkflowTrace,
    timeout: Duration,
    seed: u64,
    latency: Option<Duration>,
    duration: Duration,
}

impl Scenario {
    /// Creates a TLS scenario with an empty trace.
    ///
    /// The client is seeded and uses [`ToyCrypto`]. Unless another peer is
    /// given, it talks to a TLS server with the uniform alert policy (or a
    /// QUIC server for [`Preset::Quic`], or a silent peer otherwise).
    pub fn new() -> Self {
        Self {
            preset: Preset::Tls,
            client_config: ConnectionConfig::client().with_seed(1),
            crypto: Arc::new(ToyCrypto),
            peer: None,
            trace: WorkflowTrace::new(),
            timeout: CLIENT_TIMEOUT,
            seed: 0,
            latency: None,
            duration: Duration::from_secs(60),
        }
    }

    /// Selects the client's stack preset.
    pub fn with_preset(mut self, preset: Preset) -> Self {
        self.preset = preset;
        self
    }

    /// Configures the client connection.
    pub fn with_client_config(mut self, config: ConnectionConfig) -> Self {
        self.client_config = config;
        self
    }

    /// Replaces the client's crypto backend.
    pub fn with_crypto(mut self, crypto: Arc<dyn CryptoBackend>) -> Self {
        self.crypto = crypto;
        self
    }

    /// Uses `peer` on the other end.
    pub fn with_peer(mut self, peer: ScriptedPeer) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Sets the trace the client executes.
    pub fn with_trace(mut self, trace: WorkflowTrace) -> Self {
        self.trace = trace;
        self
    }

    /// Sets how long each client read waits.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Seeds the simulation's own randomness.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Delays every simulated message by exactly `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Set the oracle function and return a runnable scenario.
    ///
    /// The oracle is mandatory - you cannot run a scenario without
    /// verification.
    pub fn oracle(self, oracle: OracleFn) -> RunnableScenario {
        RunnableScenario { scenario: self, oracle }
    }

    fn default_peer(&self) -> ScriptedPeer {
        match self.preset {
            Preset::Tls => ScriptedPeer::tls_server(AlertPolicy::Uniform),
            Preset::Quic => ScriptedPeer::new(Preset::Quic, peer::quic_server()),
            preset => ScriptedPeer::new(preset, |_, _| PeerReply::nothing()),
        }
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Self::new()
    }
}

type Outcome = Arc<Mutex<Option<(WorkflowTrace, TraceStatus, ConnectionState)>>>;

/// A scenario with an oracle function that can be executed.
pub struct RunnableScenario {
    scenario: Scenario,
    oracle: OracleFn,
}

impl RunnableScenario {
    /// Execute the scenario.
    ///
    /// Starts the peer as host [`PEER_HOST`], runs the trace from host
    /// [`CLIENT_HOST`] until it finishes, closes the client's channel and
    /// hands the resulting [`World`] to the oracle.
    ///
    /// # Errors
    ///
    /// Returns a message if the client configuration is rejected, the
    /// simulation fails, or the oracle does.
    pub fn run(self) -> Result<(), String> {
        let Self { scenario, oracle } = self;
        let peer = scenario.peer.clone().unwrap_or_else(|| scenario.default_peer());
        if peer.preset() != scenario.preset {
            return Err(format!(
                "peer runs {:?} but the client runs {:?}",
                peer.preset(),
                scenario.preset
            ));
        }
        let state = ConnectionState::with_crypto(scenario.client_config, scenario.crypto)
            .map_err(|err| format!("client configuration rejected: {err}"))?;

        let mut builder = turmoil::Builder::new();
        builder.simulation_duration(scenario.duration).rng_seed(scenario.seed);
        if let Some(latency) = scenario.latency {
            builder.min_message_latency(latency).max_message_latency(latency);
        }
        let mut sim = builder.build();
        let log = peer.install(&mut sim, PEER_HOST);

        let outcome: Outcome = Arc::default();
        let slot = Arc::clone(&outcome);
        let (preset, timeout, mut trace) = (scenario.preset, scenario.timeout, scenario.trace);
        sim.client(CLIENT_HOST, async move {
            let stack = preset.connect(PEER_HOST, timeout).await?;
            let mut executor = WorkflowExecutor::new(stack, state);
            let status = executor.execute(&mut trace).await;
            if let Err(err) = executor.close().await {
                debug!(%err, "client close failed");
            }
            info!(?status, "scenario trace finished");
            *slot.lock().unwrap_or_else(PoisonError::into_inner) =
                Some((trace, status, executor.into_state()));
            Ok(())
        });
        sim.run().map_err(|err| format!("simulation failed: {err}"))?;

        let finished = outcome.lock().unwrap_or_else(PoisonError::into_inner).take();
        let (trace, status, client) =
            finished.ok_or_else(|| "client never finished its trace".to_string())?;
        let world = World::new(trace, status, client, log.events());
        oracle(&world)
    }
}
