//! Snapshot a scenario's oracle inspects.

use fracture_core::{ConnectionState, PipelineError, TraceStatus, UnitKind, WorkflowTrace};
use fracture_proto::tls::{AlertDescription, AlertLevel};

use crate::peer::PeerEvent;

/// Everything left behind by a finished scenario.
#[derive(Debug)]
pub struct World {
    trace: WorkflowTrace,
    status: TraceStatus,
    client: ConnectionState,
    peer: Vec<PeerEvent>,
}

impl World {
    pub(crate) fn new(
        trace: WorkflowTrace,
        status: TraceStatus,
        client: ConnectionState,
        peer: Vec<PeerEvent>,
    ) -> Self {
        Self { trace, status, client, peer }
    }

    /// The client trace with every action's status and result.
    pub fn trace(&self) -> &WorkflowTrace {
        &self.trace
    }

    /// Aggregate status the executor reported.
    pub fn status(&self) -> TraceStatus {
        self.status
    }

    /// Client connection state after the trace.
    pub fn client(&self) -> &ConnectionState {
        &self.client
    }

    /// Rounds the peer went through, in order.
    pub fn peer_events(&self) -> &[PeerEvent] {
        &self.peer
    }

    /// Alerts the client received.
    pub fn alerts_received(&self) -> &[(AlertLevel, AlertDescription)] {
        self.client.tls().alerts_received()
    }

    /// Returns true if the peer decoded a unit of `kind` at any point.
    pub fn peer_saw(&self, kind: UnitKind) -> bool {
        self.peer.iter().any(|event| event.received.contains(&kind))
    }

    /// Errors the peer's layers recorded.
    pub fn peer_errors(&self) -> impl Iterator<Item = &PipelineError> {
        self.peer.iter().flat_map(|event| event.errors.iter())
    }

    /// Returns true if the peer hung up.
    pub fn peer_closed(&self) -> bool {
        self.peer.iter().any(|event| event.closed)
    }
}
