//! Workflow traces: ordered send and receive scripts.
//!
//! A [`WorkflowTrace`] is a list of [`Action`]s executed strictly in order
//! by a [`WorkflowExecutor`]. Each action moves through
//!
//! ```text
//! Pending ──▶ Executing ──▶ Completed
//!                      └──▶ Failed
//! ```
//!
//! and keeps the stack result it produced. With [`FailurePolicy::Halt`]
//! (the default) the first failure leaves every later action pending; with
//! [`FailurePolicy::Continue`] the trace keeps going, which is how attack
//! scripts keep probing after a peer reacts to a malformed send.

mod executor;

use serde::{Deserialize, Serialize};

pub use self::executor::WorkflowExecutor;
use crate::{
    layer::{LayerConfiguration, LayerKind},
    stack::{LayerStackProcessingResult, StopCondition},
    unit::{ConfiguredUnit, UnitKind},
};

/// One step of a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Push the configured units through the stack
    Send {
        /// Per-layer units and hints
        configurations: Vec<LayerConfiguration>,
    },
    /// Receive until the expected kinds have arrived in order
    Receive {
        /// Kinds that must arrive
        expected: Vec<UnitKind>,
    },
    /// Receive until a unit of `kind` arrives
    ReceiveTill {
        /// Kind that ends the receive
        kind: UnitKind,
    },
    /// Receive until at least `count` bytes have arrived
    ReceiveBytes {
        /// Byte count that ends the receive
        count: usize,
    },
    /// Take whatever arrives until a timeout or the end of the stream
    GenericReceive,
}

impl Action {
    /// Stop condition of a receiving action; `None` for sends.
    pub fn stop_condition(&self) -> Option<StopCondition> {
        match self {
            Self::Send { .. } => None,
            Self::Receive { expected } => Some(StopCondition::Kinds(expected.clone())),
            Self::ReceiveTill { kind } => Some(StopCondition::FirstOf(*kind)),
            Self::ReceiveBytes { count } => Some(StopCondition::Bytes(*count)),
            Self::GenericReceive => Some(StopCondition::Timeout),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::Receive { .. } => "receive",
            Self::ReceiveTill { .. } => "receive-till",
            Self::ReceiveBytes { .. } => "receive-bytes",
            Self::GenericReceive => "generic-receive",
        }
    }
}

/// Progress of one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionStatus {
    /// Not started
    Pending,
    /// Running
    Executing,
    /// Finished as scripted
    Completed,
    /// Finished with a failure
    Failed,
}

/// An action and what happened when it ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceAction {
    action: Action,
    status: ActionStatus,
    failure: Option<String>,
    result: Option<LayerStackProcessingResult>,
}

impl TraceAction {
    fn new(action: Action) -> Self {
        Self { action, status: ActionStatus::Pending, failure: None, result: None }
    }

    /// The scripted action.
    pub fn action(&self) -> &Action {
        &self.action
    }

    /// Current status.
    pub fn status(&self) -> ActionStatus {
        self.status
    }

    /// Why the action failed.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Stack result, if the action got as far as producing one.
    pub fn result(&self) -> Option<&LayerStackProcessingResult> {
        self.result.as_ref()
    }

    pub(crate) fn start(&mut self) {
        self.status = ActionStatus::Executing;
        self.failure = None;
        self.result = None;
    }

    pub(crate) fn finish(
        &mut self,
        result: Option<LayerStackProcessingResult>,
        failure: Option<String>,
    ) {
        self.status =
            if failure.is_some() { ActionStatus::Failed } else { ActionStatus::Completed };
        self.failure = failure;
        self.result = result;
    }
}

/// What the executor does after a failed action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Leave the remaining actions pending
    #[default]
    Halt,
    /// Run the remaining actions anyway
    Continue,
}

/// Aggregate status of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceStatus {
    /// Some actions have not run
    Pending,
    /// Every action completed
    Completed,
    /// Every action ran, some failed
    CompletedWithFailures,
    /// An action failed and the trace halted
    Failed,
}

/// An ordered script of actions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowTrace {
    actions: Vec<TraceAction>,
    policy: FailurePolicy,
}

impl WorkflowTrace {
    /// Creates an empty trace that halts on failure.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an action.
    #[must_use]
    pub fn then(mut self, action: Action) -> Self {
        self.actions.push(TraceAction::new(action));
        self
    }

    /// Appends a send of the given configurations.
    #[must_use]
    pub fn send(self, configurations: Vec<LayerConfiguration>) -> Self {
        self.then(Action::Send { configurations })
    }

    /// Appends a send of units to one layer.
    #[must_use]
    pub fn send_units(
        self,
        layer: LayerKind,
        units: impl IntoIterator<Item = ConfiguredUnit>,
    ) -> Self {
        self.send(vec![LayerConfiguration::new(layer).with_units(units)])
    }

    /// Appends a receive of the expected kinds.
    #[must_use]
    pub fn receive(self, expected: Vec<UnitKind>) -> Self {
        self.then(Action::Receive { expected })
    }

    /// Appends a receive that stops at the first `kind`.
    #[must_use]
    pub fn receive_till(self, kind: UnitKind) -> Self {
        self.then(Action::ReceiveTill { kind })
    }

    /// Appends a receive of at least `count` bytes.
    #[must_use]
    pub fn receive_bytes(self, count: usize) -> Self {
        self.then(Action::ReceiveBytes { count })
    }

    /// Appends a receive that takes whatever arrives.
    #[must_use]
    pub fn generic_receive(self) -> Self {
        self.then(Action::GenericReceive)
    }

    /// Keeps executing after failed actions.
    #[must_use]
    pub fn continue_on_failure(mut self) -> Self {
        self.policy = FailurePolicy::Continue;
        self
    }

    /// Appends every action of `other`, keeping this trace's policy.
    #[must_use]
    pub fn extend(mut self, other: WorkflowTrace) -> Self {
        self.actions.extend(other.actions.into_iter().map(|a| TraceAction::new(a.action)));
        self
    }

    /// Failure policy.
    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Actions in order.
    pub fn actions(&self) -> &[TraceAction] {
        &self.actions
    }

    pub(crate) fn actions_mut(&mut self) -> &mut [TraceAction] {
        &mut self.actions
    }

    /// Actions that failed.
    pub fn failed(&self) -> impl Iterator<Item = &TraceAction> {
        self.actions.iter().filter(|a| a.status == ActionStatus::Failed)
    }

    /// Aggregate status.
    pub fn status(&self) -> TraceStatus {
        let failed = self.failed().next().is_some();
        let pending = self
            .actions
            .iter()
            .any(|a| matches!(a.status, ActionStatus::Pending | ActionStatus::Executing));
        match (failed, pending) {
            (false, false) => TraceStatus::Completed,
            (false, true) => TraceStatus::Pending,
            (true, false) => TraceStatus::CompletedWithFailures,
            (true, true) => TraceStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_trace_is_complete() {
        assert_eq!(WorkflowTrace::new().status(), TraceStatus::Completed);
    }

    #[test]
    fn status_follows_actions() {
        let mut trace = WorkflowTrace::new().generic_receive().generic_receive();
        assert_eq!(trace.status(), TraceStatus::Pending);

        trace.actions_mut()[0].finish(None, Some("reset".into()));
        assert_eq!(trace.status(), TraceStatus::Failed);

        trace.actions_mut()[1].finish(None, None);
        assert_eq!(trace.status(), TraceStatus::CompletedWithFailures);
        assert_eq!(trace.failed().count(), 1);
        assert_eq!(trace.actions()[0].failure(), Some("reset"));
    }

    #[test]
    fn extend_resets_appended_actions() {
        let mut done = WorkflowTrace::new().generic_receive();
        done.actions_mut()[0].finish(None, None);
        let trace = WorkflowTrace::new().continue_on_failure().extend(done);
        assert_eq!(trace.actions()[0].status(), ActionStatus::Pending);
        assert_eq!(trace.policy(), FailurePolicy::Continue);
    }

    #[test]
    fn receive_actions_map_to_stop_conditions() {
        let kind = UnitKind::Alert;
        let till = Action::ReceiveTill { kind };
        assert_eq!(till.stop_condition(), Some(StopCondition::FirstOf(kind)));
        assert_eq!(Action::GenericReceive.stop_condition(), Some(StopCondition::Timeout));
        let bytes = WorkflowTrace::new().receive_bytes(5);
        assert_eq!(bytes.actions()[0].action().stop_condition(), Some(StopCondition::Bytes(5)));
        assert_eq!(Action::Send { configurations: Vec::new() }.stop_condition(), None);
    }
}
