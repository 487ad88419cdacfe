//! Runs a [`WorkflowTrace`] against one stack and one connection state.

use crate::{
    error::StackError,
    stack::{LayerStack, LayerStackProcessingResult, ReceiveEnd},
    state::ConnectionState,
    workflow::{Action, ActionStatus, FailurePolicy, TraceStatus, WorkflowTrace},
};

/// Owns a stack and the connection state it drives.
///
/// Actions run strictly in order; a failed network operation is never
/// retried.
#[derive(Debug)]
pub struct WorkflowExecutor {
    stack: LayerStack,
    state: ConnectionState,
}

impl WorkflowExecutor {
    /// Creates an executor over `stack` driving `state`.
    pub fn new(stack: LayerStack, state: ConnectionState) -> Self {
        Self { stack, state }
    }

    /// Executes every pending action of `trace` and returns its status.
    ///
    /// Actions that already finished in an earlier run are skipped. Under
    /// [`FailurePolicy::Halt`] the first failure stops the run.
    pub async fn execute(&mut self, trace: &mut WorkflowTrace) -> TraceStatus {
        let policy = trace.policy();
        for (index, entry) in trace.actions_mut().iter_mut().enumerate() {
            if entry.status() != ActionStatus::Pending {
                continue;
            }
            entry.start();
            tracing::info!(index, action = entry.action().label(), "action executing");

            let (result, failure) = match self.perform(entry.action()).await {
                Ok(result) => {
                    let failure = unmet_expectation(entry.action(), &result);
                    (Some(result), failure)
                },
                Err(err) => (None, Some(err.to_string())),
            };

            match &failure {
                Some(reason) => tracing::warn!(index, %reason, "action failed"),
                None => tracing::info!(index, "action completed"),
            }
            let failed = failure.is_some();
            entry.finish(result, failure);
            if failed && policy == FailurePolicy::Halt {
                break;
            }
        }

        let status = trace.status();
        tracing::info!(?status, "trace finished");
        status
    }

    /// Performs one action without touching any trace bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns the [`StackError`] that aborted the send or receive.
    pub async fn perform(
        &mut self,
        action: &Action,
    ) -> Result<LayerStackProcessingResult, StackError> {
        match action {
            Action::Send { configurations } => {
                self.stack.send(configurations.clone(), &mut self.state).await
            },
            receive => {
                let stop = receive.stop_condition().ok_or_else(|| {
                    StackError::Configuration(format!("{} has no stop condition", receive.label()))
                })?;
                self.stack.receive(&stop, &mut self.state).await
            },
        }
    }

    /// Closes the underlying channel.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Transport`] if the shutdown fails.
    pub async fn close(&mut self) -> Result<(), StackError> {
        self.stack.close().await
    }

    /// Connection state.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Mutable connection state, for scripts that adjust it between runs.
    pub fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    /// The stack.
    pub fn stack_mut(&mut self) -> &mut LayerStack {
        &mut self.stack
    }

    /// Consumes the executor, returning the final connection state.
    pub fn into_state(self) -> ConnectionState {
        self.state
    }
}

/// Why a receive that ran to its end still did not do what was scripted.
fn unmet_expectation(action: &Action, result: &LayerStackProcessingResult) -> Option<String> {
    let end = result.end?;
    if end == ReceiveEnd::Satisfied || matches!(action, Action::GenericReceive) {
        return None;
    }
    let cause = match end {
        ReceiveEnd::Eof => "peer closed",
        _ => "timed out",
    };
    let wanted = match action {
        Action::Receive { expected } => format!("expected {expected:?}"),
        Action::ReceiveTill { kind } => format!("no {kind:?}"),
        Action::ReceiveBytes { count } => {
            format!("{} of {count} bytes", result.bytes_received)
        },
        Action::Send { .. } | Action::GenericReceive => return None,
    };
    Some(format!("{wanted} received before the receive {cause}"))
}
