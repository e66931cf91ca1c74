use crate::flow::DataFlowState;
use crate::status::{ResponseStatus, StatusFailure};

/// Failure taxonomy of the data-flow scheduler.
///
/// Only [`FlowError::Configuration`], [`FlowError::TransientIo`] and
/// [`FlowError::FatalTransfer`] ever reach a flow's `error_detail`.
/// [`FlowError::LeaseLost`] is swallowed: the flow is owned elsewhere now.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// No matching transfer service, generator, factory or provisioner.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network or store hiccup.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// A source or sink declared the failure permanent.
    #[error("transfer failed: {0}")]
    FatalTransfer(String),

    /// The runtime no longer holds the lease on the flow.
    #[error("lease lost on flow {flow_id}")]
    LeaseLost { flow_id: String },

    /// The state machine does not allow the requested move.
    #[error("invalid transition for flow {flow_id}: {from} -> {to}")]
    InvalidTransition {
        flow_id: String,
        from: DataFlowState,
        to: DataFlowState,
    },
}

impl FlowError {
    /// Retry classification of this error.
    pub fn response_status(&self) -> ResponseStatus {
        match self {
            FlowError::TransientIo(_) | FlowError::LeaseLost { .. } => ResponseStatus::ErrorRetry,
            FlowError::Configuration(_)
            | FlowError::FatalTransfer(_)
            | FlowError::InvalidTransition { .. } => ResponseStatus::FatalError,
        }
    }
}

impl From<FlowError> for StatusFailure {
    fn from(err: FlowError) -> Self {
        StatusFailure {
            status: err.response_status(),
            detail: err.to_string(),
        }
    }
}
