use ferry_core::{DataFlowState, FlowError};
use ferry_storage::StorageError;

/// Errors returned by the manager's signal API.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("data flow not found: {0}")]
    NotFound(String),

    #[error("data flow already exists: {0}")]
    AlreadyExists(String),

    #[error("data flow {flow_id} cannot be {action} in state {state}")]
    InvalidTransition {
        flow_id: String,
        action: &'static str,
        state: DataFlowState,
    },

    #[error("data flow {flow_id} has no resource {resource_id}")]
    UnknownResource { flow_id: String, resource_id: String },

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("data flow manager is shut down")]
    ShutDown,
}

impl ManagerError {
    /// Map a storage error on a single flow, turning `NotFound` into the
    /// manager's own variant.
    pub(crate) fn from_storage(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { flow_id } => ManagerError::NotFound(flow_id),
            StorageError::AlreadyExists { flow_id } => ManagerError::AlreadyExists(flow_id),
            other => ManagerError::Storage(other),
        }
    }
}
