/// All errors that can be returned by a [`DataFlowStore`](crate::DataFlowStore).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A flow with this id already exists.
    #[error("data flow already exists: {flow_id}")]
    AlreadyExists { flow_id: String },

    /// No flow with the given id.
    #[error("data flow not found: {flow_id}")]
    NotFound { flow_id: String },

    /// Another runtime holds a live lease on the flow.
    #[error("data flow {flow_id} is leased by {holder}")]
    AlreadyLeased { flow_id: String, holder: String },

    /// The caller no longer holds the lease (it was reclaimed or stolen).
    #[error("lease lost on data flow {flow_id}")]
    LeaseLost { flow_id: String },

    /// Optimistic concurrency check failed: the stored version moved on.
    #[error("concurrent conflict on data flow {flow_id}: expected version {expected_version}")]
    ConcurrentConflict {
        flow_id: String,
        expected_version: i64,
    },

    /// A backend-specific storage error (connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// The write came from a runtime that no longer owns the flow, or from a
    /// stale copy. Such outcomes are discarded, never retried.
    pub fn is_stale_write(&self) -> bool {
        matches!(
            self,
            StorageError::LeaseLost { .. } | StorageError::ConcurrentConflict { .. }
        )
    }
}
