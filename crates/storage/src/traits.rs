use async_trait::async_trait;
use ferry_core::{DataFlow, DataFlowState, FlowType};

use crate::error::StorageError;

/// Selection criteria for [`DataFlowStore::next_not_leased`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowQuery {
    pub state: DataFlowState,
    pub flow_type: Option<FlowType>,
    /// Only flows that still hold resources needing deprovisioning.
    pub holding_resources: bool,
}

impl FlowQuery {
    pub fn in_state(state: DataFlowState) -> Self {
        FlowQuery {
            state,
            flow_type: None,
            holding_resources: false,
        }
    }

    pub fn with_flow_type(mut self, flow_type: FlowType) -> Self {
        self.flow_type = Some(flow_type);
        self
    }

    pub fn holding_resources(mut self) -> Self {
        self.holding_resources = true;
        self
    }

    pub fn matches(&self, flow: &DataFlow) -> bool {
        flow.state == self.state
            && self.flow_type.map_or(true, |t| t == flow.flow_type)
            && (!self.holding_resources || flow.has_provisioned_resources())
    }
}

/// How [`DataFlowStore::acquire_lease`] treats a lease held by someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseMode {
    /// Fail with `AlreadyLeased` while another runtime's lease is live.
    Acquire,
    /// Take the lease regardless. Reserved for authoritative external signals.
    Steal,
}

/// What [`DataFlowStore::save`] does with the caller's lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveMode {
    #[default]
    ReleaseLease,
    /// Persist and keep ownership in one step (a PUSH transfer about to run).
    RetainLease,
}

/// Persistence contract for data flows.
///
/// ## Leases
///
/// Every flow carries an optional [`Lease`](ferry_core::Lease). A lease is
/// reclaimable by its own holder once it expired, and by any other runtime
/// once `leased_at + abandon_time` has passed. Lease operations never change
/// the flow's `version`.
///
/// ## OCC
///
/// `save` is conditional on `stored.version == flow.version` and on the
/// stored lease being absent or held by the caller. A stale writer gets
/// `ConcurrentConflict` or `LeaseLost` (see [`StorageError::is_stale_write`])
/// and the stored flow is left untouched.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` to be shared between the
/// scheduler loop, handler tasks and the HTTP API.
#[async_trait]
pub trait DataFlowStore: Send + Sync + 'static {
    /// Persist a new flow at version 1, unleased.
    ///
    /// Returns `Err(StorageError::AlreadyExists)` if the id is taken.
    async fn create(&self, flow: DataFlow) -> Result<DataFlow, StorageError>;

    async fn find_by_id(&self, flow_id: &str) -> Result<Option<DataFlow>, StorageError>;

    /// Atomically lease up to `batch_size` flows matching `query` whose lease
    /// is absent or reclaimable by `holder`, oldest `state_timestamp` first.
    ///
    /// Concurrent callers never receive the same flow.
    async fn next_not_leased(
        &self,
        holder: &str,
        batch_size: usize,
        query: &FlowQuery,
    ) -> Result<Vec<DataFlow>, StorageError>;

    /// Lease a single flow.
    async fn acquire_lease(
        &self,
        holder: &str,
        flow_id: &str,
        mode: LeaseMode,
    ) -> Result<DataFlow, StorageError>;

    /// Extend a lease held by `holder`. Returns `LeaseLost` if it moved on.
    async fn renew_lease(&self, holder: &str, flow_id: &str) -> Result<(), StorageError>;

    /// Conditional upsert. Returns the new version.
    async fn save(
        &self,
        holder: &str,
        flow: &DataFlow,
        mode: SaveMode,
    ) -> Result<i64, StorageError>;

    /// Drop `holder`'s lease without touching the flow. A no-op when the
    /// lease already belongs to someone else.
    async fn release_lease(&self, holder: &str, flow_id: &str) -> Result<(), StorageError>;

    /// Drop every lease recorded for `holder`. Returns how many were freed.
    async fn release_leases_held_by(&self, holder: &str) -> Result<usize, StorageError>;

    /// Read-only listing, oldest first. `limit = 0` means no limit.
    async fn query(
        &self,
        state: Option<DataFlowState>,
        limit: usize,
    ) -> Result<Vec<DataFlow>, StorageError>;
}
