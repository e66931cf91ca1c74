//! Every state a flow is persisted in must follow from the one before it,
//! whichever path the flow takes.

mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::*;
use ferry_core::{
    DataAddress, DataFlow, DataFlowState, DeprovisionedResource, ProvisionResource,
    ProvisionedResource, StatusResult,
};
use ferry_manager::{DataFlowManager, Provisioner, ResourceDefinitionGenerator};
use ferry_storage::{
    DataFlowStore, FlowQuery, InMemoryDataFlowStore, LeaseMode, SaveMode, StorageError,
};

use DataFlowState::*;

/// Delegates to the in-memory store and records each persisted state.
struct RecordingStore {
    inner: Arc<InMemoryDataFlowStore>,
    saved: Mutex<Vec<(String, DataFlowState)>>,
}

impl RecordingStore {
    fn new(cluster: &Cluster) -> Arc<Self> {
        Arc::new(RecordingStore {
            inner: cluster.store.clone(),
            saved: Mutex::new(Vec::new()),
        })
    }

    fn history(&self, flow_id: &str) -> Vec<DataFlowState> {
        self.saved
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == flow_id)
            .map(|(_, state)| *state)
            .collect()
    }

    fn record(&self, flow: &DataFlow) {
        self.saved.lock().unwrap().push((flow.id.clone(), flow.state));
    }
}

#[async_trait]
impl DataFlowStore for RecordingStore {
    async fn create(&self, flow: DataFlow) -> Result<DataFlow, StorageError> {
        let created = self.inner.create(flow).await?;
        self.record(&created);
        Ok(created)
    }

    async fn find_by_id(&self, flow_id: &str) -> Result<Option<DataFlow>, StorageError> {
        self.inner.find_by_id(flow_id).await
    }

    async fn next_not_leased(
        &self,
        holder: &str,
        batch_size: usize,
        query: &FlowQuery,
    ) -> Result<Vec<DataFlow>, StorageError> {
        self.inner.next_not_leased(holder, batch_size, query).await
    }

    async fn acquire_lease(
        &self,
        holder: &str,
        flow_id: &str,
        mode: LeaseMode,
    ) -> Result<DataFlow, StorageError> {
        self.inner.acquire_lease(holder, flow_id, mode).await
    }

    async fn renew_lease(&self, holder: &str, flow_id: &str) -> Result<(), StorageError> {
        self.inner.renew_lease(holder, flow_id).await
    }

    async fn save(
        &self,
        holder: &str,
        flow: &DataFlow,
        mode: SaveMode,
    ) -> Result<i64, StorageError> {
        let version = self.inner.save(holder, flow, mode).await?;
        self.record(flow);
        Ok(version)
    }

    async fn release_lease(&self, holder: &str, flow_id: &str) -> Result<(), StorageError> {
        self.inner.release_lease(holder, flow_id).await
    }

    async fn release_leases_held_by(&self, holder: &str) -> Result<usize, StorageError> {
        self.inner.release_leases_held_by(holder).await
    }

    async fn query(
        &self,
        state: Option<DataFlowState>,
        limit: usize,
    ) -> Result<Vec<DataFlow>, StorageError> {
        self.inner.query(state, limit).await
    }
}

/// One `Token` resource per flow, provisioned on request.
struct TokenResources;

impl ResourceDefinitionGenerator for TokenResources {
    fn name(&self) -> &str {
        "token"
    }

    fn can_generate(&self, _flow: &DataFlow) -> bool {
        true
    }

    fn generate(&self, flow: &DataFlow) -> Vec<ProvisionResource> {
        vec![ProvisionResource::new("", &flow.id, "Token")]
    }
}

#[async_trait]
impl Provisioner for TokenResources {
    fn can_provision(&self, resource: &ProvisionResource) -> bool {
        resource.resource_type == "Token"
    }

    async fn provision(&self, resource: &ProvisionResource) -> StatusResult<ProvisionedResource> {
        Ok(ProvisionedResource {
            id: resource.id.clone(),
            resource_id: format!("ext-{}", resource.id),
            flow_id: resource.flow_id.clone(),
            pending: false,
            properties: BTreeMap::new(),
        })
    }

    async fn deprovision(&self, resource: &ProvisionResource) -> StatusResult<DeprovisionedResource> {
        Ok(DeprovisionedResource {
            id: resource.id.clone(),
            resource_id: format!("ext-{}", resource.id),
            flow_id: resource.flow_id.clone(),
            pending: false,
        })
    }
}

fn manager(cluster: &Cluster, store: &Arc<RecordingStore>, with_resources: bool) -> DataFlowManager {
    let mut builder = DataFlowManager::builder(settings("runtime-a"), store.clone())
        .clock(cluster.clock.clone())
        .client(RecordingClient::new())
        .transfer_service(cluster.pipeline());
    if with_resources {
        builder = builder
            .consumer_generator(Arc::new(TokenResources))
            .provisioner(Arc::new(TokenResources));
    }
    builder.build()
}

fn assert_forward_only(history: &[DataFlowState]) {
    for pair in history.windows(2) {
        assert!(
            pair[0].can_transition_to(pair[1]),
            "{} -> {} in {history:?}",
            pair[0],
            pair[1]
        );
    }
}

/// The history with repeated saves of the same state collapsed.
fn path(mut history: Vec<DataFlowState>) -> Vec<DataFlowState> {
    history.dedup();
    history
}

#[tokio::test]
async fn retried_transfer_never_steps_back() {
    let cluster = Cluster::new();
    let store = RecordingStore::new(&cluster);
    let manager = manager(&cluster, &store, false);

    manager
        .start_flow(push_message("f1", DataAddress::new("Failing"), memory("out")))
        .await
        .unwrap();
    settle(&manager, "f1", Terminated).await;

    let history = store.history("f1");
    assert_forward_only(&history);
    assert!(
        history.iter().filter(|s| **s == Started).count() > RETRY_LIMIT as usize,
        "{history:?}"
    );
    assert_eq!(path(history), vec![Received, Provisioned, Started, Terminated]);
}

#[tokio::test]
async fn suspend_resume_and_terminate_never_step_back() {
    let cluster = Cluster::new();
    let store = RecordingStore::new(&cluster);
    let manager = manager(&cluster, &store, false);

    manager
        .start_flow(push_message("f1", DataAddress::new("Gated"), memory("out")))
        .await
        .unwrap();
    until_transferring(&manager, "f1").await;
    manager.suspend("f1", None).await.unwrap();
    manager.drain().await;

    manager.resume("f1").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let terminated = manager.terminate("f1", None).await.unwrap();
    assert_eq!(terminated.state, Terminated);
    manager.drain().await;
    assert_eq!(manager.tick().await.unwrap(), 0);

    let history = store.history("f1");
    assert_forward_only(&history);
    assert_eq!(
        path(history),
        vec![Received, Provisioned, Started, Suspended, Started, Terminated]
    );
}

#[tokio::test]
async fn completed_flow_with_resources_reaches_deprovisioned_in_order() {
    let cluster = Cluster::new();
    cluster.memory.put("in", "a", "payload");
    let store = RecordingStore::new(&cluster);
    let manager = manager(&cluster, &store, true);

    manager
        .start_flow(push_message("f1", memory("in"), memory("out")))
        .await
        .unwrap();
    settle(&manager, "f1", Deprovisioned).await;

    let history = store.history("f1");
    assert_forward_only(&history);
    assert_eq!(
        path(history),
        vec![
            Received,
            Provisioning,
            Provisioned,
            Started,
            Completed,
            Deprovisioning,
            Deprovisioned
        ]
    );
}

#[tokio::test]
async fn terminated_flow_with_resources_reaches_deprovisioned_in_order() {
    let cluster = Cluster::new();
    let store = RecordingStore::new(&cluster);
    let manager = manager(&cluster, &store, true);

    manager
        .start_flow(push_message("f1", DataAddress::new("Gated"), memory("out")))
        .await
        .unwrap();
    until_transferring(&manager, "f1").await;
    let terminated = manager.terminate("f1", None).await.unwrap();
    assert_eq!(terminated.state, Deprovisioning);
    settle(&manager, "f1", Deprovisioned).await;

    let history = store.history("f1");
    assert_forward_only(&history);
    assert_eq!(
        path(history),
        vec![
            Received,
            Provisioning,
            Provisioned,
            Started,
            Terminated,
            Deprovisioning,
            Deprovisioned
        ]
    );
}
