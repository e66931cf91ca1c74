#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ferry_core::address::BUCKET;
use ferry_core::{
    DataAddress, DataFlow, DataFlowStartMessage, DataFlowState, FlowType, LeaseConfig,
    ManualClock, RetryBackoff, StreamFailure, StreamResult, TransferType,
};
use ferry_manager::{
    ClientError, ControlPlaneClient, DataFlowManager, DataFlowManagerBuilder, ManagerSettings,
    TransferProcessEvent,
};
use ferry_pipeline::memory::{MemoryStore, MEMORY_TYPE};
use ferry_pipeline::{DataPart, DataSource, DataSourceFactory, PipelineError, PipelineService};
use ferry_storage::InMemoryDataFlowStore;
use tokio::sync::Semaphore;

pub const T0: i64 = 1_700_000_000_000;
pub const LEASE_TIME_MS: u64 = 10_000;
pub const LEASE_FACTOR: u32 = 3;
pub const RETRY_LIMIT: u32 = 2;

pub fn lease_config() -> LeaseConfig {
    LeaseConfig::new(Duration::from_millis(LEASE_TIME_MS), LEASE_FACTOR)
}

pub fn settings(runtime_id: &str) -> ManagerSettings {
    ManagerSettings {
        runtime_id: runtime_id.to_string(),
        batch_size: 10,
        iteration_wait: Duration::from_millis(5),
        max_iteration_wait: Duration::from_millis(50),
        send_retry_limit: RETRY_LIMIT,
        backoff: RetryBackoff::new(Duration::ZERO, Duration::ZERO),
        lease: lease_config(),
    }
}

/// Clock and store shared by every runtime of a test.
pub struct Cluster {
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryDataFlowStore>,
    pub memory: MemoryStore,
    pub gate: Arc<Semaphore>,
    pub failing_attempts: Arc<AtomicUsize>,
}

impl Cluster {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(InMemoryDataFlowStore::new(clock.clone(), lease_config()));
        Cluster {
            clock,
            store,
            memory: MemoryStore::new(),
            gate: Arc::new(Semaphore::new(0)),
            failing_attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A pipeline with the built-in factories plus `Gated` and `Failing`
    /// test sources.
    pub fn pipeline(&self) -> Arc<PipelineService> {
        let mut pipeline = PipelineService::with_defaults(4, 2, self.memory.clone());
        pipeline.register_source_factory(Arc::new(GatedSourceFactory {
            gate: self.gate.clone(),
        }));
        pipeline.register_source_factory(Arc::new(FailingSourceFactory {
            attempts: self.failing_attempts.clone(),
        }));
        Arc::new(pipeline)
    }

    pub fn builder(&self, runtime_id: &str, client: Arc<RecordingClient>) -> DataFlowManagerBuilder {
        DataFlowManager::builder(settings(runtime_id), self.store.clone())
            .clock(self.clock.clone())
            .client(client)
            .transfer_service(self.pipeline())
    }

    pub fn manager(&self, runtime_id: &str, client: Arc<RecordingClient>) -> DataFlowManager {
        self.builder(runtime_id, client).build()
    }

    pub fn advance(&self, ms: u64) {
        self.clock.advance(Duration::from_millis(ms));
    }
}

pub fn memory(bucket: &str) -> DataAddress {
    DataAddress::new(MEMORY_TYPE).with_property(BUCKET, bucket)
}

pub fn push_message(id: &str, source: DataAddress, destination: DataAddress) -> DataFlowStartMessage {
    DataFlowStartMessage {
        flow_id: Some(id.to_string()),
        process_id: format!("process-{id}"),
        agreement_id: None,
        asset_id: None,
        transfer_type: TransferType::new(destination.address_type.clone(), FlowType::Push),
        source,
        destination: Some(destination),
        callback_address: None,
        properties: BTreeMap::new(),
        trace_context: BTreeMap::new(),
    }
}

/// Tick and drain until `flow_id` reaches `state`.
pub async fn settle(manager: &DataFlowManager, flow_id: &str, state: DataFlowState) -> DataFlow {
    for _ in 0..50 {
        manager.tick().await.unwrap();
        manager.drain().await;
        let flow = manager.status(flow_id).await.unwrap();
        if flow.state == state {
            return flow;
        }
    }
    let flow = manager.status(flow_id).await.unwrap();
    panic!("flow {flow_id} stuck in {} (expected {state}): {:?}", flow.state, flow.error_detail);
}

/// Tick until a PUSH transfer for `flow_id` is running, without draining.
pub async fn until_transferring(manager: &DataFlowManager, flow_id: &str) -> DataFlow {
    for _ in 0..50 {
        manager.tick().await.unwrap();
        let flow = manager.status(flow_id).await.unwrap();
        if flow.state == DataFlowState::Started {
            // Let the spawned transfer register with the pipeline.
            tokio::time::sleep(Duration::from_millis(20)).await;
            return flow;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("flow {flow_id} never started");
}

// ── Control plane ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RecordingClient {
    events: Mutex<Vec<(String, TransferProcessEvent, Option<DataAddress>)>>,
}

impl RecordingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events_for(&self, flow_id: &str) -> Vec<TransferProcessEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id == flow_id)
            .map(|(_, event, _)| *event)
            .collect()
    }

    pub fn last_data_address(&self, flow_id: &str) -> Option<DataAddress> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _, address)| id == flow_id && address.is_some())
            .and_then(|(_, _, address)| address.clone())
    }
}

#[async_trait]
impl ControlPlaneClient for RecordingClient {
    async fn notify(&self, flow: &DataFlow, event: TransferProcessEvent) -> Result<(), ClientError> {
        self.events.lock().unwrap().push((
            flow.id.clone(),
            event,
            flow.endpoint_data_reference.clone(),
        ));
        Ok(())
    }
}

// ── Test sources ──────────────────────────────────────────────────────────────

/// Address type `Gated`: one part, released only when the test adds a
/// permit to the gate.
pub struct GatedSourceFactory {
    gate: Arc<Semaphore>,
}

struct GatedSource {
    gate: Arc<Semaphore>,
    done: bool,
}

#[async_trait]
impl DataSource for GatedSource {
    async fn next_part(&mut self) -> StreamResult<Option<DataPart>> {
        if self.done {
            return Ok(None);
        }
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| StreamFailure::cancelled("gate closed"))?;
        permit.forget();
        self.done = true;
        Ok(Some(DataPart::from_bytes("gated", b"released".to_vec())))
    }
}

#[async_trait]
impl DataSourceFactory for GatedSourceFactory {
    fn supported_type(&self) -> &str {
        "Gated"
    }

    fn validate(&self, _address: &DataAddress) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn create_source(&self, _address: &DataAddress) -> StreamResult<Box<dyn DataSource>> {
        Ok(Box::new(GatedSource {
            gate: self.gate.clone(),
            done: false,
        }))
    }
}

/// Address type `Failing`: every read fails transiently and is counted.
pub struct FailingSourceFactory {
    attempts: Arc<AtomicUsize>,
}

struct FailingSource;

#[async_trait]
impl DataSource for FailingSource {
    async fn next_part(&mut self) -> StreamResult<Option<DataPart>> {
        Err(StreamFailure::general("connection reset by peer"))
    }
}

#[async_trait]
impl DataSourceFactory for FailingSourceFactory {
    fn supported_type(&self) -> &str {
        "Failing"
    }

    fn validate(&self, _address: &DataAddress) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn create_source(&self, _address: &DataAddress) -> StreamResult<Box<dyn DataSource>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FailingSource))
    }
}
