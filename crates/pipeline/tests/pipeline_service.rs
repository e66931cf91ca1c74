use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ferry_core::address::BUCKET;
use ferry_core::{
    DataAddress, DataFlow, DataFlowStartMessage, FailureReason, FlowType, ResponseStatus,
    StreamResult, TransferType,
};
use ferry_pipeline::memory::{MemoryStore, MEMORY_TYPE};
use ferry_pipeline::{
    DataPart, DataSource, DataSourceFactory, PipelineError, PipelineService, TransferService,
};
use tokio_util::sync::CancellationToken;

fn flow(id: &str, source: DataAddress, destination: DataAddress) -> DataFlow {
    let transfer_type = TransferType::new(destination.address_type.clone(), FlowType::Push);
    DataFlow::from_start_message(
        id.to_string(),
        DataFlowStartMessage {
            flow_id: Some(id.to_string()),
            process_id: format!("process-{id}"),
            agreement_id: None,
            asset_id: None,
            source,
            destination: Some(destination),
            transfer_type,
            callback_address: None,
            properties: BTreeMap::new(),
            trace_context: BTreeMap::new(),
        },
        0,
    )
}

fn bucket(name: &str) -> DataAddress {
    DataAddress::new(MEMORY_TYPE).with_property(BUCKET, name)
}

/// A source that never produces its first part.
struct StalledSourceFactory;

struct StalledSource;

#[async_trait]
impl DataSource for StalledSource {
    async fn next_part(&mut self) -> StreamResult<Option<DataPart>> {
        std::future::pending().await
    }
}

#[async_trait]
impl DataSourceFactory for StalledSourceFactory {
    fn supported_type(&self) -> &str {
        "Stalled"
    }

    fn validate(&self, _address: &DataAddress) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn create_source(&self, _address: &DataAddress) -> StreamResult<Box<dyn DataSource>> {
        Ok(Box::new(StalledSource))
    }
}

fn pipeline(threads: usize, memory: MemoryStore) -> Arc<PipelineService> {
    let mut pipeline = PipelineService::with_defaults(threads, 4, memory);
    pipeline.register_source_factory(Arc::new(StalledSourceFactory));
    Arc::new(pipeline)
}

async fn wait_until_running(pipeline: &PipelineService, n: usize) {
    for _ in 0..200 {
        if pipeline.running() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {n} running transfers, saw {}", pipeline.running());
}

#[tokio::test]
async fn memory_to_memory_copies_every_part() {
    let memory = MemoryStore::new();
    for i in 0..10 {
        memory.put("in", &format!("part-{i}"), vec![i as u8; 1024 * (i + 1)]);
    }
    let pipeline = pipeline(2, memory.clone());

    let summary = pipeline
        .transfer(&flow("f1", bucket("in"), bucket("out")), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.parts, 10);
    assert_eq!(summary.bytes, (1..=10).map(|k| 1024 * k as u64).sum::<u64>());
    assert_eq!(memory.objects("out"), memory.objects("in"));
    assert_eq!(pipeline.running(), 0);
}

#[tokio::test]
async fn unknown_destination_type_fails_validation() {
    let pipeline = pipeline(1, MemoryStore::new());
    let flow = flow("f1", bucket("in"), DataAddress::new("Kafka"));

    assert!(!pipeline.can_handle(&flow));
    let failure = pipeline.validate(&flow).unwrap_err();
    assert_eq!(failure.status, ResponseStatus::FatalError);
    assert!(failure.detail.contains("Kafka"));

    let err = pipeline.transfer(&flow, &CancellationToken::new()).await.unwrap_err();
    assert!(!err.retryable);
}

#[tokio::test]
async fn terminate_cancels_in_flight_transfer() {
    let pipeline = pipeline(1, MemoryStore::new());
    let stalled = flow("slow", DataAddress::new("Stalled"), bucket("out"));

    let task = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.transfer(&stalled, &CancellationToken::new()).await })
    };
    wait_until_running(&pipeline, 1).await;

    assert!(pipeline.terminate("slow").await);
    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.reason, FailureReason::Cancelled);
    assert!(!pipeline.terminate("slow").await);
}

#[tokio::test]
async fn pool_bounds_concurrent_transfers() {
    let memory = MemoryStore::new();
    memory.put("in", "a", "payload");
    let pipeline = pipeline(1, memory.clone());

    let stalled = {
        let pipeline = pipeline.clone();
        let flow = flow("slow", DataAddress::new("Stalled"), bucket("out"));
        tokio::spawn(async move { pipeline.transfer(&flow, &CancellationToken::new()).await })
    };
    wait_until_running(&pipeline, 1).await;

    let queued = {
        let pipeline = pipeline.clone();
        let flow = flow("fast", bucket("in"), bucket("out"));
        tokio::spawn(async move { pipeline.transfer(&flow, &CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!queued.is_finished(), "second transfer must wait for a pool slot");
    assert!(memory.get("out", "a").is_none());

    pipeline.terminate("slow").await;
    assert!(stalled.await.unwrap().is_err());
    let summary = queued.await.unwrap().unwrap();
    assert_eq!(summary.parts, 1);
    assert_eq!(memory.get("out", "a").unwrap(), b"payload");
}

#[tokio::test]
async fn close_all_cancels_and_refuses_new_work() {
    let memory = MemoryStore::new();
    memory.put("in", "a", "x");
    let pipeline = pipeline(2, memory);

    let stalled = {
        let pipeline = pipeline.clone();
        let flow = flow("slow", DataAddress::new("Stalled"), bucket("out"));
        tokio::spawn(async move { pipeline.transfer(&flow, &CancellationToken::new()).await })
    };
    wait_until_running(&pipeline, 1).await;

    pipeline.close_all().await;
    assert_eq!(
        stalled.await.unwrap().unwrap_err().reason,
        FailureReason::Cancelled
    );
    let err = pipeline
        .transfer(&flow("late", bucket("in"), bucket("out")), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.reason, FailureReason::Cancelled);
}

#[tokio::test]
async fn a_run_token_never_reaches_the_next_run_of_the_flow() {
    let pipeline = pipeline(2, MemoryStore::new());
    let first = CancellationToken::new();

    let task = {
        let pipeline = pipeline.clone();
        let first = first.clone();
        let stalled = flow("slow", DataAddress::new("Stalled"), bucket("out"));
        tokio::spawn(async move { pipeline.transfer(&stalled, &first).await })
    };
    wait_until_running(&pipeline, 1).await;
    first.cancel();
    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.reason, FailureReason::Cancelled);
    assert_eq!(pipeline.running(), 0);

    let second = {
        let pipeline = pipeline.clone();
        let stalled = flow("slow", DataAddress::new("Stalled"), bucket("out"));
        tokio::spawn(async move { pipeline.transfer(&stalled, &CancellationToken::new()).await })
    };
    wait_until_running(&pipeline, 1).await;

    // The first run's owner cancelling again must not touch the new run.
    first.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished());
    assert_eq!(pipeline.running(), 1);

    assert!(pipeline.terminate("slow").await);
    assert!(second.await.unwrap().is_err());
}
