use std::future::Future;
use std::sync::Arc;

use ferry_core::config::LeaseConfig;
use ferry_core::{DataFlowState, ManualClock};

use super::{expect, fixture, make_flow, TestResult, T0};
use crate::{DataFlowStore, StorageError};

pub(super) async fn run_create_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: DataFlowStore,
    F: Fn(Arc<ManualClock>, LeaseConfig) -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "create",
            "create_assigns_version_1_unleased",
            create_assigns_version_1_unleased(factory).await,
        ),
        TestResult::from_result(
            "create",
            "create_duplicate_is_rejected",
            create_duplicate_is_rejected(factory).await,
        ),
        TestResult::from_result(
            "create",
            "find_unknown_returns_none",
            find_unknown_returns_none(factory).await,
        ),
        TestResult::from_result(
            "create",
            "query_orders_oldest_first",
            query_orders_oldest_first(factory).await,
        ),
    ]
}

async fn create_assigns_version_1_unleased<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: DataFlowStore,
    F: Fn(Arc<ManualClock>, LeaseConfig) -> Fut,
    Fut: Future<Output = S>,
{
    let fx = fixture(factory).await;
    let created = fx
        .store
        .create(make_flow("f1", DataFlowState::Received, T0))
        .await
        .map_err(|e| format!("create: {e}"))?;
    expect(created.version == 1, "created version must be 1", created.version)?;

    let found = fx
        .store
        .find_by_id("f1")
        .await
        .map_err(|e| format!("find: {e}"))?
        .ok_or("created flow not found")?;
    expect(found.lease.is_none(), "created flow must be unleased", &found.lease)?;
    expect(
        found.state == DataFlowState::Received,
        "state must be preserved",
        found.state,
    )
}

async fn create_duplicate_is_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: DataFlowStore,
    F: Fn(Arc<ManualClock>, LeaseConfig) -> Fut,
    Fut: Future<Output = S>,
{
    let fx = fixture(factory).await;
    fx.store
        .create(make_flow("f1", DataFlowState::Received, T0))
        .await
        .map_err(|e| format!("first create: {e}"))?;
    match fx
        .store
        .create(make_flow("f1", DataFlowState::Started, T0))
        .await
    {
        Err(StorageError::AlreadyExists { .. }) => {}
        other => return Err(format!("expected AlreadyExists, got {other:?}")),
    }
    let found = fx
        .store
        .find_by_id("f1")
        .await
        .map_err(|e| format!("find: {e}"))?
        .ok_or("flow vanished")?;
    expect(
        found.state == DataFlowState::Received,
        "duplicate create must not overwrite",
        found.state,
    )
}

async fn find_unknown_returns_none<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: DataFlowStore,
    F: Fn(Arc<ManualClock>, LeaseConfig) -> Fut,
    Fut: Future<Output = S>,
{
    let fx = fixture(factory).await;
    let found = fx
        .store
        .find_by_id("missing")
        .await
        .map_err(|e| format!("find: {e}"))?;
    expect(found.is_none(), "unknown id must return None", found.map(|f| f.id))
}

async fn query_orders_oldest_first<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: DataFlowStore,
    F: Fn(Arc<ManualClock>, LeaseConfig) -> Fut,
    Fut: Future<Output = S>,
{
    let fx = fixture(factory).await;
    for (id, offset, state) in [
        ("late", 30, DataFlowState::Received),
        ("early", 10, DataFlowState::Received),
        ("other", 0, DataFlowState::Started),
        ("middle", 20, DataFlowState::Received),
    ] {
        fx.store
            .create(make_flow(id, state, T0 + offset))
            .await
            .map_err(|e| format!("create {id}: {e}"))?;
    }

    let received = fx
        .store
        .query(Some(DataFlowState::Received), 0)
        .await
        .map_err(|e| format!("query: {e}"))?;
    let ids: Vec<&str> = received.iter().map(|f| f.id.as_str()).collect();
    expect(
        ids == ["early", "middle", "late"],
        "query must filter by state, oldest first",
        &ids,
    )?;

    let limited = fx
        .store
        .query(None, 2)
        .await
        .map_err(|e| format!("query limit: {e}"))?;
    expect(limited.len() == 2, "limit must cap results", limited.len())
}
