use std::future::Future;
use std::sync::Arc;

use ferry_core::config::LeaseConfig;
use ferry_core::{DataFlowState, ManualClock};

use super::{expect, fixture, make_flow, TestResult, LEASE_FACTOR, LEASE_TIME_MS, T0};
use crate::{DataFlowStore, FlowQuery, LeaseMode, SaveMode, StorageError};

pub(super) async fn run_save_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: DataFlowStore,
    F: Fn(Arc<ManualClock>, LeaseConfig) -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "save",
            "save_bumps_version_and_releases_lease",
            save_bumps_version_and_releases_lease(factory).await,
        ),
        TestResult::from_result(
            "save",
            "save_retaining_lease_keeps_ownership",
            save_retaining_lease_keeps_ownership(factory).await,
        ),
        TestResult::from_result(
            "save",
            "stale_version_is_rejected",
            stale_version_is_rejected(factory).await,
        ),
        TestResult::from_result(
            "save",
            "zombie_save_after_reclaim_is_rejected",
            zombie_save_after_reclaim_is_rejected(factory).await,
        ),
        TestResult::from_result(
            "save",
            "save_of_new_flow_inserts",
            save_of_new_flow_inserts(factory).await,
        ),
    ]
}

async fn save_bumps_version_and_releases_lease<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: DataFlowStore,
    F: Fn(Arc<ManualClock>, LeaseConfig) -> Fut,
    Fut: Future<Output = S>,
{
    let fx = fixture(factory).await;
    fx.store
        .create(make_flow("f1", DataFlowState::Received, T0))
        .await
        .map_err(|e| format!("create: {e}"))?;
    let mut flow = fx
        .store
        .acquire_lease("rt-a", "f1", LeaseMode::Acquire)
        .await
        .map_err(|e| format!("acquire: {e}"))?;

    flow.transition_to(DataFlowState::Provisioned, T0 + 5)
        .map_err(|e| e.to_string())?;
    let version = fx
        .store
        .save("rt-a", &flow, SaveMode::ReleaseLease)
        .await
        .map_err(|e| format!("save: {e}"))?;
    expect(version == 2, "save must return the next version", version)?;

    let stored = fx
        .store
        .find_by_id("f1")
        .await
        .map_err(|e| format!("find: {e}"))?
        .ok_or("flow missing")?;
    expect(
        stored.state == DataFlowState::Provisioned,
        "state must be persisted",
        stored.state,
    )?;
    expect(stored.version == 2, "stored version", stored.version)?;
    expect(stored.lease.is_none(), "lease must be released", &stored.lease)?;
    expect(
        stored.runtime_id.as_deref() == Some("rt-a"),
        "runtime id records the last writer",
        &stored.runtime_id,
    )
}

async fn save_retaining_lease_keeps_ownership<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: DataFlowStore,
    F: Fn(Arc<ManualClock>, LeaseConfig) -> Fut,
    Fut: Future<Output = S>,
{
    let fx = fixture(factory).await;
    fx.store
        .create(make_flow("f1", DataFlowState::Provisioned, T0))
        .await
        .map_err(|e| format!("create: {e}"))?;
    let mut flow = fx
        .store
        .acquire_lease("rt-a", "f1", LeaseMode::Acquire)
        .await
        .map_err(|e| format!("acquire: {e}"))?;
    flow.transition_to(DataFlowState::Started, T0)
        .map_err(|e| e.to_string())?;
    fx.store
        .save("rt-a", &flow, SaveMode::RetainLease)
        .await
        .map_err(|e| format!("save: {e}"))?;

    let batch = fx
        .store
        .next_not_leased("rt-b", 10, &FlowQuery::in_state(DataFlowState::Started))
        .await
        .map_err(|e| format!("next_not_leased: {e}"))?;
    expect(
        batch.is_empty(),
        "retained lease must keep the flow hidden",
        batch.len(),
    )?;
    fx.store
        .renew_lease("rt-a", "f1")
        .await
        .map_err(|e| format!("renew after retaining save: {e}"))
}

async fn stale_version_is_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: DataFlowStore,
    F: Fn(Arc<ManualClock>, LeaseConfig) -> Fut,
    Fut: Future<Output = S>,
{
    let fx = fixture(factory).await;
    fx.store
        .create(make_flow("f1", DataFlowState::Started, T0))
        .await
        .map_err(|e| format!("create: {e}"))?;
    let copy = fx
        .store
        .acquire_lease("rt-a", "f1", LeaseMode::Acquire)
        .await
        .map_err(|e| format!("acquire: {e}"))?;

    let mut first = copy.clone();
    first
        .transition_to(DataFlowState::Completed, T0 + 1)
        .map_err(|e| e.to_string())?;
    fx.store
        .save("rt-a", &first, SaveMode::RetainLease)
        .await
        .map_err(|e| format!("first save: {e}"))?;

    let mut second = copy;
    second
        .transition_to(DataFlowState::Terminated, T0 + 2)
        .map_err(|e| e.to_string())?;
    match fx.store.save("rt-a", &second, SaveMode::ReleaseLease).await {
        Err(e) if e.is_stale_write() => {}
        other => return Err(format!("expected a stale-write rejection, got {other:?}")),
    }

    let stored = fx
        .store
        .find_by_id("f1")
        .await
        .map_err(|e| format!("find: {e}"))?
        .ok_or("flow missing")?;
    expect(
        stored.state == DataFlowState::Completed,
        "rejected save must not change state",
        stored.state,
    )
}

async fn zombie_save_after_reclaim_is_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: DataFlowStore,
    F: Fn(Arc<ManualClock>, LeaseConfig) -> Fut,
    Fut: Future<Output = S>,
{
    let fx = fixture(factory).await;
    fx.store
        .create(make_flow("f1", DataFlowState::Started, T0))
        .await
        .map_err(|e| format!("create: {e}"))?;
    let query = FlowQuery::in_state(DataFlowState::Started);
    let zombie = fx
        .store
        .next_not_leased("rt-a", 1, &query)
        .await
        .map_err(|e| format!("rt-a lease: {e}"))?
        .pop()
        .ok_or("rt-a got nothing")?;

    fx.advance_ms(LEASE_TIME_MS * LEASE_FACTOR as i64);
    fx.store
        .next_not_leased("rt-b", 1, &query)
        .await
        .map_err(|e| format!("rt-b reclaim: {e}"))?
        .pop()
        .ok_or("rt-b could not reclaim")?;

    let mut late = zombie;
    late.transition_to(DataFlowState::Completed, T0)
        .map_err(|e| e.to_string())?;
    match fx.store.save("rt-a", &late, SaveMode::ReleaseLease).await {
        Err(StorageError::LeaseLost { .. }) => {}
        other => return Err(format!("expected LeaseLost, got {other:?}")),
    }

    let stored = fx
        .store
        .find_by_id("f1")
        .await
        .map_err(|e| format!("find: {e}"))?
        .ok_or("flow missing")?;
    expect(
        stored.state == DataFlowState::Started && stored.lease_holder() == Some("rt-b"),
        "zombie save must leave the reclaimed flow untouched",
        (stored.state, stored.lease_holder().map(str::to_string)),
    )
}

async fn save_of_new_flow_inserts<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: DataFlowStore,
    F: Fn(Arc<ManualClock>, LeaseConfig) -> Fut,
    Fut: Future<Output = S>,
{
    let fx = fixture(factory).await;
    let flow = make_flow("fresh", DataFlowState::Received, T0);
    let version = fx
        .store
        .save("rt-a", &flow, SaveMode::ReleaseLease)
        .await
        .map_err(|e| format!("save: {e}"))?;
    expect(version == 1, "upsert of a new flow yields version 1", version)?;

    let mut unknown = make_flow("ghost", DataFlowState::Received, T0);
    unknown.version = 4;
    match fx.store.save("rt-a", &unknown, SaveMode::ReleaseLease).await {
        Err(StorageError::NotFound { .. }) => Ok(()),
        other => Err(format!("expected NotFound for versioned unknown flow, got {other:?}")),
    }
}
