use std::future::Future;
use std::sync::Arc;

use ferry_core::config::LeaseConfig;
use ferry_core::{DataFlowState, FlowType, ManualClock, ProvisionResource, ProvisionResourceState};

use super::{
    expect, fixture, make_flow, make_typed_flow, TestResult, LEASE_FACTOR, LEASE_TIME_MS, T0,
};
use crate::{DataFlowStore, FlowQuery, LeaseMode, StorageError};

pub(super) async fn run_lease_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: DataFlowStore,
    F: Fn(Arc<ManualClock>, LeaseConfig) -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "lease",
            "next_not_leased_leases_batch_oldest_first",
            next_not_leased_leases_batch_oldest_first(factory).await,
        ),
        TestResult::from_result(
            "lease",
            "next_not_leased_filters_flow_type",
            next_not_leased_filters_flow_type(factory).await,
        ),
        TestResult::from_result(
            "lease",
            "next_not_leased_filters_flows_holding_resources",
            next_not_leased_filters_flows_holding_resources(factory).await,
        ),
        TestResult::from_result(
            "lease",
            "live_lease_hidden_from_everyone",
            live_lease_hidden_from_everyone(factory).await,
        ),
        TestResult::from_result(
            "lease",
            "abandoned_lease_reclaimed_by_other_runtime",
            abandoned_lease_reclaimed_by_other_runtime(factory).await,
        ),
        TestResult::from_result(
            "lease",
            "acquire_respects_live_lease_steal_does_not",
            acquire_respects_live_lease_steal_does_not(factory).await,
        ),
        TestResult::from_result(
            "lease",
            "renew_requires_holder",
            renew_requires_holder(factory).await,
        ),
        TestResult::from_result(
            "lease",
            "release_leases_held_by_frees_only_holder",
            release_leases_held_by_frees_only_holder(factory).await,
        ),
    ]
}

async fn next_not_leased_leases_batch_oldest_first<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: DataFlowStore,
    F: Fn(Arc<ManualClock>, LeaseConfig) -> Fut,
    Fut: Future<Output = S>,
{
    let fx = fixture(factory).await;
    for i in 0..5 {
        fx.store
            .create(make_flow(&format!("f{i}"), DataFlowState::Received, T0 - i))
            .await
            .map_err(|e| format!("create f{i}: {e}"))?;
    }
    let query = FlowQuery::in_state(DataFlowState::Received);
    let batch = fx
        .store
        .next_not_leased("rt-a", 2, &query)
        .await
        .map_err(|e| format!("next_not_leased: {e}"))?;
    let ids: Vec<&str> = batch.iter().map(|f| f.id.as_str()).collect();
    expect(ids == ["f4", "f3"], "batch must be the two oldest", &ids)?;
    for flow in &batch {
        let lease = flow.lease.as_ref().ok_or("returned flow must carry the lease")?;
        expect(lease.runtime_id == "rt-a", "lease holder", &lease.runtime_id)?;
        expect(
            lease.lease_expiry == T0 + LEASE_TIME_MS,
            "lease expiry must be now + lease time",
            lease.lease_expiry,
        )?;
    }

    let rest = fx
        .store
        .next_not_leased("rt-a", 10, &query)
        .await
        .map_err(|e| format!("second next_not_leased: {e}"))?;
    expect(rest.len() == 3, "remaining flows must be leasable", rest.len())
}

async fn next_not_leased_filters_flow_type<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: DataFlowStore,
    F: Fn(Arc<ManualClock>, LeaseConfig) -> Fut,
    Fut: Future<Output = S>,
{
    let fx = fixture(factory).await;
    fx.store
        .create(make_typed_flow("push", DataFlowState::Started, T0, FlowType::Push))
        .await
        .map_err(|e| format!("create push: {e}"))?;
    fx.store
        .create(make_typed_flow("pull", DataFlowState::Started, T0, FlowType::Pull))
        .await
        .map_err(|e| format!("create pull: {e}"))?;

    let query = FlowQuery::in_state(DataFlowState::Started).with_flow_type(FlowType::Push);
    let batch = fx
        .store
        .next_not_leased("rt-a", 10, &query)
        .await
        .map_err(|e| format!("next_not_leased: {e}"))?;
    let ids: Vec<&str> = batch.iter().map(|f| f.id.as_str()).collect();
    expect(ids == ["push"], "only PUSH flows must be returned", &ids)
}

async fn next_not_leased_filters_flows_holding_resources<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: DataFlowStore,
    F: Fn(Arc<ManualClock>, LeaseConfig) -> Fut,
    Fut: Future<Output = S>,
{
    let fx = fixture(factory).await;
    let mut holding = make_flow("holding", DataFlowState::Completed, T0);
    let mut grant = ProvisionResource::new("holding-grant-0", "holding", "Grant");
    grant.state = ProvisionResourceState::Provisioned;
    holding.resources.push(grant);
    let mut released = make_flow("released", DataFlowState::Completed, T0);
    let mut gone = ProvisionResource::new("released-grant-0", "released", "Grant");
    gone.state = ProvisionResourceState::Deprovisioned;
    released.resources.push(gone);
    for flow in [holding, released, make_flow("bare", DataFlowState::Completed, T0)] {
        let id = flow.id.clone();
        fx.store
            .create(flow)
            .await
            .map_err(|e| format!("create {id}: {e}"))?;
    }

    let query = FlowQuery::in_state(DataFlowState::Completed).holding_resources();
    let batch = fx
        .store
        .next_not_leased("rt-a", 10, &query)
        .await
        .map_err(|e| format!("next_not_leased: {e}"))?;
    let ids: Vec<&str> = batch.iter().map(|f| f.id.as_str()).collect();
    expect(ids == ["holding"], "only flows holding resources must be returned", &ids)
}

async fn live_lease_hidden_from_everyone<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let query = FlowQuery::in_state(DataFlowState::Received);
    fx.store
        .next_not_leased("rt-a", 1, &query)
        .await
        .map_err(|e| format!("lease: {e}"))?;

    fx.advance_ms(LEASE_TIME_MS - 1);
    for holder in ["rt-a", "rt-b"] {
        let batch = fx
            .store
            .next_not_leased(holder, 10, &query)
            .await
            .map_err(|e| format!("{holder}: {e}"))?;
        expect(batch.is_empty(), "live lease must hide the flow", batch.len())?;
    }

    fx.advance_ms(1);
    let own = fx
        .store
        .next_not_leased("rt-b", 10, &query)
        .await
        .map_err(|e| format!("rt-b after expiry: {e}"))?;
    expect(
        own.is_empty(),
        "expired lease is not yet abandoned for other runtimes",
        own.len(),
    )?;
    let own = fx
        .store
        .next_not_leased("rt-a", 10, &query)
        .await
        .map_err(|e| format!("rt-a after expiry: {e}"))?;
    expect(own.len() == 1, "holder re-acquires after expiry", own.len())
}

async fn abandoned_lease_reclaimed_by_other_runtime<S, F, Fut>(factory: &F) -> Result<(), String>
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
    fx.store
        .next_not_leased("rt-a", 1, &query)
        .await
        .map_err(|e| format!("lease: {e}"))?;

    let abandon = LEASE_TIME_MS * LEASE_FACTOR as i64;
    fx.advance_ms(abandon - 1);
    let early = fx
        .store
        .next_not_leased("rt-b", 1, &query)
        .await
        .map_err(|e| format!("early reclaim: {e}"))?;
    expect(early.is_empty(), "no reclaim before abandon time", early.len())?;

    fx.advance_ms(1);
    let reclaimed = fx
        .store
        .next_not_leased("rt-b", 1, &query)
        .await
        .map_err(|e| format!("reclaim: {e}"))?;
    let holder = reclaimed
        .first()
        .and_then(|f| f.lease_holder())
        .map(str::to_string);
    expect(
        holder.as_deref() == Some("rt-b"),
        "rt-b must own the reclaimed flow",
        holder,
    )
}

async fn acquire_respects_live_lease_steal_does_not<S, F, Fut>(factory: &F) -> Result<(), String>
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
    fx.store
        .acquire_lease("rt-a", "f1", LeaseMode::Acquire)
        .await
        .map_err(|e| format!("acquire rt-a: {e}"))?;

    match fx
        .store
        .acquire_lease("rt-b", "f1", LeaseMode::Acquire)
        .await
    {
        Err(StorageError::AlreadyLeased { holder, .. }) if holder == "rt-a" => {}
        other => return Err(format!("expected AlreadyLeased by rt-a, got {other:?}")),
    }

    let stolen = fx
        .store
        .acquire_lease("rt-b", "f1", LeaseMode::Steal)
        .await
        .map_err(|e| format!("steal: {e}"))?;
    expect(
        stolen.lease_holder() == Some("rt-b"),
        "steal must transfer the lease",
        stolen.lease_holder(),
    )?;

    match fx
        .store
        .acquire_lease("rt-b", "missing", LeaseMode::Acquire)
        .await
    {
        Err(StorageError::NotFound { .. }) => Ok(()),
        other => Err(format!("expected NotFound, got {other:?}")),
    }
}

async fn renew_requires_holder<S, F, Fut>(factory: &F) -> Result<(), String>
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
    fx.store
        .acquire_lease("rt-a", "f1", LeaseMode::Acquire)
        .await
        .map_err(|e| format!("acquire: {e}"))?;

    fx.advance_ms(LEASE_TIME_MS / 2);
    fx.store
        .renew_lease("rt-a", "f1")
        .await
        .map_err(|e| format!("renew: {e}"))?;
    let renewed = fx
        .store
        .find_by_id("f1")
        .await
        .map_err(|e| format!("find: {e}"))?
        .and_then(|f| f.lease)
        .ok_or("lease missing after renew")?;
    expect(
        renewed.lease_expiry == T0 + LEASE_TIME_MS / 2 + LEASE_TIME_MS,
        "renew must push the expiry",
        renewed.lease_expiry,
    )?;

    match fx.store.renew_lease("rt-b", "f1").await {
        Err(StorageError::LeaseLost { .. }) => Ok(()),
        other => Err(format!("expected LeaseLost for non-holder, got {other:?}")),
    }
}

async fn release_leases_held_by_frees_only_holder<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: DataFlowStore,
    F: Fn(Arc<ManualClock>, LeaseConfig) -> Fut,
    Fut: Future<Output = S>,
{
    let fx = fixture(factory).await;
    for id in ["a1", "a2", "b1"] {
        fx.store
            .create(make_flow(id, DataFlowState::Received, T0))
            .await
            .map_err(|e| format!("create {id}: {e}"))?;
    }
    for (holder, id) in [("rt-a", "a1"), ("rt-a", "a2"), ("rt-b", "b1")] {
        fx.store
            .acquire_lease(holder, id, LeaseMode::Acquire)
            .await
            .map_err(|e| format!("acquire {id}: {e}"))?;
    }

    let released = fx
        .store
        .release_leases_held_by("rt-a")
        .await
        .map_err(|e| format!("release: {e}"))?;
    expect(released == 2, "two leases must be released", released)?;

    // rt-a's flows are immediately available again; rt-b's stay hidden.
    let batch = fx
        .store
        .next_not_leased("rt-c", 10, &FlowQuery::in_state(DataFlowState::Received))
        .await
        .map_err(|e| format!("next_not_leased: {e}"))?;
    let mut ids: Vec<&str> = batch.iter().map(|f| f.id.as_str()).collect();
    ids.sort_unstable();
    expect(ids == ["a1", "a2"], "only released flows are leasable", &ids)?;

    fx.store
        .release_lease("rt-a", "b1")
        .await
        .map_err(|e| format!("foreign release: {e}"))?;
    let b1 = fx
        .store
        .find_by_id("b1")
        .await
        .map_err(|e| format!("find: {e}"))?
        .ok_or("b1 missing")?;
    expect(
        b1.lease_holder() == Some("rt-b"),
        "releasing a foreign lease is a no-op",
        b1.lease_holder(),
    )
}
