use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use ferry_core::config::LeaseConfig;
use ferry_core::{DataFlowState, ManualClock};

use super::{expect, fixture, make_flow, TestResult, T0};
use crate::{DataFlowStore, FlowQuery, LeaseMode, SaveMode, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: DataFlowStore,
    F: Fn(Arc<ManualClock>, LeaseConfig) -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "concurrent",
            "concurrent_pollers_never_share_a_flow",
            concurrent_pollers_never_share_a_flow(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_acquire_exactly_one_wins",
            concurrent_acquire_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_saves_exactly_one_wins",
            concurrent_saves_exactly_one_wins(factory).await,
        ),
    ]
}

// ── Pollers: no flow handed out twice ────────────────────────────────────────

/// N runtimes poll the same state with a small batch size until the store is
/// drained. Every flow must be handed out exactly once.
async fn concurrent_pollers_never_share_a_flow<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: DataFlowStore,
    F: Fn(Arc<ManualClock>, LeaseConfig) -> Fut,
    Fut: Future<Output = S>,
{
    let fx = fixture(factory).await;
    let total = N * 5;
    for i in 0..total {
        fx.store
            .create(make_flow(&format!("f{i}"), DataFlowState::Received, T0))
            .await
            .map_err(|e| format!("create f{i}: {e}"))?;
    }

    let mut handles = Vec::new();
    for i in 0..N {
        let s = fx.store.clone();
        handles.push(tokio::spawn(async move {
            let holder = format!("rt-{i}");
            let query = FlowQuery::in_state(DataFlowState::Received);
            let mut mine = Vec::new();
            loop {
                let batch = s.next_not_leased(&holder, 3, &query).await?;
                if batch.is_empty() {
                    break;
                }
                mine.extend(batch.into_iter().map(|f| f.id));
                tokio::task::yield_now().await;
            }
            Ok::<_, StorageError>(mine)
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let ids = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
        for id in ids {
            if !seen.insert(id.clone()) {
                return Err(format!("flow {id} was leased by two runtimes"));
            }
        }
    }
    expect(seen.len() == total, "every flow must be handed out", seen.len())
}

// ── Single flow acquire: exactly one wins ────────────────────────────────────

async fn concurrent_acquire_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
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

    let mut handles = Vec::new();
    for i in 0..N {
        let s = fx.store.clone();
        handles.push(tokio::spawn(async move {
            match s
                .acquire_lease(&format!("rt-{i}"), "f1", LeaseMode::Acquire)
                .await
            {
                Ok(_) => Ok(true),
                Err(StorageError::AlreadyLeased { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }
    expect(winners == 1, "expected exactly 1 lease winner", winners)
}

// ── Racing writers: exactly one save wins ────────────────────────────────────

/// N tasks of the same runtime hold copies of one flow at the same version
/// and try to save different outcomes. Exactly one save is accepted; the
/// rest are stale writes.
async fn concurrent_saves_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let leased = fx
        .store
        .acquire_lease("rt-a", "f1", LeaseMode::Acquire)
        .await
        .map_err(|e| format!("acquire: {e}"))?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = fx.store.clone();
        let mut copy = leased.clone();
        handles.push(tokio::spawn(async move {
            copy.record_retry(T0 + i as i64);
            match s.save("rt-a", &copy, SaveMode::RetainLease).await {
                Ok(_) => Ok(true),
                Err(e) if e.is_stale_write() => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }
    expect(winners == 1, "expected exactly 1 accepted save", winners)?;

    let stored = fx
        .store
        .find_by_id("f1")
        .await
        .map_err(|e| format!("find: {e}"))?
        .ok_or("flow missing")?;
    expect(
        stored.version == 2 && stored.state_count == 1,
        "final flow must reflect exactly one write",
        (stored.version, stored.state_count),
    )
}
