//! Conformance test suite for `DataFlowStore` implementations.
//!
//! This module provides a backend-agnostic test suite that any
//! `DataFlowStore` implementation can run to verify correctness. The suite
//! covers:
//!
//! - **Create / read**: insertion, duplicate detection, versioning
//! - **Leasing**: acquire, steal, renew, release, reclaim after expiry and
//!   after abandon time, restart recovery
//! - **Save**: OCC version checks, lease-holder checks, lease retention
//! - **Concurrency**: racing pollers never share a flow, racing writers
//!   never both win
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory that creates
//! a fresh, empty store driven by the given clock and lease settings:
//!
//! ```ignore
//! use ferry_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn postgres_conformance() {
//!     let report = run_conformance_suite(|clock, lease| async move {
//!         create_test_postgres_store(clock, lease).await
//!     }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod concurrent;
mod create;
mod lease;
mod save;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ferry_core::config::LeaseConfig;
use ferry_core::{
    DataAddress, DataFlow, DataFlowStartMessage, DataFlowState, FlowType, ManualClock,
    TransferType,
};

use crate::DataFlowStore;

/// Lease time used by every conformance test.
const LEASE_TIME_MS: i64 = 1_000;
/// Lease factor used by every conformance test (abandon time = 3s).
const LEASE_FACTOR: u32 = 3;
/// Start of the manual clock.
const T0: i64 = 1_700_000_000_000;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "create", "lease", "save").
    pub category: String,
    /// Test name (e.g. "create_assigns_version_1").
    pub name: String,
    /// Whether the test passed.
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        let (passed, message) = match result {
            Ok(()) => (true, None),
            Err(msg) => (false, Some(msg)),
        };
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed,
            message,
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Handle passed to each test: a fresh store plus the clock driving it.
pub(crate) struct Fixture<S> {
    store: Arc<S>,
    clock: Arc<ManualClock>,
}

impl<S> Fixture<S> {
    fn advance_ms(&self, ms: i64) {
        self.clock.advance(Duration::from_millis(ms as u64));
    }
}

async fn fixture<S, F, Fut>(factory: &F) -> Fixture<S>
where
    S: DataFlowStore,
    F: Fn(Arc<ManualClock>, LeaseConfig) -> Fut,
    Fut: Future<Output = S>,
{
    let clock = Arc::new(ManualClock::new(T0));
    let lease = LeaseConfig::new(Duration::from_millis(LEASE_TIME_MS as u64), LEASE_FACTOR);
    Fixture {
        store: Arc::new(factory(clock.clone(), lease).await),
        clock,
    }
}

/// Run the full conformance suite against a store backend.
///
/// The `factory` is called once per test to create a fresh, empty store,
/// ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: DataFlowStore,
    F: Fn(Arc<ManualClock>, LeaseConfig) -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(create::run_create_tests(&factory).await);
    results.extend(lease::run_lease_tests(&factory).await);
    results.extend(save::run_save_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn make_flow(id: &str, state: DataFlowState, state_timestamp: i64) -> DataFlow {
    make_typed_flow(id, state, state_timestamp, FlowType::Push)
}

fn make_typed_flow(
    id: &str,
    state: DataFlowState,
    state_timestamp: i64,
    flow_type: FlowType,
) -> DataFlow {
    let message = DataFlowStartMessage {
        flow_id: Some(id.to_string()),
        process_id: format!("process-{id}"),
        agreement_id: None,
        asset_id: None,
        source: DataAddress::new("Memory").with_property("bucket", "in"),
        destination: Some(DataAddress::new("Memory").with_property("bucket", "out")),
        transfer_type: TransferType::new("Memory", flow_type),
        callback_address: None,
        properties: BTreeMap::new(),
        trace_context: BTreeMap::new(),
    };
    let mut flow = DataFlow::from_start_message(id.to_string(), message, state_timestamp);
    flow.state = state;
    flow
}

fn expect<T: fmt::Debug>(cond: bool, what: &str, actual: T) -> Result<(), String> {
    if cond {
        Ok(())
    } else {
        Err(format!("{what} (got {actual:?})"))
    }
}
