//! The data-flow scheduler.
//!
//! One loop per runtime polls the store for flows in actionable states,
//! leases a batch of each and hands every flow to its state handler on a
//! tracked task. Handlers never return errors: they turn provisioner and
//! transfer outcomes into transitions and persist them with an optimistic
//! save. A save that loses to another writer is discarded.
//!
//! ```text
//! RECEIVED -> PROVISIONING -> PROVISIONED -> STARTED -> COMPLETED  -> DEPROVISIONING -> DEPROVISIONED
//!                                              |  ^   -> TERMINATED ->
//!                                              v  |
//!                                            SUSPENDED
//! ```

mod handlers;
mod signals;
mod transfer;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ferry_core::{
    Clock, DataFlow, DataFlowState, ExponentialWaitStrategy, FerryConfig, FlowType, LeaseConfig,
    RetryBackoff, SystemClock, WaitStrategy,
};
use ferry_pipeline::{TransferService, TransferServiceRegistry};
use ferry_storage::{DataFlowStore, FlowQuery, SaveMode, StorageError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::auth::AuthorizationService;
use crate::client::{ControlPlaneClient, NoopControlPlaneClient, TransferProcessEvent};
use crate::error::ManagerError;
use crate::provision::{
    Provisioner, ProvisionerManager, ResourceDefinitionGenerator,
    ResourceDefinitionGeneratorManager,
};

// ──────────────────────────────────────────────
// Settings
// ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub runtime_id: String,
    /// Flows leased per actionable state per tick.
    pub batch_size: usize,
    pub iteration_wait: Duration,
    pub max_iteration_wait: Duration,
    /// Failed attempts tolerated per state; the flow gets `limit + 1` tries.
    pub send_retry_limit: u32,
    pub backoff: RetryBackoff,
    pub lease: LeaseConfig,
}

impl ManagerSettings {
    pub fn from_config(config: &FerryConfig) -> Self {
        ManagerSettings {
            runtime_id: config.runtime_id.clone(),
            batch_size: config.state_machine.batch_size,
            iteration_wait: config.state_machine.iteration_wait(),
            max_iteration_wait: config.state_machine.max_iteration_wait(),
            send_retry_limit: config.retry.send_retry_limit,
            backoff: config.retry.backoff(),
            lease: config.lease,
        }
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.lease.lease_time() / 2).max(Duration::from_millis(1))
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&FerryConfig::default())
    }
}

// ──────────────────────────────────────────────
// Builder
// ──────────────────────────────────────────────

/// Wires a [`DataFlowManager`]. Every registry is frozen by [`build`].
///
/// [`build`]: DataFlowManagerBuilder::build
pub struct DataFlowManagerBuilder {
    settings: ManagerSettings,
    store: Arc<dyn DataFlowStore>,
    registry: TransferServiceRegistry,
    generators: ResourceDefinitionGeneratorManager,
    provisioners: ProvisionerManager,
    authorization: Option<Arc<AuthorizationService>>,
    client: Arc<dyn ControlPlaneClient>,
    clock: Arc<dyn Clock>,
}

impl DataFlowManagerBuilder {
    pub fn new(settings: ManagerSettings, store: Arc<dyn DataFlowStore>) -> Self {
        DataFlowManagerBuilder {
            settings,
            store,
            registry: TransferServiceRegistry::new(),
            generators: ResourceDefinitionGeneratorManager::new(),
            provisioners: ProvisionerManager::new(),
            authorization: None,
            client: Arc::new(NoopControlPlaneClient),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the registry (and with it the selection strategy).
    pub fn registry(mut self, registry: TransferServiceRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn transfer_service(mut self, service: Arc<dyn TransferService>) -> Self {
        self.registry.register(service);
        self
    }

    pub fn consumer_generator(mut self, generator: Arc<dyn ResourceDefinitionGenerator>) -> Self {
        self.generators.register_consumer_generator(generator);
        self
    }

    pub fn provider_generator(mut self, generator: Arc<dyn ResourceDefinitionGenerator>) -> Self {
        self.generators.register_provider_generator(generator);
        self
    }

    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioners.register(provisioner);
        self
    }

    /// Required for PULL flows.
    pub fn authorization(mut self, authorization: Arc<AuthorizationService>) -> Self {
        self.authorization = Some(authorization);
        self
    }

    pub fn client(mut self, client: Arc<dyn ControlPlaneClient>) -> Self {
        self.client = client;
        self
    }

    /// Must be the clock the store uses.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> DataFlowManager {
        let wait = ExponentialWaitStrategy::new(
            self.settings.iteration_wait,
            self.settings.max_iteration_wait,
        );
        DataFlowManager {
            inner: Arc::new(Inner {
                settings: self.settings,
                store: self.store,
                registry: self.registry,
                generators: self.generators,
                provisioners: self.provisioners,
                authorization: self.authorization,
                client: self.client,
                clock: self.clock,
                wait,
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                loop_handle: Mutex::new(None),
                handling: Mutex::new(HashSet::new()),
                transfers: Mutex::new(HashMap::new()),
                tickets: std::sync::atomic::AtomicU64::new(0),
            }),
        }
    }
}

// ──────────────────────────────────────────────
// Manager
// ──────────────────────────────────────────────

/// Cheap to clone; every clone drives the same runtime.
#[derive(Clone)]
pub struct DataFlowManager {
    inner: Arc<Inner>,
}

struct Inner {
    settings: ManagerSettings,
    store: Arc<dyn DataFlowStore>,
    registry: TransferServiceRegistry,
    generators: ResourceDefinitionGeneratorManager,
    provisioners: ProvisionerManager,
    authorization: Option<Arc<AuthorizationService>>,
    client: Arc<dyn ControlPlaneClient>,
    clock: Arc<dyn Clock>,
    wait: ExponentialWaitStrategy,
    /// Handler and transfer tasks.
    tasks: TaskTracker,
    shutdown: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    /// Flows whose handler is running on this runtime.
    handling: Mutex<HashSet<String>>,
    /// PUSH transfers running on this runtime, tagged with a ticket so a
    /// finished run never unregisters its successor.
    transfers: Mutex<HashMap<String, (u64, CancellationToken)>>,
    tickets: std::sync::atomic::AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Terminal outcome handed to [`DataFlowManager::finish`].
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Completed,
    Terminated(String),
}

/// COMPLETED and TERMINATED flows are only picked up while they still hold
/// resources, i.e. when their owner stopped between the outcome and the
/// hand-off to deprovisioning.
fn actionable_queries() -> [FlowQuery; 7] {
    [
        FlowQuery::in_state(DataFlowState::Received),
        FlowQuery::in_state(DataFlowState::Provisioning),
        FlowQuery::in_state(DataFlowState::Provisioned),
        FlowQuery::in_state(DataFlowState::Started).with_flow_type(FlowType::Push),
        FlowQuery::in_state(DataFlowState::Completed).holding_resources(),
        FlowQuery::in_state(DataFlowState::Terminated).holding_resources(),
        FlowQuery::in_state(DataFlowState::Deprovisioning),
    ]
}

impl DataFlowManager {
    pub fn builder(settings: ManagerSettings, store: Arc<dyn DataFlowStore>) -> DataFlowManagerBuilder {
        DataFlowManagerBuilder::new(settings, store)
    }

    pub fn runtime_id(&self) -> &str {
        &self.inner.settings.runtime_id
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> &Arc<dyn DataFlowStore> {
        &self.inner.store
    }

    pub fn authorization(&self) -> Option<&Arc<AuthorizationService>> {
        self.inner.authorization.as_ref()
    }

    fn now(&self) -> i64 {
        self.inner.clock.now_millis()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Release leases left over from a previous incarnation of this runtime
    /// and start the polling loop.
    pub async fn start(&self) -> Result<(), ManagerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ManagerError::ShutDown);
        }
        let released = self
            .inner
            .store
            .release_leases_held_by(self.runtime_id())
            .await?;
        info!(runtime_id = %self.runtime_id(), released, "data flow manager starting");

        let manager = self.clone();
        let handle = tokio::spawn(async move { manager.run_loop().await });
        if let Some(previous) = lock(&self.inner.loop_handle).replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn run_loop(&self) {
        let wait = &self.inner.wait;
        loop {
            let delay = match self.tick().await {
                Ok(0) => {
                    wait.success();
                    wait.wait_for()
                }
                Ok(_) => {
                    wait.success();
                    Duration::ZERO
                }
                Err(e) => {
                    wait.failure();
                    let delay = wait.wait_for();
                    warn!(runtime_id = %self.runtime_id(), error = %e, ?delay, "tick failed");
                    delay
                }
            };
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(runtime_id = %self.runtime_id(), "loop stopped");
    }

    /// One scheduler iteration. Returns how many flows were dispatched.
    ///
    /// Handlers run in the background; use [`drain`](Self::drain) to wait for
    /// them.
    pub async fn tick(&self) -> Result<usize, StorageError> {
        let settings = &self.inner.settings;
        if let Some(auth) = &self.inner.authorization {
            auth.purge_expired();
        }
        let mut dispatched = 0;
        for query in actionable_queries() {
            if self.inner.shutdown.is_cancelled() {
                break;
            }
            let flows = self
                .inner
                .store
                .next_not_leased(&settings.runtime_id, settings.batch_size, &query)
                .await?;
            for flow in flows {
                if self.is_busy(&flow.id) {
                    continue;
                }
                if settings
                    .backoff
                    .should_delay(flow.state_count, flow.state_timestamp, self.now())
                {
                    self.inner
                        .store
                        .release_lease(&settings.runtime_id, &flow.id)
                        .await?;
                    continue;
                }
                self.dispatch(flow);
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    fn is_busy(&self, flow_id: &str) -> bool {
        lock(&self.inner.handling).contains(flow_id) || lock(&self.inner.transfers).contains_key(flow_id)
    }

    fn dispatch(&self, flow: DataFlow) {
        lock(&self.inner.handling).insert(flow.id.clone());
        let span = flow_span(&flow);
        let manager = self.clone();
        self.inner.tasks.spawn(
            async move {
                let _guard = HandlingGuard {
                    manager: &manager,
                    flow_id: flow.id.clone(),
                };
                manager.handle(flow).await;
            }
            .instrument(span),
        );
    }

    /// Wait until every handler and transfer started so far has finished.
    pub async fn drain(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    /// Stop the loop, cancel local transfers and give up this runtime's
    /// leases so other runtimes can take over immediately.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        self.inner.shutdown.cancel();
        let handle = lock(&self.inner.loop_handle).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.registry.close_all().await;
        let released = self
            .inner
            .store
            .release_leases_held_by(self.runtime_id())
            .await?;
        info!(runtime_id = %self.runtime_id(), released, "data flow manager stopped");
        Ok(())
    }

    // ── Persistence helpers ───────────────────────────────────────────────

    /// Save and refresh `flow.version`.
    pub(crate) async fn save(&self, flow: &mut DataFlow, mode: SaveMode) -> Result<(), StorageError> {
        let version = self
            .inner
            .store
            .save(self.runtime_id(), flow, mode)
            .await?;
        flow.version = version;
        flow.runtime_id = Some(self.runtime_id().to_string());
        Ok(())
    }

    /// Save from a handler. Returns `false` when the outcome was discarded.
    pub(crate) async fn persist(&self, flow: &mut DataFlow, mode: SaveMode) -> bool {
        match self.save(flow, mode).await {
            Ok(()) => {
                debug!(flow_id = %flow.id, state = %flow.state, version = flow.version, "saved");
                true
            }
            Err(e) if e.is_stale_write() => {
                debug!(flow_id = %flow.id, error = %e, "flow moved on, outcome discarded");
                false
            }
            Err(e) => {
                warn!(flow_id = %flow.id, error = %e, "save failed");
                false
            }
        }
    }

    pub(crate) async fn release(&self, flow_id: &str) {
        if let Err(e) = self.inner.store.release_lease(self.runtime_id(), flow_id).await {
            warn!(flow_id, error = %e, "lease release failed");
        }
    }

    pub(crate) async fn notify(&self, flow: &DataFlow, event: TransferProcessEvent) {
        if let Err(e) = self.inner.client.notify(flow, event).await {
            warn!(flow_id = %flow.id, %event, error = %e, "control plane notification failed");
        }
    }

    fn revoke_tokens(&self, flow: &DataFlow, reason: &str) {
        if flow.flow_type == FlowType::Pull {
            if let Some(auth) = &self.inner.authorization {
                auth.revoke(&flow.id, reason);
            }
        }
    }

    /// Move to COMPLETED or TERMINATED and, if the flow holds resources, on
    /// to DEPROVISIONING. The control plane is told once both are persisted.
    pub(crate) async fn finish(&self, flow: &mut DataFlow, outcome: Outcome) -> Result<(), StorageError> {
        let now = self.now();
        let state = match &outcome {
            Outcome::Completed => DataFlowState::Completed,
            Outcome::Terminated(_) => DataFlowState::Terminated,
        };
        if let Err(e) = flow.transition_to(state, now) {
            warn!(flow_id = %flow.id, error = %e, "cannot finish flow");
            return Ok(());
        }
        if let Outcome::Terminated(detail) = outcome {
            flow.error_detail = Some(detail);
        }

        let deprovision = flow.has_provisioned_resources();
        let mode = if deprovision {
            SaveMode::RetainLease
        } else {
            SaveMode::ReleaseLease
        };
        self.save(flow, mode).await?;
        match &flow.error_detail {
            Some(detail) if state == DataFlowState::Terminated => {
                info!(flow_id = %flow.id, error = %detail, "flow terminated");
            }
            _ => info!(flow_id = %flow.id, state = %flow.state, "flow finished"),
        }

        let finished = flow.clone();
        if deprovision {
            self.hand_off_to_deprovisioning(flow).await?;
        }
        self.announce_outcome(&finished).await;
        Ok(())
    }

    async fn hand_off_to_deprovisioning(&self, flow: &mut DataFlow) -> Result<(), StorageError> {
        if let Err(e) = flow.transition_to(DataFlowState::Deprovisioning, self.now()) {
            warn!(flow_id = %flow.id, error = %e, "cannot hand off to deprovisioning");
            return Ok(());
        }
        self.save(flow, SaveMode::ReleaseLease).await
    }

    /// Revoke PULL tokens and send `completed` / `failed` for a flow in
    /// COMPLETED or TERMINATED.
    async fn announce_outcome(&self, flow: &DataFlow) {
        let (event, reason) = if flow.state == DataFlowState::Completed {
            (TransferProcessEvent::Completed, "completed")
        } else {
            (TransferProcessEvent::Failed, "terminated")
        };
        self.revoke_tokens(flow, reason);
        self.notify(flow, event).await;
    }

    /// A COMPLETED or TERMINATED flow found still holding resources: its
    /// owner stopped before deprovisioning took over. The outcome may not
    /// have been announced, so it is sent again.
    pub(crate) async fn recover_finished(&self, mut flow: DataFlow) {
        let finished = flow.clone();
        info!(flow_id = %flow.id, state = %flow.state, "resuming deprovisioning of a finished flow");
        match self.hand_off_to_deprovisioning(&mut flow).await {
            Ok(()) => self.announce_outcome(&finished).await,
            Err(e) if e.is_stale_write() => {
                debug!(flow_id = %flow.id, error = %e, "flow moved on, outcome discarded");
            }
            Err(e) => {
                warn!(flow_id = %flow.id, error = %e, "save failed");
                self.release(&flow.id).await;
            }
        }
    }

    /// [`finish`](Self::finish) from a handler: a lost save is discarded.
    pub(crate) async fn finish_or_discard(&self, mut flow: DataFlow, outcome: Outcome) {
        if let Err(e) = self.finish(&mut flow, outcome).await {
            if e.is_stale_write() {
                debug!(flow_id = %flow.id, error = %e, "flow moved on, outcome discarded");
            } else {
                warn!(flow_id = %flow.id, error = %e, "save failed");
            }
        }
    }

    // ── Read API ──────────────────────────────────────────────────────────

    pub async fn status(&self, flow_id: &str) -> Result<DataFlow, ManagerError> {
        self.inner
            .store
            .find_by_id(flow_id)
            .await?
            .ok_or_else(|| ManagerError::NotFound(flow_id.to_string()))
    }

    pub async fn list(
        &self,
        state: Option<DataFlowState>,
        limit: usize,
    ) -> Result<Vec<DataFlow>, ManagerError> {
        Ok(self.inner.store.query(state, limit).await?)
    }
}

impl std::fmt::Debug for DataFlowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFlowManager")
            .field("runtime_id", &self.inner.settings.runtime_id)
            .field("running_transfers", &lock(&self.inner.transfers).len())
            .finish_non_exhaustive()
    }
}

pub(crate) fn flow_span(flow: &DataFlow) -> tracing::Span {
    info_span!(
        "dataflow",
        flow_id = %flow.id,
        process_id = %flow.process_id,
        state = %flow.state,
        trace = ?flow.trace_context,
    )
}

/// Clears the handling mark even if the handler panics.
struct HandlingGuard<'a> {
    manager: &'a DataFlowManager,
    flow_id: String,
}

impl Drop for HandlingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.manager.inner.handling).remove(&self.flow_id);
    }
}
