//! The built-in [`TransferService`]: factories + bounded transfer pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use ferry_core::{DataAddress, DataFlow, StatusResult, StreamFailure, StreamResult};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::file::{FileSinkFactory, FileSourceFactory};
use crate::http::{HttpDataSinkFactory, HttpDataSourceFactory};
use crate::memory::{MemorySinkFactory, MemorySourceFactory, MemoryStore};
use crate::sink::{transfer_parts, DataSinkFactory};
use crate::source::{DataSource, DataSourceFactory};
use crate::transfer::{TransferService, TransferSummary};

/// Streams data from a source to a sink for each flow.
///
/// Source and sink factories are registered at startup, before the service
/// is shared. At most `transfer_threads` transfers run at once, regardless
/// of how many flows the scheduler dispatches.
pub struct PipelineService {
    sources: HashMap<String, Arc<dyn DataSourceFactory>>,
    sinks: HashMap<String, Arc<dyn DataSinkFactory>>,
    pool: Arc<Semaphore>,
    sink_parallelism: usize,
    /// Cancellation hooks of in-flight transfers, keyed by flow id and
    /// tagged with a ticket so a finished run never removes its successor.
    active: Mutex<HashMap<String, (u64, CancellationToken)>>,
    tickets: AtomicU64,
    shutdown: CancellationToken,
}

impl PipelineService {
    pub fn new(transfer_threads: usize, sink_parallelism: usize) -> Self {
        PipelineService {
            sources: HashMap::new(),
            sinks: HashMap::new(),
            pool: Arc::new(Semaphore::new(transfer_threads.max(1))),
            sink_parallelism: sink_parallelism.max(1),
            active: Mutex::new(HashMap::new()),
            tickets: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// A pipeline with every built-in source and sink (`File`, `HttpData`,
    /// `Memory` backed by `memory`).
    pub fn with_defaults(
        transfer_threads: usize,
        sink_parallelism: usize,
        memory: MemoryStore,
    ) -> Self {
        let mut pipeline = Self::new(transfer_threads, sink_parallelism);
        pipeline.register_source_factory(Arc::new(FileSourceFactory));
        pipeline.register_sink_factory(Arc::new(FileSinkFactory));
        pipeline.register_source_factory(Arc::new(HttpDataSourceFactory::default()));
        pipeline.register_sink_factory(Arc::new(HttpDataSinkFactory::default()));
        pipeline.register_source_factory(Arc::new(MemorySourceFactory::new(memory.clone())));
        pipeline.register_sink_factory(Arc::new(MemorySinkFactory::new(memory)));
        pipeline
    }

    pub fn register_source_factory(&mut self, factory: Arc<dyn DataSourceFactory>) {
        self.sources
            .insert(factory.supported_type().to_string(), factory);
    }

    pub fn register_sink_factory(&mut self, factory: Arc<dyn DataSinkFactory>) {
        self.sinks.insert(factory.supported_type().to_string(), factory);
    }

    pub fn supported_source_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.sources.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn supported_sink_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.sinks.keys().cloned().collect();
        types.sort();
        types
    }

    fn source_factory(&self, address: &DataAddress) -> Result<&Arc<dyn DataSourceFactory>, PipelineError> {
        self.sources
            .get(&address.address_type)
            .ok_or_else(|| PipelineError::UnknownSourceType(address.address_type.clone()))
    }

    fn sink_factory(&self, address: &DataAddress) -> Result<&Arc<dyn DataSinkFactory>, PipelineError> {
        self.sinks
            .get(&address.address_type)
            .ok_or_else(|| PipelineError::UnknownSinkType(address.address_type.clone()))
    }

    /// Check that both ends of `flow` are supported and well-formed.
    pub fn validate_flow(&self, flow: &DataFlow) -> Result<(), PipelineError> {
        self.source_factory(&flow.source)?.validate(&flow.source)?;
        self.sink_factory(&flow.destination)?
            .validate(&flow.destination)
    }

    /// Open a source directly. Used to serve PULL transfers.
    pub async fn open_source(&self, address: &DataAddress) -> StreamResult<Box<dyn DataSource>> {
        let factory = self.source_factory(address)?;
        factory.validate(address)?;
        factory.create_source(address).await
    }

    /// Run the transfer of `flow` on the pool. Firing `cancel` winds down
    /// this run the same way [`PipelineService::cancel`] does.
    pub async fn run(
        &self,
        flow: &DataFlow,
        cancel: &CancellationToken,
    ) -> StreamResult<TransferSummary> {
        self.validate_flow(flow)?;
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::Closed.into());
        }
        let (ticket, token) = self.register(&flow.id)?;
        let run = self.run_registered(flow, &token);
        tokio::pin!(run);
        let result = tokio::select! {
            result = &mut run => result,
            _ = cancel.cancelled() => {
                token.cancel();
                run.await
            }
        };
        self.unregister(&flow.id, ticket);
        result
    }

    async fn run_registered(
        &self,
        flow: &DataFlow,
        cancel: &CancellationToken,
    ) -> StreamResult<TransferSummary> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamFailure::cancelled("transfer cancelled before start")),
            permit = self.pool.clone().acquire_owned() => permit
                .map_err(|_| StreamFailure::from(PipelineError::Closed))?,
        };

        debug!(flow_id = %flow.id, source = %flow.source, destination = %flow.destination, "transfer starting");
        let mut source = self.source_factory(&flow.source)?.create_source(&flow.source).await?;
        let sink = self
            .sink_factory(&flow.destination)?
            .create_sink(&flow.destination)
            .await?;
        let summary = transfer_parts(source.as_mut(), sink, self.sink_parallelism, cancel).await?;
        info!(flow_id = %flow.id, parts = summary.parts, bytes = summary.bytes, "transfer finished");
        Ok(summary)
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, (u64, CancellationToken)>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, flow_id: &str) -> StreamResult<(u64, CancellationToken)> {
        let mut active = self.active();
        if active.contains_key(flow_id) {
            return Err(StreamFailure::general(format!(
                "a transfer for flow {flow_id} is already running"
            )));
        }
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        active.insert(flow_id.to_string(), (ticket, token.clone()));
        Ok((ticket, token))
    }

    fn unregister(&self, flow_id: &str, ticket: u64) {
        let mut active = self.active();
        if active.get(flow_id).is_some_and(|(t, _)| *t == ticket) {
            active.remove(flow_id);
        }
    }

    /// Cancel the in-flight transfer of `flow_id`.
    pub fn cancel(&self, flow_id: &str) -> bool {
        match self.active().remove(flow_id) {
            Some((_, token)) => {
                token.cancel();
                debug!(flow_id, "transfer cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every transfer and refuse new ones.
    pub fn close(&self) {
        let cancelled = self.active().len();
        self.shutdown.cancel();
        self.pool.close();
        self.active().clear();
        if cancelled > 0 {
            warn!(cancelled, "pipeline closed with transfers in flight");
        }
    }

    pub fn running(&self) -> usize {
        self.active().len()
    }
}

#[async_trait]
impl TransferService for PipelineService {
    fn name(&self) -> &str {
        "pipeline"
    }

    fn can_handle(&self, flow: &DataFlow) -> bool {
        self.sources.contains_key(&flow.source.address_type)
            && self.sinks.contains_key(&flow.destination.address_type)
    }

    fn validate(&self, flow: &DataFlow) -> StatusResult<()> {
        self.validate_flow(flow).map_err(Into::into)
    }

    async fn transfer(
        &self,
        flow: &DataFlow,
        cancel: &CancellationToken,
    ) -> StreamResult<TransferSummary> {
        self.run(flow, cancel).await
    }

    async fn terminate(&self, flow_id: &str) -> bool {
        self.cancel(flow_id)
    }

    async fn close_all(&self) {
        self.close();
    }
}
