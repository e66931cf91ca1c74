//! Transfer services and their registry.

use std::sync::Arc;

use async_trait::async_trait;
use ferry_core::{DataFlow, StatusResult, StreamResult};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What a finished transfer moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub parts: usize,
    pub bytes: u64,
}

impl TransferSummary {
    pub(crate) fn record(&mut self, bytes: u64) {
        self.parts += 1;
        self.bytes += bytes;
    }
}

/// Executes the transfer of a [`DataFlow`].
#[async_trait]
pub trait TransferService: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this service supports the flow's source and destination.
    fn can_handle(&self, flow: &DataFlow) -> bool;

    /// Check the flow before any state change. A failure here is never
    /// retried.
    fn validate(&self, flow: &DataFlow) -> StatusResult<()>;

    /// Run the transfer to completion, or until `cancel` fires. `cancel`
    /// stops this run only, never a later run of the same flow.
    async fn transfer(
        &self,
        flow: &DataFlow,
        cancel: &CancellationToken,
    ) -> StreamResult<TransferSummary>;

    /// Cancel whatever transfer of `flow_id` is in flight. Returns whether
    /// one was running.
    async fn terminate(&self, flow_id: &str) -> bool;

    /// Cancel everything and refuse new transfers.
    async fn close_all(&self);
}

/// Picks one service among those that can handle a flow.
pub trait TransferServiceSelectionStrategy: Send + Sync {
    fn select(
        &self,
        flow: &DataFlow,
        candidates: Vec<Arc<dyn TransferService>>,
    ) -> Option<Arc<dyn TransferService>>;
}

/// Selects the first registered candidate.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstMatch;

impl TransferServiceSelectionStrategy for FirstMatch {
    fn select(
        &self,
        _flow: &DataFlow,
        candidates: Vec<Arc<dyn TransferService>>,
    ) -> Option<Arc<dyn TransferService>> {
        candidates.into_iter().next()
    }
}

/// Registry of transfer services, populated at startup.
pub struct TransferServiceRegistry {
    services: Vec<Arc<dyn TransferService>>,
    strategy: Box<dyn TransferServiceSelectionStrategy>,
}

impl Default for TransferServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferServiceRegistry {
    pub fn new() -> Self {
        Self::with_strategy(Box::new(FirstMatch))
    }

    pub fn with_strategy(strategy: Box<dyn TransferServiceSelectionStrategy>) -> Self {
        TransferServiceRegistry {
            services: Vec::new(),
            strategy,
        }
    }

    pub fn register(&mut self, service: Arc<dyn TransferService>) {
        debug!(service = service.name(), "registered transfer service");
        self.services.push(service);
    }

    /// The service that should run `flow`, if any can.
    pub fn resolve(&self, flow: &DataFlow) -> Option<Arc<dyn TransferService>> {
        let candidates: Vec<_> = self
            .services
            .iter()
            .filter(|s| s.can_handle(flow))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return None;
        }
        self.strategy.select(flow, candidates)
    }

    pub fn services(&self) -> &[Arc<dyn TransferService>] {
        &self.services
    }

    /// Cancel a flow's transfer on whichever service runs it.
    pub async fn terminate(&self, flow_id: &str) -> bool {
        let mut found = false;
        for service in &self.services {
            found |= service.terminate(flow_id).await;
        }
        found
    }

    pub async fn close_all(&self) {
        for service in &self.services {
            service.close_all().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::{DataAddress, DataFlowStartMessage, FlowType, TransferType};
    use std::collections::BTreeMap;

    struct Named {
        name: &'static str,
        accepts: &'static str,
    }

    #[async_trait]
    impl TransferService for Named {
        fn name(&self) -> &str {
            self.name
        }
        fn can_handle(&self, flow: &DataFlow) -> bool {
            flow.destination.address_type == self.accepts
        }
        fn validate(&self, _flow: &DataFlow) -> StatusResult<()> {
            Ok(())
        }
        async fn transfer(
            &self,
            _flow: &DataFlow,
            _cancel: &CancellationToken,
        ) -> StreamResult<TransferSummary> {
            Ok(TransferSummary::default())
        }
        async fn terminate(&self, _flow_id: &str) -> bool {
            false
        }
        async fn close_all(&self) {}
    }

    struct LastMatch;

    impl TransferServiceSelectionStrategy for LastMatch {
        fn select(
            &self,
            _flow: &DataFlow,
            candidates: Vec<Arc<dyn TransferService>>,
        ) -> Option<Arc<dyn TransferService>> {
            candidates.into_iter().last()
        }
    }

    fn flow(destination: &str) -> DataFlow {
        DataFlow::from_start_message(
            "f1".into(),
            DataFlowStartMessage {
                flow_id: None,
                process_id: "p".into(),
                agreement_id: None,
                asset_id: None,
                source: DataAddress::new("Memory"),
                destination: None,
                transfer_type: TransferType::new(destination, FlowType::Push),
                callback_address: None,
                properties: BTreeMap::new(),
                trace_context: BTreeMap::new(),
            },
            0,
        )
    }

    fn registry(strategy: Box<dyn TransferServiceSelectionStrategy>) -> TransferServiceRegistry {
        let mut registry = TransferServiceRegistry::with_strategy(strategy);
        for (name, accepts) in [("a", "File"), ("b", "Memory"), ("c", "Memory")] {
            registry.register(Arc::new(Named { name, accepts }));
        }
        registry
    }

    #[test]
    fn first_match_picks_first_capable_service() {
        let registry = registry(Box::new(FirstMatch));
        let service = registry.resolve(&flow("Memory")).unwrap();
        assert_eq!(service.name(), "b");
    }

    #[test]
    fn custom_strategy_sees_only_capable_services() {
        let registry = registry(Box::new(LastMatch));
        assert_eq!(registry.resolve(&flow("Memory")).unwrap().name(), "c");
        assert_eq!(registry.resolve(&flow("File")).unwrap().name(), "a");
    }

    #[test]
    fn no_capable_service_resolves_to_none() {
        let registry = registry(Box::new(FirstMatch));
        assert!(registry.resolve(&flow("Kafka")).is_none());
    }
}
