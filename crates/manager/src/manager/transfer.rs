//! Background PUSH transfers with a lease heartbeat.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ferry_core::{DataFlow, FailureReason, StreamResult};
use ferry_pipeline::{TransferService, TransferSummary};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::{flow_span, lock, DataFlowManager, Outcome};

enum Supervised {
    Finished(StreamResult<TransferSummary>),
    /// Cancelled locally (signal or shutdown).
    Cancelled,
    /// The heartbeat could not renew the lease.
    LeaseLost,
}

impl DataFlowManager {
    /// Run `flow`'s transfer on a tracked task. `flow` must already be saved
    /// as STARTED with this runtime's lease retained.
    pub(super) fn launch_transfer(&self, flow: DataFlow, service: Arc<dyn TransferService>) {
        let cancel = self.inner.shutdown.child_token();
        let ticket = self.inner.tickets.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.transfers).insert(flow.id.clone(), (ticket, cancel.clone()));

        let span = flow_span(&flow);
        let manager = self.clone();
        self.inner.tasks.spawn(
            async move {
                let outcome = manager.supervise(&flow, service.as_ref(), &cancel).await;
                manager.unregister_transfer(&flow.id, ticket);
                match outcome {
                    Supervised::Finished(result) => manager.transfer_finished(flow, result).await,
                    Supervised::Cancelled => debug!("transfer cancelled, outcome discarded"),
                    Supervised::LeaseLost => warn!("lease lost during transfer, outcome discarded"),
                }
            }
            .instrument(span),
        );
    }

    async fn supervise(
        &self,
        flow: &DataFlow,
        service: &dyn TransferService,
        cancel: &CancellationToken,
    ) -> Supervised {
        let transfer = service.transfer(flow, cancel);
        tokio::pin!(transfer);

        let mut heartbeat = tokio::time::interval(self.inner.settings.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let stopped = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Supervised::Cancelled,
                result = &mut transfer => return Supervised::Finished(result),
                _ = heartbeat.tick() => {
                    if let Err(e) = self.inner.store.renew_lease(self.runtime_id(), &flow.id).await {
                        warn!(error = %e, "lease renewal failed");
                        break Supervised::LeaseLost;
                    }
                }
            }
        };

        // The service stops this run on `cancel`; give it time to release
        // its own bookkeeping.
        cancel.cancel();
        let grace = self.inner.settings.lease.lease_time();
        if tokio::time::timeout(grace, &mut transfer).await.is_err() {
            warn!(?grace, "transfer ignored cancellation");
        }
        stopped
    }

    fn unregister_transfer(&self, flow_id: &str, ticket: u64) {
        let mut transfers = lock(&self.inner.transfers);
        if transfers.get(flow_id).is_some_and(|(t, _)| *t == ticket) {
            transfers.remove(flow_id);
        }
    }

    /// Cancel the local transfer of `flow_id`, if any.
    pub(super) fn cancel_transfer(&self, flow_id: &str) -> bool {
        match lock(&self.inner.transfers).remove(flow_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn transfer_finished(&self, flow: DataFlow, result: StreamResult<TransferSummary>) {
        match result {
            Ok(summary) => {
                info!(parts = summary.parts, bytes = summary.bytes, "transfer completed");
                self.finish_or_discard(flow, Outcome::Completed).await;
            }
            Err(failure) if failure.reason == FailureReason::Cancelled => {
                debug!(error = %failure, "transfer cancelled by its service");
                self.release(&flow.id).await;
            }
            Err(failure) => self.retry_or_terminate(flow, failure.into()).await,
        }
    }
}
