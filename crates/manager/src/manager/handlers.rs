//! State handlers run by the scheduler loop.

use ferry_core::{
    DataFlow, DataFlowState, FlowError, ProvisionResource, ProvisionResourceState, StatusFailure,
};
use ferry_storage::SaveMode;
use tracing::{debug, info, warn};

use super::{DataFlowManager, Outcome};
use crate::client::TransferProcessEvent;

/// Aggregate of one provisioning or deprovisioning round.
#[derive(Debug, Default)]
struct Round {
    fatal: Option<String>,
    retry: Option<String>,
    waiting: bool,
}

impl DataFlowManager {
    pub(super) async fn handle(&self, flow: DataFlow) {
        debug!("handling flow");
        match flow.state {
            DataFlowState::Received => self.on_received(flow).await,
            DataFlowState::Provisioning => self.on_provisioning(flow).await,
            DataFlowState::Provisioned => self.on_provisioned(flow).await,
            DataFlowState::Started => self.on_started(flow).await,
            DataFlowState::Completed | DataFlowState::Terminated => self.recover_finished(flow).await,
            DataFlowState::Deprovisioning => self.on_deprovisioning(flow).await,
            other => {
                debug!(state = %other, "nothing to do");
                self.release(&flow.id).await;
            }
        }
    }

    /// Count a failed attempt and stay, or terminate once the limit is
    /// exceeded or the failure is fatal.
    pub(super) async fn retry_or_terminate(&self, mut flow: DataFlow, failure: StatusFailure) {
        let limit = self.inner.settings.send_retry_limit;
        if failure.is_retryable() && flow.state_count < limit {
            flow.record_retry(self.now());
            warn!(
                attempt = flow.state_count,
                limit,
                error = %failure.detail,
                "attempt failed, will retry"
            );
            flow.error_detail = Some(failure.detail);
            self.persist(&mut flow, SaveMode::ReleaseLease).await;
            return;
        }
        let detail = if failure.is_retryable() {
            format!("retry limit of {limit} exceeded: {}", failure.detail)
        } else {
            failure.detail
        };
        self.finish_or_discard(flow, Outcome::Terminated(detail)).await;
    }

    async fn on_received(&self, mut flow: DataFlow) {
        let resources = self.inner.generators.generate_all(&flow);
        let next = if resources.is_empty() {
            DataFlowState::Provisioned
        } else {
            DataFlowState::Provisioning
        };
        debug!(resources = resources.len(), next = %next, "resource definitions generated");
        flow.resources = resources;
        if let Err(e) = flow.transition_to(next, self.now()) {
            self.finish_or_discard(flow, Outcome::Terminated(e.to_string())).await;
            return;
        }
        self.persist(&mut flow, SaveMode::ReleaseLease).await;
    }

    async fn on_provisioning(&self, mut flow: DataFlow) {
        let requested: Vec<ProvisionResource> = flow
            .resources_to_provision()
            .filter(|r| r.state == ProvisionResourceState::Created)
            .cloned()
            .collect();
        let results = self.inner.provisioners.provision(&requested).await;

        let mut round = Round::default();
        for (resource, result) in requested.iter().zip(results) {
            let Some(stored) = flow.resource_mut(&resource.id) else {
                continue;
            };
            match result {
                Ok(done) if done.pending => {
                    stored.state = ProvisionResourceState::ProvisionRequested;
                }
                Ok(done) => {
                    stored.state = ProvisionResourceState::Provisioned;
                    let properties = done.properties.clone();
                    stored.provisioned = Some(done);
                    flow.properties.extend(properties);
                }
                Err(failure) if failure.is_retryable() => {
                    stored.error_count += 1;
                    stored.error_detail = Some(failure.detail.clone());
                    round.retry = Some(failure.detail);
                }
                Err(failure) => {
                    stored.state = ProvisionResourceState::Failed;
                    stored.error_detail = Some(failure.detail.clone());
                    round.fatal = Some(failure.detail);
                }
            }
        }
        round.waiting = flow
            .resources
            .iter()
            .any(|r| r.state == ProvisionResourceState::ProvisionRequested);

        if let Some(detail) = round.fatal {
            self.finish_or_discard(flow, Outcome::Terminated(format!("provisioning failed: {detail}")))
                .await;
        } else if let Some(detail) = round.retry {
            self.retry_or_terminate(flow, StatusFailure::retry(detail)).await;
        } else if round.waiting {
            // Keep the lease: the flow is re-checked once it expires, or
            // earlier through `resource_provisioned`.
            debug!("waiting for provisioning confirmation");
            self.persist(&mut flow, SaveMode::RetainLease).await;
        } else {
            self.provisioned(flow).await;
        }
    }

    /// Every resource is in place: move to PROVISIONED and tell the control
    /// plane.
    pub(super) async fn provisioned(&self, mut flow: DataFlow) {
        if let Err(e) = flow.transition_to(DataFlowState::Provisioned, self.now()) {
            warn!(error = %e, "cannot move to PROVISIONED");
            self.release(&flow.id).await;
            return;
        }
        flow.error_detail = None;
        if self.persist(&mut flow, SaveMode::ReleaseLease).await {
            info!(flow_id = %flow.id, "resources provisioned");
            self.notify(&flow, TransferProcessEvent::Provisioned).await;
        }
    }

    async fn on_provisioned(&self, flow: DataFlow) {
        if flow.is_push() {
            self.start_push(flow, SaveMode::RetainLease).await;
        } else {
            self.start_pull(flow).await;
        }
    }

    /// Resolve a transfer service, persist STARTED and launch the transfer.
    pub(super) async fn start_push(&self, mut flow: DataFlow, mode: SaveMode) {
        let Some(service) = self.inner.registry.resolve(&flow) else {
            let err = FlowError::Configuration(format!(
                "no transfer service for {} ({} -> {})",
                flow.transfer_type, flow.source.address_type, flow.destination.address_type
            ));
            self.finish_or_discard(flow, Outcome::Terminated(err.to_string())).await;
            return;
        };
        if let Err(failure) = service.validate(&flow) {
            self.finish_or_discard(flow, Outcome::Terminated(failure.detail)).await;
            return;
        }
        if flow.state != DataFlowState::Started {
            if let Err(e) = flow.transition_to(DataFlowState::Started, self.now()) {
                self.finish_or_discard(flow, Outcome::Terminated(e.to_string())).await;
                return;
            }
        }
        flow.error_detail = None;
        if !self.persist(&mut flow, mode).await {
            return;
        }
        info!(flow_id = %flow.id, service = service.name(), attempt = flow.state_count, "transfer starting");
        self.notify(&flow, TransferProcessEvent::Started).await;
        self.launch_transfer(flow, service);
    }

    /// Issue the endpoint data reference and persist STARTED.
    pub(super) async fn start_pull(&self, mut flow: DataFlow) {
        let Some(auth) = self.inner.authorization.clone() else {
            let err = FlowError::Configuration(
                "PULL transfers need a public endpoint and token signing key".to_string(),
            );
            self.finish_or_discard(flow, Outcome::Terminated(err.to_string())).await;
            return;
        };
        let edr = match auth.create_endpoint_data_reference(&flow) {
            Ok(edr) => edr,
            Err(e) => {
                self.retry_or_terminate(flow, e.into()).await;
                return;
            }
        };
        flow.endpoint_data_reference = Some(edr);
        if let Err(e) = flow.transition_to(DataFlowState::Started, self.now()) {
            self.finish_or_discard(flow, Outcome::Terminated(e.to_string())).await;
            return;
        }
        flow.error_detail = None;
        if self.persist(&mut flow, SaveMode::ReleaseLease).await {
            info!(flow_id = %flow.id, "endpoint data reference issued");
            self.notify(&flow, TransferProcessEvent::Started).await;
        }
    }

    /// A STARTED PUSH flow nobody is running: either a scheduled retry
    /// (`error_detail` set by the failed attempt) or a flow whose owner
    /// vanished, which costs an attempt.
    async fn on_started(&self, mut flow: DataFlow) {
        if flow.error_detail.is_none() {
            flow.record_retry(self.now());
            info!(attempt = flow.state_count, "restarting abandoned transfer");
        }
        let limit = self.inner.settings.send_retry_limit;
        if flow.state_count > limit {
            let detail = format!(
                "retry limit of {limit} exceeded: {}",
                flow.error_detail.as_deref().unwrap_or("transfer abandoned")
            );
            self.finish_or_discard(flow, Outcome::Terminated(detail)).await;
            return;
        }
        self.start_push(flow, SaveMode::RetainLease).await;
    }

    async fn on_deprovisioning(&self, mut flow: DataFlow) {
        let targets: Vec<ProvisionResource> = flow.resources_to_deprovision().cloned().collect();
        let results = self.inner.provisioners.deprovision(&targets).await;

        let mut round = Round::default();
        for (resource, result) in targets.iter().zip(results) {
            let Some(stored) = flow.resource_mut(&resource.id) else {
                continue;
            };
            match result {
                Ok(done) if done.pending => {
                    stored.state = ProvisionResourceState::DeprovisionRequested;
                    round.waiting = true;
                }
                Ok(_) => stored.state = ProvisionResourceState::Deprovisioned,
                Err(failure) if failure.is_retryable() => {
                    stored.error_count += 1;
                    stored.error_detail = Some(failure.detail.clone());
                    round.retry = Some(failure.detail);
                }
                Err(failure) => {
                    stored.state = ProvisionResourceState::Failed;
                    stored.error_detail = Some(failure.detail.clone());
                    round.fatal = Some(failure.detail);
                }
            }
        }

        let limit = self.inner.settings.send_retry_limit;
        if let Some(detail) = round.fatal {
            self.deprovisioned(flow, Some(detail)).await;
        } else if let Some(detail) = round.retry {
            if flow.state_count < limit {
                flow.record_retry(self.now());
                warn!(attempt = flow.state_count, limit, error = %detail, "deprovisioning failed, will retry");
                self.persist(&mut flow, SaveMode::ReleaseLease).await;
            } else {
                let detail = format!("retry limit of {limit} exceeded: {detail}");
                self.deprovisioned(flow, Some(detail)).await;
            }
        } else if round.waiting {
            debug!("waiting for deprovisioning confirmation");
            self.persist(&mut flow, SaveMode::RetainLease).await;
        } else {
            self.deprovisioned(flow, None).await;
        }
    }

    /// DEPROVISIONED is reached even when deprovisioning failed; the failure
    /// is appended to `error_detail`.
    async fn deprovisioned(&self, mut flow: DataFlow, failure: Option<String>) {
        if let Some(detail) = failure {
            let detail = format!("deprovisioning failed: {detail}");
            warn!(error = %detail, "giving up on deprovisioning");
            flow.error_detail = Some(match flow.error_detail.take() {
                Some(previous) => format!("{previous}; {detail}"),
                None => detail,
            });
        }
        if let Err(e) = flow.transition_to(DataFlowState::Deprovisioned, self.now()) {
            warn!(error = %e, "cannot move to DEPROVISIONED");
            self.release(&flow.id).await;
            return;
        }
        if self.persist(&mut flow, SaveMode::ReleaseLease).await {
            info!(flow_id = %flow.id, "resources deprovisioned");
        }
    }
}
