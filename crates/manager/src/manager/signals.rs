//! External signals.
//!
//! Signals are authoritative: they steal the lease from whichever runtime
//! holds the flow. A runtime that loses its lease this way finds out on its
//! next heartbeat or save.

use ferry_core::{
    DataFlow, DataFlowStartMessage, DataFlowState, ProvisionResourceState, ProvisionedResource,
};
use ferry_storage::{LeaseMode, SaveMode};
use tracing::info;

use super::{DataFlowManager, Outcome};
use crate::error::ManagerError;

impl DataFlowManager {
    async fn steal(&self, flow_id: &str) -> Result<DataFlow, ManagerError> {
        self.inner
            .store
            .acquire_lease(self.runtime_id(), flow_id, LeaseMode::Steal)
            .await
            .map_err(ManagerError::from_storage)
    }

    /// Give the lease back and report the signal as not applicable.
    async fn reject(&self, flow: &DataFlow, action: &'static str) -> ManagerError {
        self.release(&flow.id).await;
        ManagerError::InvalidTransition {
            flow_id: flow.id.clone(),
            action,
            state: flow.state,
        }
    }

    async fn save_signal(&self, flow: &mut DataFlow, mode: SaveMode) -> Result<(), ManagerError> {
        if let Err(e) = self.save(flow, mode).await {
            self.release(&flow.id).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Accept a new transfer. Reusing the id of a SUSPENDED flow resumes it.
    pub async fn start_flow(&self, message: DataFlowStartMessage) -> Result<DataFlow, ManagerError> {
        let flow_id = message.flow_id.clone().unwrap_or_else(ferry_core::new_id);
        if let Some(existing) = self.inner.store.find_by_id(&flow_id).await? {
            if existing.state == DataFlowState::Suspended {
                return self.resume(&flow_id).await;
            }
            return Err(ManagerError::AlreadyExists(flow_id));
        }

        let flow = DataFlow::from_start_message(flow_id, message, self.now());
        let flow = self
            .inner
            .store
            .create(flow)
            .await
            .map_err(ManagerError::from_storage)?;
        info!(
            flow_id = %flow.id,
            process_id = %flow.process_id,
            transfer_type = %flow.transfer_type,
            "data flow received"
        );
        Ok(flow)
    }

    pub async fn suspend(&self, flow_id: &str, reason: Option<String>) -> Result<DataFlow, ManagerError> {
        let mut flow = self.steal(flow_id).await?;
        match flow.state {
            DataFlowState::Suspended => {
                self.release(flow_id).await;
                return Ok(flow);
            }
            DataFlowState::Started => {}
            _ => return Err(self.reject(&flow, "suspended").await),
        }

        self.cancel_transfer(flow_id);
        flow.transition_to(DataFlowState::Suspended, self.now())?;
        flow.error_detail = reason;
        if let Some(auth) = self.authorization() {
            auth.revoke(flow_id, "suspended");
        }
        flow.endpoint_data_reference = None;
        self.save_signal(&mut flow, SaveMode::ReleaseLease).await?;
        info!(flow_id, "data flow suspended");
        Ok(flow)
    }

    /// Terminate a flow. Terminating a TERMINATED flow is a no-op.
    pub async fn terminate(&self, flow_id: &str, reason: Option<String>) -> Result<DataFlow, ManagerError> {
        let mut flow = self.steal(flow_id).await?;
        if flow.state == DataFlowState::Terminated {
            self.release(flow_id).await;
            return Ok(flow);
        }
        if flow.state.is_final() {
            return Err(self.reject(&flow, "terminated").await);
        }

        self.cancel_transfer(flow_id);
        let detail = reason.unwrap_or_else(|| "terminated by signal".to_string());
        if let Err(e) = self.finish(&mut flow, Outcome::Terminated(detail)).await {
            self.release(flow_id).await;
            return Err(e.into());
        }
        Ok(flow)
    }

    /// Mark a STARTED flow complete, e.g. once the consumer of a PULL
    /// transfer is done.
    pub async fn complete(&self, flow_id: &str) -> Result<DataFlow, ManagerError> {
        let mut flow = self.steal(flow_id).await?;
        if flow.state != DataFlowState::Started {
            return Err(self.reject(&flow, "completed").await);
        }

        self.cancel_transfer(flow_id);
        if let Err(e) = self.finish(&mut flow, Outcome::Completed).await {
            self.release(flow_id).await;
            return Err(e.into());
        }
        Ok(flow)
    }

    /// Resume a SUSPENDED flow from the beginning of its transfer.
    pub async fn resume(&self, flow_id: &str) -> Result<DataFlow, ManagerError> {
        let mut flow = self.steal(flow_id).await?;
        if flow.state != DataFlowState::Suspended {
            return Err(self.reject(&flow, "resumed").await);
        }
        flow.transition_to(DataFlowState::Started, self.now())?;
        info!(flow_id, "data flow resuming");
        if flow.is_push() {
            self.start_push(flow, SaveMode::RetainLease).await;
        } else {
            self.start_pull(flow).await;
        }
        self.status(flow_id).await
    }

    /// Confirm a resource whose provisioning was accepted as pending.
    pub async fn resource_provisioned(
        &self,
        flow_id: &str,
        provisioned: ProvisionedResource,
    ) -> Result<DataFlow, ManagerError> {
        let mut flow = self.steal(flow_id).await?;
        if flow.state != DataFlowState::Provisioning {
            return Err(self.reject(&flow, "confirmed").await);
        }
        let Some(resource) = flow.resource_mut(&provisioned.id) else {
            self.release(flow_id).await;
            return Err(ManagerError::UnknownResource {
                flow_id: flow_id.to_string(),
                resource_id: provisioned.id,
            });
        };
        if resource.state == ProvisionResourceState::Provisioned {
            self.release(flow_id).await;
            return Ok(flow);
        }

        resource.state = ProvisionResourceState::Provisioned;
        let properties = provisioned.properties.clone();
        resource.provisioned = Some(ProvisionedResource {
            pending: false,
            ..provisioned
        });
        flow.properties.extend(properties);

        if flow.resources_to_provision().next().is_none() {
            self.provisioned(flow).await;
            return self.status(flow_id).await;
        }
        self.save_signal(&mut flow, SaveMode::ReleaseLease).await?;
        Ok(flow)
    }
}
