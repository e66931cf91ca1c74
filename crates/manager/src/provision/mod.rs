//! Resource definition generators and provisioners.
//!
//! Generators decide which side-effecting resources a flow needs; the
//! provisioner manager creates and releases them. Both registries are
//! populated at startup.

pub mod staging;

use std::sync::Arc;

use async_trait::async_trait;
use ferry_core::{
    DataFlow, DeprovisionedResource, FlowError, ProvisionResource, ProvisionResourceState,
    ProvisionedResource, StatusFailure, StatusResult,
};
use tokio::task::JoinSet;
use tracing::debug;

// ──────────────────────────────────────────────
// Generators
// ──────────────────────────────────────────────

/// Produces the resource definitions a flow needs.
///
/// Generators must be pure functions of the flow: the manager assigns ids
/// from the flow id, the generator name and the definition's position, so
/// generating twice yields the same resources.
pub trait ResourceDefinitionGenerator: Send + Sync {
    fn name(&self) -> &str;

    fn can_generate(&self, flow: &DataFlow) -> bool;

    fn generate(&self, flow: &DataFlow) -> Vec<ProvisionResource>;
}

/// Deterministic resource id.
pub fn resource_id(flow_id: &str, generator: &str, index: usize) -> String {
    format!("{flow_id}-{generator}-{index}")
}

#[derive(Default)]
pub struct ResourceDefinitionGeneratorManager {
    consumer: Vec<Arc<dyn ResourceDefinitionGenerator>>,
    provider: Vec<Arc<dyn ResourceDefinitionGenerator>>,
}

impl ResourceDefinitionGeneratorManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generators for resources on the receiving side (the destination).
    pub fn register_consumer_generator(&mut self, generator: Arc<dyn ResourceDefinitionGenerator>) {
        self.consumer.push(generator);
    }

    /// Generators for resources on the sending side (the source).
    pub fn register_provider_generator(&mut self, generator: Arc<dyn ResourceDefinitionGenerator>) {
        self.provider.push(generator);
    }

    pub fn generate_consumer_resource_definitions(&self, flow: &DataFlow) -> Vec<ProvisionResource> {
        generate(&self.consumer, flow)
    }

    pub fn generate_provider_resource_definitions(&self, flow: &DataFlow) -> Vec<ProvisionResource> {
        generate(&self.provider, flow)
    }

    /// Consumer definitions followed by provider definitions.
    pub fn generate_all(&self, flow: &DataFlow) -> Vec<ProvisionResource> {
        let mut resources = self.generate_consumer_resource_definitions(flow);
        resources.extend(self.generate_provider_resource_definitions(flow));
        resources
    }
}

fn generate(
    generators: &[Arc<dyn ResourceDefinitionGenerator>],
    flow: &DataFlow,
) -> Vec<ProvisionResource> {
    generators
        .iter()
        .filter(|g| g.can_generate(flow))
        .flat_map(|g| {
            g.generate(flow)
                .into_iter()
                .enumerate()
                .map(move |(index, mut resource)| {
                    resource.id = resource_id(&flow.id, g.name(), index);
                    resource.flow_id = flow.id.clone();
                    resource.state = ProvisionResourceState::Created;
                    resource
                })
        })
        .collect()
}

// ──────────────────────────────────────────────
// Provisioners
// ──────────────────────────────────────────────

/// Creates and releases one kind of resource.
///
/// A provisioner may answer with `pending = true` when the provider accepts
/// the request but completes it later; the outcome then arrives through
/// `DataFlowManager::resource_provisioned`.
#[async_trait]
pub trait Provisioner: Send + Sync {
    fn can_provision(&self, resource: &ProvisionResource) -> bool;

    async fn provision(&self, resource: &ProvisionResource) -> StatusResult<ProvisionedResource>;

    async fn deprovision(&self, resource: &ProvisionResource) -> StatusResult<DeprovisionedResource>;
}

#[derive(Default)]
pub struct ProvisionerManager {
    provisioners: Vec<Arc<dyn Provisioner>>,
}

enum Operation {
    Provision,
    Deprovision,
}

impl ProvisionerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provisioner: Arc<dyn Provisioner>) {
        self.provisioners.push(provisioner);
    }

    fn provisioner_for(&self, resource: &ProvisionResource) -> StatusResult<Arc<dyn Provisioner>> {
        self.provisioners
            .iter()
            .find(|p| p.can_provision(resource))
            .cloned()
            .ok_or_else(|| {
                FlowError::Configuration(format!(
                    "no provisioner for resource {} of type '{}'",
                    resource.id, resource.resource_type
                ))
                .into()
            })
    }

    /// Provision every resource concurrently. Results are in input order.
    ///
    /// A resource already provisioned returns its recorded outcome without
    /// calling a provisioner.
    pub async fn provision(
        &self,
        resources: &[ProvisionResource],
    ) -> Vec<StatusResult<ProvisionedResource>> {
        let mut results: Vec<Option<StatusResult<ProvisionedResource>>> =
            resources.iter().map(|_| None).collect();
        let mut tasks = JoinSet::new();

        for (index, resource) in resources.iter().enumerate() {
            if let (ProvisionResourceState::Provisioned, Some(done)) =
                (resource.state, &resource.provisioned)
            {
                debug!(resource_id = %resource.id, "already provisioned");
                results[index] = Some(Ok(done.clone()));
                continue;
            }
            match self.provisioner_for(resource) {
                Ok(provisioner) => {
                    let resource = resource.clone();
                    tasks.spawn(async move { (index, provisioner.provision(&resource).await) });
                }
                Err(failure) => results[index] = Some(Err(failure)),
            }
        }
        collect(tasks, results, Operation::Provision).await
    }

    /// Deprovision every resource concurrently. Results are in input order.
    pub async fn deprovision(
        &self,
        resources: &[ProvisionResource],
    ) -> Vec<StatusResult<DeprovisionedResource>> {
        let mut results: Vec<Option<StatusResult<DeprovisionedResource>>> =
            resources.iter().map(|_| None).collect();
        let mut tasks = JoinSet::new();

        for (index, resource) in resources.iter().enumerate() {
            if resource.state == ProvisionResourceState::Deprovisioned {
                results[index] = Some(Ok(DeprovisionedResource {
                    id: resource.id.clone(),
                    resource_id: resource
                        .provisioned
                        .as_ref()
                        .map(|p| p.resource_id.clone())
                        .unwrap_or_default(),
                    flow_id: resource.flow_id.clone(),
                    pending: false,
                }));
                continue;
            }
            match self.provisioner_for(resource) {
                Ok(provisioner) => {
                    let resource = resource.clone();
                    tasks.spawn(async move { (index, provisioner.deprovision(&resource).await) });
                }
                Err(failure) => results[index] = Some(Err(failure)),
            }
        }
        collect(tasks, results, Operation::Deprovision).await
    }
}

async fn collect<T: Send + 'static>(
    mut tasks: JoinSet<(usize, StatusResult<T>)>,
    mut results: Vec<Option<StatusResult<T>>>,
    operation: Operation,
) -> Vec<StatusResult<T>> {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, result)) => results[index] = Some(result),
            // The index is lost with a panicked task; the slot is filled below.
            Err(e) => debug!(error = %e, "provisioner task failed"),
        }
    }
    let verb = match operation {
        Operation::Provision => "provision",
        Operation::Deprovision => "deprovision",
    };
    results
        .into_iter()
        .map(|r| r.unwrap_or_else(|| Err(StatusFailure::retry(format!("{verb} task aborted")))))
        .collect()
}
