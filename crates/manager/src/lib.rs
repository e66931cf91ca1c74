//! ferry-manager: the data-flow state machine and its collaborators.
//!
//! [`DataFlowManager`] polls the store for flows it can lease, advances each
//! one through provisioning, transfer and deprovisioning, and reports
//! progress to the control plane. It also accepts external signals (start,
//! suspend, terminate, complete, resume) which take precedence over whatever
//! runtime currently holds a flow.

pub mod auth;
pub mod client;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod provision;

pub use auth::{AccessTokenStore, AuthorizationError, AuthorizationService, AuthorizedAccess};
pub use client::{
    ClientError, ControlPlaneClient, HttpControlPlaneClient, NoopControlPlaneClient,
    TransferProcessEvent,
};
pub use endpoint::{Endpoint, PublicEndpointGenerator};
pub use error::ManagerError;
pub use manager::{DataFlowManager, DataFlowManagerBuilder, ManagerSettings};
pub use provision::{
    Provisioner, ProvisionerManager, ResourceDefinitionGenerator,
    ResourceDefinitionGeneratorManager,
};
