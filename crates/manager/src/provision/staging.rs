//! Scratch directories for `File` destinations.
//!
//! A `File` destination flagged `staging=true` gets one directory under the
//! configured staging root, at `<root>/<flow id>/<resource id>`. Its path is
//! exported as the `stagingPath` property once provisioned, and the whole
//! directory is removed on deprovision.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ferry_core::{
    DataFlow, DeprovisionedResource, FlowError, ProvisionResource, ProvisionedResource,
    StatusFailure, StatusResult,
};
use tracing::debug;

use super::{Provisioner, ResourceDefinitionGenerator};

pub const STAGING_RESOURCE_TYPE: &str = "StagingDirectory";

/// Destination flag requesting a staging directory.
pub const STAGING_FLAG: &str = "staging";

/// Property under which the provisioned directory is exported.
pub const STAGING_PATH: &str = "stagingPath";

const FILE_TYPE: &str = "File";

#[derive(Debug, Clone, Copy, Default)]
pub struct StagingDirectoryGenerator;

impl ResourceDefinitionGenerator for StagingDirectoryGenerator {
    fn name(&self) -> &str {
        "staging"
    }

    fn can_generate(&self, flow: &DataFlow) -> bool {
        flow.destination.address_type == FILE_TYPE && flow.destination.flag(STAGING_FLAG)
    }

    fn generate(&self, flow: &DataFlow) -> Vec<ProvisionResource> {
        vec![ProvisionResource::new("", &flow.id, STAGING_RESOURCE_TYPE)]
    }
}

#[derive(Debug, Clone)]
pub struct StagingDirectoryProvisioner {
    root: PathBuf,
}

impl StagingDirectoryProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StagingDirectoryProvisioner { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn directory_for(&self, resource: &ProvisionResource) -> StatusResult<PathBuf> {
        // Ids become path components; refuse anything that could climb out.
        for part in [&resource.flow_id, &resource.id] {
            if part.is_empty() || part.contains(['/', '\\']) || part == ".." {
                return Err(FlowError::Configuration(format!(
                    "resource {} cannot be used as a directory name",
                    resource.id
                ))
                .into());
            }
        }
        Ok(self.root.join(&resource.flow_id).join(&resource.id))
    }
}

fn io_failure(context: String, err: std::io::Error) -> StatusFailure {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => StatusFailure::fatal(format!("{context}: {err}")),
        _ => StatusFailure::retry(format!("{context}: {err}")),
    }
}

#[async_trait]
impl Provisioner for StagingDirectoryProvisioner {
    fn can_provision(&self, resource: &ProvisionResource) -> bool {
        resource.resource_type == STAGING_RESOURCE_TYPE
    }

    async fn provision(&self, resource: &ProvisionResource) -> StatusResult<ProvisionedResource> {
        let dir = self.directory_for(resource)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_failure(format!("create {}", dir.display()), e))?;
        debug!(resource_id = %resource.id, dir = %dir.display(), "staging directory ready");

        let path = dir.display().to_string();
        Ok(ProvisionedResource {
            id: resource.id.clone(),
            resource_id: path.clone(),
            flow_id: resource.flow_id.clone(),
            pending: false,
            properties: [(STAGING_PATH.to_string(), path)].into_iter().collect(),
        })
    }

    async fn deprovision(&self, resource: &ProvisionResource) -> StatusResult<DeprovisionedResource> {
        let dir = self.directory_for(resource)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_failure(format!("remove {}", dir.display()), e)),
        }
        // The per-flow parent is left behind if other resources still use it.
        if let Some(parent) = dir.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(DeprovisionedResource {
            id: resource.id.clone(),
            resource_id: dir.display().to_string(),
            flow_id: resource.flow_id.clone(),
            pending: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::{ProvisionerManager, ResourceDefinitionGeneratorManager};
    use ferry_core::address::PATH;
    use ferry_core::{DataAddress, DataFlowStartMessage, FlowType, TransferType};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn flow(destination: DataAddress) -> DataFlow {
        DataFlow::from_start_message(
            "flow-7".into(),
            DataFlowStartMessage {
                flow_id: None,
                process_id: "p".into(),
                agreement_id: None,
                asset_id: None,
                source: DataAddress::new("Memory"),
                transfer_type: TransferType::new(destination.address_type.clone(), FlowType::Push),
                destination: Some(destination),
                callback_address: None,
                properties: BTreeMap::new(),
                trace_context: BTreeMap::new(),
            },
            0,
        )
    }

    #[test]
    fn only_flagged_file_destinations_get_a_directory() {
        let mut generators = ResourceDefinitionGeneratorManager::new();
        generators.register_consumer_generator(Arc::new(StagingDirectoryGenerator));

        let plain = flow(DataAddress::new(FILE_TYPE).with_property(PATH, "/tmp/out"));
        assert!(generators.generate_all(&plain).is_empty());

        let staged = flow(
            DataAddress::new(FILE_TYPE)
                .with_property(PATH, "/tmp/out")
                .with_property(STAGING_FLAG, "true"),
        );
        let resources = generators.generate_all(&staged);
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].id, "flow-7-staging-0");
        assert_eq!(resources[0].resource_type, STAGING_RESOURCE_TYPE);
    }

    #[tokio::test]
    async fn provision_creates_and_deprovision_removes() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = ProvisionerManager::new();
        manager.register(Arc::new(StagingDirectoryProvisioner::new(root.path())));
        let resource = ProvisionResource::new("flow-7-staging-0", "flow-7", STAGING_RESOURCE_TYPE);

        let provisioned = manager.provision(&[resource.clone()]).await.remove(0).unwrap();
        let dir = root.path().join("flow-7").join("flow-7-staging-0");
        assert!(dir.is_dir());
        assert_eq!(
            provisioned.properties.get(STAGING_PATH).map(String::as_str),
            Some(dir.display().to_string().as_str())
        );

        manager.deprovision(&[resource.clone()]).await.remove(0).unwrap();
        assert!(!dir.exists());
        assert!(!root.path().join("flow-7").exists());

        // Already gone: still succeeds.
        assert!(manager.deprovision(&[resource]).await.remove(0).is_ok());
    }

    #[tokio::test]
    async fn path_like_ids_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        let provisioner = StagingDirectoryProvisioner::new(root.path());
        let resource = ProvisionResource::new("../escape", "flow-7", STAGING_RESOURCE_TYPE);
        let failure = provisioner.provision(&resource).await.unwrap_err();
        assert!(!failure.is_retryable());
    }
}
