use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Lifecycle of a single side-effecting resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisionResourceState {
    Created,
    ProvisionRequested,
    Provisioned,
    DeprovisionRequested,
    Deprovisioned,
    /// A provisioner reported a fatal error or retries ran out.
    Failed,
}

/// A resource a flow needs before (and releases after) its transfer,
/// e.g. a scoped storage credential or a staging directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionResource {
    /// Deterministic id: the same flow always yields the same ids.
    pub id: String,
    pub flow_id: String,
    /// Tag used to route the resource to a provisioner.
    pub resource_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    pub state: ProvisionResourceState,
    #[serde(default)]
    pub provisioned: Option<ProvisionedResource>,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub error_detail: Option<String>,
}

impl ProvisionResource {
    pub fn new(
        id: impl Into<String>,
        flow_id: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        ProvisionResource {
            id: id.into(),
            flow_id: flow_id.into(),
            resource_type: resource_type.into(),
            properties: BTreeMap::new(),
            state: ProvisionResourceState::Created,
            provisioned: None,
            error_count: 0,
            error_detail: None,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|s| s.as_str())
    }
}

/// Immutable outcome of a provision operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedResource {
    pub id: String,
    pub resource_id: String,
    pub flow_id: String,
    /// Accepted but not yet confirmed by the provider.
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Immutable outcome of a deprovision operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeprovisionedResource {
    pub id: String,
    pub resource_id: String,
    pub flow_id: String,
    #[serde(default)]
    pub pending: bool,
}
