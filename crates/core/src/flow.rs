//! The `DataFlow` entity and its state machine.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::address::DataAddress;
use crate::error::FlowError;
use crate::provision::{ProvisionResource, ProvisionResourceState};

// ──────────────────────────────────────────────
// DataFlowState
// ──────────────────────────────────────────────

/// Lifecycle states of a [`DataFlow`].
///
/// Codes are stable and ordered; they are what a persistent store would index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataFlowState {
    Received,
    Provisioning,
    Provisioned,
    Started,
    Suspended,
    Completed,
    Terminated,
    Deprovisioning,
    Deprovisioned,
}

impl DataFlowState {
    pub const ALL: [DataFlowState; 9] = [
        DataFlowState::Received,
        DataFlowState::Provisioning,
        DataFlowState::Provisioned,
        DataFlowState::Started,
        DataFlowState::Suspended,
        DataFlowState::Completed,
        DataFlowState::Terminated,
        DataFlowState::Deprovisioning,
        DataFlowState::Deprovisioned,
    ];

    pub fn code(self) -> u16 {
        match self {
            DataFlowState::Received => 100,
            DataFlowState::Provisioning => 200,
            DataFlowState::Provisioned => 300,
            DataFlowState::Started => 400,
            DataFlowState::Suspended => 500,
            DataFlowState::Completed => 600,
            DataFlowState::Terminated => 700,
            DataFlowState::Deprovisioning => 800,
            DataFlowState::Deprovisioned => 900,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// COMPLETED, TERMINATED and everything after them: no transfer will run
    /// again and external signals other than duplicate ones are rejected.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            DataFlowState::Completed
                | DataFlowState::Terminated
                | DataFlowState::Deprovisioning
                | DataFlowState::Deprovisioned
        )
    }

    /// Whether the state machine allows `self -> next`.
    ///
    /// Re-entering the same state is always allowed (retry loops).
    pub fn can_transition_to(self, next: DataFlowState) -> bool {
        use DataFlowState::*;
        if self == next {
            return true;
        }
        match self {
            Received => matches!(next, Provisioning | Provisioned | Terminated),
            Provisioning => matches!(next, Provisioned | Terminated),
            Provisioned => matches!(next, Started | Terminated),
            Started => matches!(next, Completed | Suspended | Terminated),
            Suspended => matches!(next, Started | Terminated | Deprovisioning),
            Completed | Terminated => matches!(next, Deprovisioning),
            Deprovisioning => matches!(next, Deprovisioned),
            Deprovisioned => false,
        }
    }
}

impl fmt::Display for DataFlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataFlowState::Received => "RECEIVED",
            DataFlowState::Provisioning => "PROVISIONING",
            DataFlowState::Provisioned => "PROVISIONED",
            DataFlowState::Started => "STARTED",
            DataFlowState::Suspended => "SUSPENDED",
            DataFlowState::Completed => "COMPLETED",
            DataFlowState::Terminated => "TERMINATED",
            DataFlowState::Deprovisioning => "DEPROVISIONING",
            DataFlowState::Deprovisioned => "DEPROVISIONED",
        };
        f.write_str(s)
    }
}

impl FromStr for DataFlowState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown data flow state '{s}'"))
    }
}

// ──────────────────────────────────────────────
// FlowType / TransferType
// ──────────────────────────────────────────────

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlowType {
    /// Provider streams to the consumer's destination.
    Push,
    /// Provider exposes an endpoint the consumer fetches from.
    Pull,
}

impl fmt::Display for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowType::Push => f.write_str("PUSH"),
            FlowType::Pull => f.write_str("PULL"),
        }
    }
}

/// Logical transport descriptor used for transfer-service selection,
/// rendered as `<destinationType>-<PUSH|PULL>[-<responseChannelType>]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferType {
    pub destination_type: String,
    pub flow_type: FlowType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_channel_type: Option<String>,
}

impl TransferType {
    pub fn new(destination_type: impl Into<String>, flow_type: FlowType) -> Self {
        TransferType {
            destination_type: destination_type.into(),
            flow_type,
            response_channel_type: None,
        }
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.destination_type, self.flow_type)?;
        if let Some(channel) = &self.response_channel_type {
            write!(f, "-{channel}")?;
        }
        Ok(())
    }
}

impl FromStr for TransferType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<&str> = s.split('-').collect();
        let pos = segments
            .iter()
            .position(|seg| *seg == "PUSH" || *seg == "PULL")
            .ok_or_else(|| format!("transfer type '{s}' has no PUSH/PULL segment"))?;
        if pos == 0 {
            return Err(format!("transfer type '{s}' has no destination type"));
        }
        let flow_type = if segments[pos] == "PUSH" {
            FlowType::Push
        } else {
            FlowType::Pull
        };
        let rest = segments[pos + 1..].join("-");
        Ok(TransferType {
            destination_type: segments[..pos].join("-"),
            flow_type,
            response_channel_type: if rest.is_empty() { None } else { Some(rest) },
        })
    }
}

// ──────────────────────────────────────────────
// DataFlowStartMessage
// ──────────────────────────────────────────────

/// Request to start a transfer, as received from the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFlowStartMessage {
    /// Flow id; generated when absent. Reusing the id of a SUSPENDED flow
    /// resumes it.
    #[serde(default)]
    pub flow_id: Option<String>,
    pub process_id: String,
    #[serde(default)]
    pub agreement_id: Option<String>,
    #[serde(default)]
    pub asset_id: Option<String>,
    pub source: DataAddress,
    /// Optional for PULL transfers; defaults to an address of the transfer
    /// type's destination type.
    #[serde(default)]
    pub destination: Option<DataAddress>,
    pub transfer_type: TransferType,
    #[serde(default)]
    pub callback_address: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub trace_context: BTreeMap<String, String>,
}

// ──────────────────────────────────────────────
// Lease
// ──────────────────────────────────────────────

/// Exclusive, time-bounded processing rights embedded in a [`DataFlow`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub runtime_id: String,
    /// Epoch millis at which the lease was acquired or last renewed.
    pub leased_at: i64,
    /// Epoch millis after which the holder itself may re-acquire.
    pub lease_expiry: i64,
}

impl Lease {
    /// Whether `runtime_id` may take this lease at `now`.
    ///
    /// The holder may re-acquire once the lease expired; any other runtime
    /// must wait until `leased_at + abandon_ms` (the flow is presumed
    /// abandoned by a stalled or crashed owner).
    pub fn is_reclaimable_by(&self, runtime_id: &str, now: i64, abandon_ms: i64) -> bool {
        if self.runtime_id == runtime_id {
            now >= self.lease_expiry
        } else {
            now >= self.leased_at.saturating_add(abandon_ms)
        }
    }
}

// ──────────────────────────────────────────────
// DataFlow
// ──────────────────────────────────────────────

/// The persisted unit of work: one transfer execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFlow {
    pub id: String,
    pub process_id: String,
    pub state: DataFlowState,
    /// Attempts made in the current state.
    pub state_count: u32,
    /// Epoch millis of the last transition or retry.
    pub state_timestamp: i64,
    pub created_at: i64,
    #[serde(default)]
    pub trace_context: BTreeMap<String, String>,
    pub source: DataAddress,
    pub destination: DataAddress,
    pub flow_type: FlowType,
    pub transfer_type: TransferType,
    #[serde(default)]
    pub callback_address: Option<String>,
    #[serde(default)]
    pub agreement_id: Option<String>,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Runtime that last held or currently holds the lease.
    #[serde(default)]
    pub runtime_id: Option<String>,
    #[serde(default)]
    pub lease: Option<Lease>,
    /// Optimistic-concurrency version, owned by the store.
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub resources: Vec<ProvisionResource>,
    /// Address handed to the consumer of a PULL transfer.
    #[serde(default)]
    pub endpoint_data_reference: Option<DataAddress>,
    #[serde(default)]
    pub error_detail: Option<String>,
}

impl DataFlow {
    /// Build a RECEIVED flow from a start message.
    pub fn from_start_message(id: String, message: DataFlowStartMessage, now: i64) -> Self {
        let destination = message
            .destination
            .unwrap_or_else(|| DataAddress::new(message.transfer_type.destination_type.clone()));
        DataFlow {
            id,
            process_id: message.process_id,
            state: DataFlowState::Received,
            state_count: 0,
            state_timestamp: now,
            created_at: now,
            trace_context: message.trace_context,
            source: message.source,
            destination,
            flow_type: message.transfer_type.flow_type,
            transfer_type: message.transfer_type,
            callback_address: message.callback_address,
            agreement_id: message.agreement_id,
            asset_id: message.asset_id,
            properties: message.properties,
            runtime_id: None,
            lease: None,
            version: 0,
            resources: Vec::new(),
            endpoint_data_reference: None,
            error_detail: None,
        }
    }

    /// Move to `next`, resetting the attempt counter.
    ///
    /// Moving to the current state is treated as a fresh entry as well; use
    /// [`DataFlow::record_retry`] to count an attempt.
    pub fn transition_to(&mut self, next: DataFlowState, now: i64) -> Result<(), FlowError> {
        if !self.state.can_transition_to(next) {
            return Err(FlowError::InvalidTransition {
                flow_id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.state_count = 0;
        self.state_timestamp = now;
        Ok(())
    }

    /// Count a failed attempt in the current state.
    pub fn record_retry(&mut self, now: i64) {
        self.state_count = self.state_count.saturating_add(1);
        self.state_timestamp = now;
    }

    /// Move to TERMINATED with an error detail.
    pub fn terminate(&mut self, detail: impl Into<String>, now: i64) -> Result<(), FlowError> {
        self.transition_to(DataFlowState::Terminated, now)?;
        self.error_detail = Some(detail.into());
        Ok(())
    }

    pub fn is_push(&self) -> bool {
        self.flow_type == FlowType::Push
    }

    /// Whether a lease is held at `now` by anyone.
    pub fn is_leased_at(&self, now: i64) -> bool {
        self.lease.as_ref().is_some_and(|l| now < l.lease_expiry)
    }

    pub fn lease_holder(&self) -> Option<&str> {
        self.lease.as_ref().map(|l| l.runtime_id.as_str())
    }

    /// Resources still waiting for a provisioner outcome.
    pub fn resources_to_provision(&self) -> impl Iterator<Item = &ProvisionResource> {
        self.resources.iter().filter(|r| {
            matches!(
                r.state,
                ProvisionResourceState::Created | ProvisionResourceState::ProvisionRequested
            )
        })
    }

    /// Resources that hold side effects and must be deprovisioned.
    ///
    /// A pending provision counts: the provider accepted it and will create
    /// the resource whether or not the flow is still around.
    pub fn resources_to_deprovision(&self) -> impl Iterator<Item = &ProvisionResource> {
        self.resources.iter().filter(|r| {
            matches!(
                r.state,
                ProvisionResourceState::ProvisionRequested
                    | ProvisionResourceState::Provisioned
                    | ProvisionResourceState::DeprovisionRequested
            )
        })
    }

    pub fn has_provisioned_resources(&self) -> bool {
        self.resources_to_deprovision().next().is_some()
    }

    pub fn resource_mut(&mut self, resource_id: &str) -> Option<&mut ProvisionResource> {
        self.resources.iter_mut().find(|r| r.id == resource_id)
    }
}
