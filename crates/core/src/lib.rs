//! ferry-core: domain model shared by every Ferry crate.
//!
//! Ferry is a dataspace connector data plane. This crate holds the types the
//! scheduler, the store and the transfer pipeline agree on:
//!
//! - [`DataFlow`] -- the persisted unit of work and its state machine
//! - [`DataAddress`] -- typed source/destination descriptors
//! - [`ProvisionResource`] and its outcome snapshots
//! - [`StatusResult`] / [`StreamResult`] -- handler and transfer outcomes
//! - [`Clock`] and [`WaitStrategy`] -- time and inter-iteration delay
//! - [`FerryConfig`] -- the configuration surface with its defaults

/// Version string reported by the health endpoint and the CLI.
pub const FERRY_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod address;
pub mod clock;
pub mod config;
pub mod error;
pub mod flow;
pub mod provision;
pub mod status;
pub mod wait;

// ── Convenience re-exports ───────────────────────────────────────────

pub use address::DataAddress;
pub use clock::{format_millis, Clock, ManualClock, SystemClock};
pub use config::{
    ConfigError, FerryConfig, LeaseConfig, ProvisioningConfig, PublicApiConfig, RetryConfig,
    ServerConfig, StateMachineConfig, TransferConfig,
};
pub use error::FlowError;
pub use flow::{
    DataFlow, DataFlowStartMessage, DataFlowState, FlowType, Lease, TransferType,
};
pub use provision::{
    DeprovisionedResource, ProvisionResource, ProvisionResourceState, ProvisionedResource,
};
pub use status::{
    FailureReason, ResponseStatus, StatusFailure, StatusResult, StreamFailure, StreamResult,
};
pub use wait::{ExponentialWaitStrategy, RetryBackoff, WaitStrategy};

/// Generate a new opaque identifier (ULID text form).
pub fn new_id() -> String {
    ulid::Ulid::new().to_string()
}
