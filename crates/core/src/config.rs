//! Runtime configuration.
//!
//! Every setting has a default, so an empty file (or no file) is a valid
//! configuration. Values are read from TOML and then overridden by
//! `FERRY_*` environment variables.
//!
//! # Example
//!
//! ```toml
//! runtime_id = "dataplane-a"
//!
//! [state_machine]
//! iteration_wait_ms = 500
//! batch_size = 10
//!
//! [retry]
//! send_retry_limit = 3
//!
//! [lease]
//! flow_lease_time_ms = 1000
//! flow_lease_factor = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wait::RetryBackoff;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value '{value}' for {key}")]
    Env { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Types ─────────────────────────────────────────────────────────────────────

/// Top-level configuration of a data plane runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    /// Identity used as lease holder. Must be unique per running process.
    pub runtime_id: String,
    pub state_machine: StateMachineConfig,
    pub transfer: TransferConfig,
    pub retry: RetryConfig,
    pub lease: LeaseConfig,
    pub server: ServerConfig,
    pub public: PublicApiConfig,
    pub provisioning: ProvisioningConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateMachineConfig {
    /// Sleep between ticks that found no work.
    pub iteration_wait_ms: u64,
    /// Upper bound for the idle wait while ticks keep failing.
    pub max_iteration_wait_ms: u64,
    /// Flows leased per state per tick.
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Size of the transfer worker pool.
    pub threads: usize,
    /// Parts a sink writes concurrently.
    pub sink_parallelism: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub send_retry_limit: u32,
    pub send_retry_base_delay_ms: u64,
    pub send_retry_max_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Nominal ownership window of a lease.
    pub flow_lease_time_ms: u64,
    /// `abandon time = lease time * factor`.
    pub flow_lease_factor: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublicApiConfig {
    /// Base URL consumers use to fetch PULL data.
    pub base_url: String,
    pub token_ttl_secs: u64,
    /// Base64 Ed25519 seed written by `ferry keygen`. A fresh key is generated
    /// when absent, which invalidates tokens on restart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Root for staging directories. Staging is disabled when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging_root: Option<PathBuf>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for FerryConfig {
    fn default() -> Self {
        FerryConfig {
            runtime_id: crate::new_id(),
            state_machine: StateMachineConfig::default(),
            transfer: TransferConfig::default(),
            retry: RetryConfig::default(),
            lease: LeaseConfig::default(),
            server: ServerConfig::default(),
            public: PublicApiConfig::default(),
            provisioning: ProvisioningConfig::default(),
        }
    }
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        StateMachineConfig {
            iteration_wait_ms: 1_000,
            max_iteration_wait_ms: 30_000,
            batch_size: 20,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            threads: 32,
            sink_parallelism: 4,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            send_retry_limit: 7,
            send_retry_base_delay_ms: 1_000,
            send_retry_max_delay_ms: 60_000,
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        LeaseConfig {
            flow_lease_time_ms: 500,
            flow_lease_factor: 5,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig { port: 8181 }
    }
}

impl Default for PublicApiConfig {
    fn default() -> Self {
        PublicApiConfig {
            base_url: "http://localhost:8181/public".to_string(),
            token_ttl_secs: 3_600,
            signing_key_path: None,
        }
    }
}

// ── Accessors ─────────────────────────────────────────────────────────────────

impl StateMachineConfig {
    pub fn iteration_wait(&self) -> Duration {
        Duration::from_millis(self.iteration_wait_ms)
    }

    pub fn max_iteration_wait(&self) -> Duration {
        Duration::from_millis(self.max_iteration_wait_ms)
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> RetryBackoff {
        RetryBackoff::new(
            Duration::from_millis(self.send_retry_base_delay_ms),
            Duration::from_millis(self.send_retry_max_delay_ms),
        )
    }
}

impl LeaseConfig {
    pub fn new(lease_time: Duration, factor: u32) -> Self {
        LeaseConfig {
            flow_lease_time_ms: lease_time.as_millis() as u64,
            flow_lease_factor: factor,
        }
    }

    pub fn lease_time(&self) -> Duration {
        Duration::from_millis(self.flow_lease_time_ms)
    }

    /// Time after which another runtime may reclaim a flow.
    pub fn abandon_time(&self) -> Duration {
        self.lease_time()
            .saturating_mul(self.flow_lease_factor.max(1))
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FerryConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from `path` (defaults when `None`), apply `FERRY_*` environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|source| ConfigError::Read {
                    path: p.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&content)?
            }
            None => FerryConfig::default(),
        };
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `FERRY_*` overrides from the given variables.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if !key.starts_with("FERRY_") {
                continue;
            }
            match key.as_str() {
                "FERRY_RUNTIME_ID" => self.runtime_id = value,
                "FERRY_ITERATION_WAIT_MS" => {
                    self.state_machine.iteration_wait_ms = parse_env(&key, &value)?
                }
                "FERRY_BATCH_SIZE" => self.state_machine.batch_size = parse_env(&key, &value)?,
                "FERRY_TRANSFER_THREADS" => self.transfer.threads = parse_env(&key, &value)?,
                "FERRY_SEND_RETRY_LIMIT" => {
                    self.retry.send_retry_limit = parse_env(&key, &value)?
                }
                "FERRY_SEND_RETRY_BASE_DELAY_MS" => {
                    self.retry.send_retry_base_delay_ms = parse_env(&key, &value)?
                }
                "FERRY_FLOW_LEASE_TIME_MS" => {
                    self.lease.flow_lease_time_ms = parse_env(&key, &value)?
                }
                "FERRY_FLOW_LEASE_FACTOR" => {
                    self.lease.flow_lease_factor = parse_env(&key, &value)?
                }
                "FERRY_PORT" => self.server.port = parse_env(&key, &value)?,
                "FERRY_PUBLIC_BASE_URL" => self.public.base_url = value,
                "FERRY_TOKEN_TTL_SECS" => self.public.token_ttl_secs = parse_env(&key, &value)?,
                "FERRY_SIGNING_KEY_PATH" => {
                    self.public.signing_key_path = Some(PathBuf::from(value))
                }
                "FERRY_STAGING_ROOT" => {
                    self.provisioning.staging_root = Some(PathBuf::from(value))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        if self.runtime_id.trim().is_empty() {
            errors.push("runtime_id must not be empty".to_string());
        }
        if self.state_machine.batch_size == 0 {
            errors.push("state_machine.batch_size must be at least 1".to_string());
        }
        if self.transfer.threads == 0 {
            errors.push("transfer.threads must be at least 1".to_string());
        }
        if self.transfer.sink_parallelism == 0 {
            errors.push("transfer.sink_parallelism must be at least 1".to_string());
        }
        if self.lease.flow_lease_time_ms == 0 {
            errors.push("lease.flow_lease_time_ms must be positive".to_string());
        }
        if self.lease.flow_lease_factor == 0 {
            errors.push("lease.flow_lease_factor must be at least 1".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors.join("; ")))
        }
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key: key.to_string(),
        value: value.to_string(),
    })
}
