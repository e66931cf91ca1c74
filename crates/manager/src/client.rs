//! Callbacks to the control plane.
//!
//! The manager reports four milestones of a transfer process. The HTTP
//! client POSTs a JSON body to
//! `<callback_address>/transferprocess/<process_id>/<event>`.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use ferry_core::{DataAddress, DataFlow, DataFlowState, RetryBackoff};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferProcessEvent {
    Provisioned,
    Started,
    Completed,
    Failed,
}

impl TransferProcessEvent {
    pub fn path_segment(self) -> &'static str {
        match self {
            TransferProcessEvent::Provisioned => "provisioned",
            TransferProcessEvent::Started => "started",
            TransferProcessEvent::Completed => "completed",
            TransferProcessEvent::Failed => "failed",
        }
    }
}

impl fmt::Display for TransferProcessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{url} answered {status}")]
    Status { url: String, status: u16 },

    #[error("request to {url} failed: {detail}")]
    Transport { url: String, detail: String },

    #[error("callback task failed: {0}")]
    Join(String),
}

impl ClientError {
    /// Transport errors, 408, 429 and 5xx are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            ClientError::Transport { .. } => true,
            ClientError::Join(_) => false,
        }
    }
}

/// Body of every callback.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProcessMessage {
    pub flow_id: String,
    pub process_id: String,
    pub event: TransferProcessEvent,
    pub state: DataFlowState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_address: Option<DataAddress>,
}

impl TransferProcessMessage {
    pub fn new(flow: &DataFlow, event: TransferProcessEvent) -> Self {
        TransferProcessMessage {
            flow_id: flow.id.clone(),
            process_id: flow.process_id.clone(),
            event,
            state: flow.state,
            error_detail: flow.error_detail.clone(),
            data_address: flow.endpoint_data_reference.clone(),
        }
    }
}

#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    async fn notify(&self, flow: &DataFlow, event: TransferProcessEvent) -> Result<(), ClientError>;

    async fn provisioned(&self, flow: &DataFlow) -> Result<(), ClientError> {
        self.notify(flow, TransferProcessEvent::Provisioned).await
    }

    async fn started(&self, flow: &DataFlow) -> Result<(), ClientError> {
        self.notify(flow, TransferProcessEvent::Started).await
    }

    async fn completed(&self, flow: &DataFlow) -> Result<(), ClientError> {
        self.notify(flow, TransferProcessEvent::Completed).await
    }

    async fn failed(&self, flow: &DataFlow) -> Result<(), ClientError> {
        self.notify(flow, TransferProcessEvent::Failed).await
    }
}

/// Drops every notification. Used when no control plane is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopControlPlaneClient;

#[async_trait]
impl ControlPlaneClient for NoopControlPlaneClient {
    async fn notify(&self, flow: &DataFlow, event: TransferProcessEvent) -> Result<(), ClientError> {
        debug!(flow_id = %flow.id, %event, "control plane notification dropped");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpControlPlaneClient {
    agent: ureq::Agent,
    backoff: RetryBackoff,
    max_attempts: u32,
}

impl HttpControlPlaneClient {
    pub fn new(backoff: RetryBackoff, max_attempts: u32) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(30)))
            .build();
        HttpControlPlaneClient {
            agent: config.into(),
            backoff,
            max_attempts: max_attempts.max(1),
        }
    }

    async fn post_once(&self, url: &str, body: &TransferProcessMessage) -> Result<(), ClientError> {
        let agent = self.agent.clone();
        let url = url.to_string();
        let body = body.clone();
        tokio::task::spawn_blocking(move || {
            agent
                .post(&url)
                .send_json(&body)
                .map(|_| ())
                .map_err(|e| match e {
                    ureq::Error::StatusCode(status) => ClientError::Status { url, status },
                    other => ClientError::Transport {
                        url,
                        detail: other.to_string(),
                    },
                })
        })
        .await
        .map_err(|e| ClientError::Join(e.to_string()))?
    }
}

pub fn callback_url(base: &str, process_id: &str, event: TransferProcessEvent) -> String {
    format!(
        "{}/transferprocess/{}/{}",
        base.trim_end_matches('/'),
        process_id,
        event.path_segment()
    )
}

#[async_trait]
impl ControlPlaneClient for HttpControlPlaneClient {
    async fn notify(&self, flow: &DataFlow, event: TransferProcessEvent) -> Result<(), ClientError> {
        let Some(base) = flow.callback_address.as_deref() else {
            debug!(flow_id = %flow.id, %event, "no callback address, skipping notification");
            return Ok(());
        };
        let url = callback_url(base, &flow.process_id, event);
        let body = TransferProcessMessage::new(flow, event);

        let mut attempt = 0;
        loop {
            match self.post_once(&url, &body).await {
                Ok(()) => {
                    debug!(flow_id = %flow.id, %event, attempt, "control plane notified");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    attempt += 1;
                    let delay = self.backoff.delay_for(attempt);
                    warn!(flow_id = %flow.id, %event, attempt, error = %e, "callback failed, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
