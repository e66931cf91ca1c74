use ferry_core::{FlowError, StatusFailure, StreamFailure};

/// Errors raised before a transfer starts: unknown address types, invalid
/// addresses, a closed pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("no data source factory for address type '{0}'")]
    UnknownSourceType(String),

    #[error("no data sink factory for address type '{0}'")]
    UnknownSinkType(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("pipeline is closed")]
    Closed,
}

impl From<PipelineError> for FlowError {
    fn from(err: PipelineError) -> Self {
        FlowError::Configuration(err.to_string())
    }
}

impl From<PipelineError> for StatusFailure {
    fn from(err: PipelineError) -> Self {
        FlowError::from(err).into()
    }
}

impl From<PipelineError> for StreamFailure {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Closed => StreamFailure::cancelled(err.to_string()),
            other => StreamFailure::fatal(FlowError::from(other).to_string()),
        }
    }
}
