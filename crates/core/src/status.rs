//! Outcome types for scheduler handlers and transfers.
//!
//! Handlers never throw past their boundary: every outcome is a
//! [`StatusResult`], and the retry/fatal distinction travels in its
//! [`ResponseStatus`]. Transfers report [`StreamResult`]s whose failures are
//! typed by [`FailureReason`].

use std::fmt;

use serde::{Deserialize, Serialize};

// ──────────────────────────────────────────────
// StatusResult
// ──────────────────────────────────────────────

/// Whether a failed operation may be attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    /// Transient failure; retry with backoff until the retry limit.
    ErrorRetry,
    /// Permanent failure; no retry.
    FatalError,
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseStatus::ErrorRetry => write!(f, "ERROR_RETRY"),
            ResponseStatus::FatalError => write!(f, "FATAL_ERROR"),
        }
    }
}

/// The failure half of a [`StatusResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFailure {
    pub status: ResponseStatus,
    pub detail: String,
}

impl StatusFailure {
    pub fn retry(detail: impl Into<String>) -> Self {
        StatusFailure {
            status: ResponseStatus::ErrorRetry,
            detail: detail.into(),
        }
    }

    pub fn fatal(detail: impl Into<String>) -> Self {
        StatusFailure {
            status: ResponseStatus::FatalError,
            detail: detail.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.status == ResponseStatus::ErrorRetry
    }
}

impl fmt::Display for StatusFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.detail)
    }
}

impl std::error::Error for StatusFailure {}

/// Result of a handler-level operation (provisioning, notification, ...).
pub type StatusResult<T> = Result<T, StatusFailure>;

// ──────────────────────────────────────────────
// StreamResult
// ──────────────────────────────────────────────

/// Typed reason for a failed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    GeneralError,
    NotFound,
    /// Authentication or authorization failure at the source or sink.
    NotAuthorized,
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::GeneralError => "GENERAL_ERROR",
            FailureReason::NotFound => "NOT_FOUND",
            FailureReason::NotAuthorized => "NOT_AUTHORIZED",
            FailureReason::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// A failed transfer. `retryable` separates transient I/O trouble from
/// failures a DataSource/DataSink declared permanent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFailure {
    pub reason: FailureReason,
    pub retryable: bool,
    pub detail: String,
}

impl StreamFailure {
    /// Transient failure (network hiccup, interrupted read).
    pub fn general(detail: impl Into<String>) -> Self {
        StreamFailure {
            reason: FailureReason::GeneralError,
            retryable: true,
            detail: detail.into(),
        }
    }

    /// Permanent failure that is not better described by another reason.
    pub fn fatal(detail: impl Into<String>) -> Self {
        StreamFailure {
            reason: FailureReason::GeneralError,
            retryable: false,
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        StreamFailure {
            reason: FailureReason::NotFound,
            retryable: false,
            detail: detail.into(),
        }
    }

    pub fn not_authorized(detail: impl Into<String>) -> Self {
        StreamFailure {
            reason: FailureReason::NotAuthorized,
            retryable: false,
            detail: detail.into(),
        }
    }

    pub fn cancelled(detail: impl Into<String>) -> Self {
        StreamFailure {
            reason: FailureReason::Cancelled,
            retryable: false,
            detail: detail.into(),
        }
    }

    /// Classify an I/O error the way sources and sinks report it.
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        let detail = format!("{context}: {err}");
        match err.kind() {
            ErrorKind::NotFound => StreamFailure::not_found(detail),
            ErrorKind::PermissionDenied => StreamFailure::not_authorized(detail),
            _ => StreamFailure::general(detail),
        }
    }
}

impl fmt::Display for StreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.detail)
    }
}

impl std::error::Error for StreamFailure {}

impl From<StreamFailure> for StatusFailure {
    fn from(failure: StreamFailure) -> Self {
        let detail = failure.to_string();
        if failure.retryable {
            StatusFailure::retry(detail)
        } else {
            StatusFailure::fatal(detail)
        }
    }
}

/// Result of a transfer.
pub type StreamResult<T> = Result<T, StreamFailure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_reasons() {
        let nf = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let failure = StreamFailure::from_io("open", &nf);
        assert_eq!(failure.reason, FailureReason::NotFound);
        assert!(!failure.retryable);

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert_eq!(
            StreamFailure::from_io("open", &denied).reason,
            FailureReason::NotAuthorized
        );

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let failure = StreamFailure::from_io("read", &reset);
        assert_eq!(failure.reason, FailureReason::GeneralError);
        assert!(failure.retryable);
        assert_eq!(failure.detail, "read: reset");
    }

    #[test]
    fn stream_failure_keeps_retry_distinction() {
        let retry: StatusFailure = StreamFailure::general("flaky").into();
        assert_eq!(retry.status, ResponseStatus::ErrorRetry);

        let fatal: StatusFailure = StreamFailure::not_found("missing").into();
        assert_eq!(fatal.status, ResponseStatus::FatalError);
        assert_eq!(fatal.detail, "NOT_FOUND: missing");
    }

    #[test]
    fn status_display() {
        assert_eq!(
            StatusFailure::retry("store busy").to_string(),
            "ERROR_RETRY: store busy"
        );
    }
}
