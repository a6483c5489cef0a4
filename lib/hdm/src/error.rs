use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = HdmError> = std::result::Result<T, E>;

/// Error raised while validating a batch or item submission. Never reaches a worker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("batch must contain at least one item")]
    EmptyBatch,
    #[error("batch contains {count} items, exceeding batch_max_items ({max})")]
    TooManyItems { count: usize, max: usize },
    #[error("requested_by must not be blank")]
    BlankRequester,
    #[error("artist must not be blank")]
    BlankArtist,
    #[error("title must not be blank")]
    BlankTitle,
}

/// Configuration error: fatal to the owning operation, surfaced to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown placeholder '{0}' in move template")]
    UnknownPlaceholder(String),
    #[error("worker_concurrency must be > 0")]
    InvalidWorkerConcurrency,
    #[error("max_retries must be > 0")]
    InvalidMaxRetries,
    #[error("batch_max_items must be > 0")]
    InvalidBatchMaxItems,
    #[error("size_stable_seconds must be >= 1")]
    InvalidSizeStableSeconds,
    #[error("poll_interval must be >= 0.25 seconds")]
    InvalidPollInterval,
    #[error("{0}")]
    Other(String),
}

/// A transient failure in the remote transfer gateway or a pipeline stage; the worker
/// retries up to `max_retries` before treating it as a final failure.
#[derive(Debug, Error, Clone)]
#[error("{message}")]
pub struct RetryableDownloadError {
    pub message: String,
    pub retry_after_seconds: Option<f64>,
}

impl RetryableDownloadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    pub fn with_retry_after(message: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            message: message.into(),
            retry_after_seconds: Some(retry_after.as_secs_f64()),
        }
    }
}

/// A definitive peer failure, an unsupported response, or a stream that ended without
/// completing. Not retried.
#[derive(Debug, Error, Clone)]
#[error("{0}")]
pub struct FatalDownloadError(pub String);

impl FatalDownloadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Wraps an unexpected failure raised inside a pipeline stage. Treated as fatal unless
/// the underlying cause is a `RetryableDownloadError`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Retryable(#[from] RetryableDownloadError),
    #[error(transparent)]
    Fatal(#[from] FatalDownloadError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl PipelineError {
    /// Whether the worker should retry this failure.
    pub fn retry_after(&self) -> Option<Option<Duration>> {
        match self {
            PipelineError::Retryable(e) => {
                Some(e.retry_after_seconds.map(Duration::from_secs_f64))
            }
            _ => None,
        }
    }

    /// Class-name portion of the `"ClassName: message"`-shaped error string spec.md §7
    /// requires on every failed item, and that `item_failures_total{error_type}`/
    /// `item_retries_total{error_type}` key off of.
    pub fn class_name(&self) -> &'static str {
        match self {
            PipelineError::Retryable(_) => "RetryableDownloadError",
            PipelineError::Fatal(_) => "FatalDownloadError",
            PipelineError::Io(_) => "IoError",
            PipelineError::Gateway(_) => "GatewayError",
            PipelineError::Cancelled(_) => "Cancelled",
        }
    }

    /// The `"ClassName: message"` string recorded against the item and fed to the
    /// aggregator's error-type metrics.
    pub fn classified_message(&self) -> String {
        format!("{}: {}", self.class_name(), self)
    }
}

/// Errors surfaced by the remote transfer (Soulseek-style) gateway client.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    #[error("gateway not configured")]
    NotConfigured,
    #[error("invalid gateway url: {0}")]
    InvalidUrl(String),
    #[error("gateway request failed: {0}")]
    Request(String),
    #[error("gateway returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("gateway request timed out")]
    Timeout,
}

impl GatewayError {
    /// HTTP 429 and >=500 are retryable; everything else is fatal by default. An
    /// explicit `retryable` flag on the event payload, where present, overrides this.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Timeout => true,
            GatewayError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::Timeout
        } else {
            GatewayError::Request(e.to_string())
        }
    }
}

impl From<url::ParseError> for GatewayError {
    fn from(e: url::ParseError) -> Self {
        GatewayError::InvalidUrl(e.to_string())
    }
}

/// Top-level error type for orchestrator-facing operations.
#[derive(Debug, Error)]
pub enum HdmError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classified_message_prefixes_class_name() {
        let err: PipelineError = FatalDownloadError::new("stream terminated unexpectedly").into();
        assert_eq!(
            err.classified_message(),
            "FatalDownloadError: stream terminated unexpectedly"
        );
        let err: PipelineError = RetryableDownloadError::new("peer timed out").into();
        assert_eq!(err.classified_message(), "RetryableDownloadError: peer timed out");
    }

    #[test]
    fn gateway_error_retry_classification() {
        assert!(GatewayError::Timeout.is_retryable());
        assert!(GatewayError::Api { status: 429, message: "".into() }.is_retryable());
        assert!(GatewayError::Api { status: 503, message: "".into() }.is_retryable());
        assert!(!GatewayError::Api { status: 404, message: "".into() }.is_retryable());
        assert!(!GatewayError::NotConfigured.is_retryable());
    }
}
