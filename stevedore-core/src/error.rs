use thiserror::Error;

/// Common result type for core operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service not found: {0}")]
    NotFound(String),
    #[error("service already running: {0}")]
    AlreadyRunning(String),
    #[error("service is not running: {0}")]
    NotRunning(String),
    #[error("invalid instance name: {0}")]
    InvalidName(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("failed to start {service}: {reason}")]
    StartFailed { service: String, reason: String },
    #[error("binary missing for {service}: {path} (install a version first)")]
    BinaryMissing { service: String, path: String },
    #[error("process for {0} did not exit after forced termination")]
    StopTimeout(String),
    #[error("discovery error: {0}")]
    Discovery(String),
    #[error("template error: {0}")]
    Template(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("other error: {0}")]
    Other(String),
}

impl ServiceError {
    pub(crate) fn start_failed(service: &str, reason: impl Into<String>) -> Self {
        Self::StartFailed {
            service: service.to_string(),
            reason: reason.into(),
        }
    }

    /// True when the failure is the "binary missing" condition that the version
    /// management flow can fix.
    pub fn is_binary_missing(&self) -> bool {
        matches!(self, Self::BinaryMissing { .. })
    }
}
