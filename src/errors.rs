use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("REMOTE_UNAVAILABLE: {0}")]
    RemoteUnavailable(String),
    #[error("UNAUTHORIZED: {0}")]
    Unauthorized(String),
    #[error("INVALID_FILTER_VALUE: {0}")]
    InvalidFilterValue(String),
    #[error("RELEVANCE_FETCH_FAILED: {0}")]
    RelevanceFetchFailed(String),
    #[error("POLICY_DENIED: {0}")]
    Policy(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl SyncError {
    /// Transport-level failures are the only ones worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteUnavailable(_))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(value: std::io::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for SyncError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
