use thiserror::Error;

use crate::quota::QuotaRejection;

/// Message fragments that mark an error as a transient network or timeout
/// failure when no structured status is available.
const TRANSIENT_PATTERNS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "connection",
    "econnreset",
    "fetch failed",
    "temporarily unavailable",
];

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Unauthenticated: sign in to generate images")]
    Unauthenticated,
    #[error("A user id is required to generate images")]
    UserRequired,
    #[error("Image conversion failed: {0}")]
    ImageConversion(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out: {0}")]
    RequestTimeout(String),
    #[error("Generation service rejected the request ({status}): {message}")]
    Remote { status: u16, message: String },
    #[error("Invalid response from generation service: {0}")]
    InvalidResponse(String),
    #[error("{0}")]
    JobFailed(String),
    #[error("Generation timed out after {attempts} status checks")]
    TimedOut { attempts: u32 },
    #[error("{0}")]
    QuotaExceeded(QuotaRejection),
    #[error("Generation cancelled")]
    Cancelled,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Strategy for handling errors in a retry context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorRetryStrategy {
    /// Retry with exponential backoff (network, timeouts, server errors)
    Retry,
    /// Failed permanently
    Fail,
}

impl GenerationError {
    pub fn to_retry_strategy(&self) -> ErrorRetryStrategy {
        match self {
            Self::Network(_) | Self::RequestTimeout(_) => ErrorRetryStrategy::Retry,
            Self::Remote { status, message } => {
                // 408, 429 and 5xx are the remote queue being busy or flaky
                if *status == 408 || *status == 429 || (500..600).contains(status) {
                    ErrorRetryStrategy::Retry
                } else if is_transient_message(message) {
                    ErrorRetryStrategy::Retry
                } else {
                    ErrorRetryStrategy::Fail
                }
            }
            Self::InvalidResponse(message) if is_transient_message(message) => {
                ErrorRetryStrategy::Retry
            }
            _ => ErrorRetryStrategy::Fail,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.to_retry_strategy() == ErrorRetryStrategy::Retry
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GenerationError::RequestTimeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            GenerationError::Network(err.to_string())
        } else if err.is_decode() {
            GenerationError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            GenerationError::Remote {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            GenerationError::Network(err.to_string())
        }
    }
}

pub fn is_transient_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    TRANSIENT_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}
