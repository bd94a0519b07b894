use std::time::Duration;
use thiserror::Error;

/// Wire-level failure of a single call against the coordination service or a
/// pre-signed part URL.
///
/// Display strings never contain the URL that was called.
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    #[error("Backend refused to open transfer (HTTP {status}): {message}")]
    Initiation { status: u16, message: String },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Part upload succeeded but response carried no ETag header")]
    MissingEtag,

    #[error("Backend refused to complete transfer (HTTP {status}): {message}")]
    Completion { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl TransferError {
    /// Network errors, timeouts, 5xx and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Network(_) | TransferError::Timeout(_) => true,
            TransferError::Http { status, .. } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            TransferError::Initiation { status, .. }
            | TransferError::Http { status, .. }
            | TransferError::Completion { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        // reqwest embeds the request URL in its Display output; strip it.
        let err = err.without_url();
        if err.is_timeout() {
            TransferError::Network(format!("request timed out: {err}"))
        } else if err.is_decode() {
            TransferError::Decode(err.to_string())
        } else {
            TransferError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Decode(err.to_string())
    }
}

pub type TransferResult<T> = Result<T, TransferError>;
