use crate::scheduler::SchedulerError;
use crate::session::StorageError;
use crate::transfer::TransferError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Could not open upload: {0}")]
    Initiation(#[source] TransferError),

    #[error("Part upload failed: {0}")]
    PartUpload(#[source] SchedulerError),

    #[error("Could not finalize upload: {0}")]
    Completion(#[source] TransferError),

    #[error("Upload cancelled")]
    Cancelled,

    #[error("File does not match the upload session: {0}")]
    Validation(String),

    #[error("Session storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error("Upload {0} is not resident in this process; resume it with the original file")]
    NotResident(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("A resume is already in progress for project {0}")]
    ResumeInProgress(String),

    #[error("An upload is already in progress for project {0}")]
    AlreadyInProgress(String),

    #[error("Original file required to resume upload {upload_id}: only {coverage_percent}% was uploaded")]
    OriginalFileRequired {
        upload_id: String,
        coverage_percent: u8,
    },

    #[error("Invalid upload configuration: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether starting a fresh upload could plausibly succeed.
    ///
    /// Backend rejections with a 4xx status (quota, auth, bad request) are
    /// final; everything transient is worth another `start`.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Initiation(e) | EngineError::Completion(e) => match e.status() {
                Some(status) => status >= 500 || status == 408 || status == 429,
                None => true,
            },
            EngineError::PartUpload(e) => !matches!(e, SchedulerError::Configuration(_)),
            EngineError::Storage(_) | EngineError::Io(_) | EngineError::OriginalFileRequired { .. } => true,
            _ => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Initiation(_) => "initiation",
            EngineError::PartUpload(_) => "part_upload",
            EngineError::Completion(_) => "completion",
            EngineError::Cancelled => "cancelled",
            EngineError::Validation(_) => "validation",
            EngineError::Storage(_) => "storage",
            EngineError::NotFound(_) | EngineError::NotResident(_) => "not_found",
            EngineError::InvalidStateTransition(_) => "invalid_state",
            EngineError::ResumeInProgress(_) | EngineError::AlreadyInProgress(_) => "busy",
            EngineError::OriginalFileRequired { .. } => "original_file_required",
            EngineError::Configuration(_) => "configuration",
            EngineError::Io(_) => "io",
        }
    }
}

impl From<SchedulerError> for EngineError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Cancelled => EngineError::Cancelled,
            SchedulerError::Configuration(msg) => EngineError::Configuration(msg),
            other => EngineError::PartUpload(other),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Strip anything that looks like a URL from a message meant for the host.
/// Pre-signed URLs carry credentials in their query string.
pub fn sanitize_message(message: &str) -> String {
    message
        .split(' ')
        .map(|word| {
            if word.contains("http://") || word.contains("https://") {
                "<redacted-url>"
            } else {
                word
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_message_redacts_urls() {
        let msg = "PUT https://bucket.s3.amazonaws.com/key?X-Amz-Signature=abc failed";
        assert_eq!(sanitize_message(msg), "PUT <redacted-url> failed");
        assert_eq!(sanitize_message("plain message"), "plain message");
    }

    #[test]
    fn test_retryability() {
        let quota = EngineError::Initiation(TransferError::Initiation {
            status: 403,
            message: "quota exceeded".into(),
        });
        assert!(!quota.is_retryable());

        let outage = EngineError::Completion(TransferError::Completion {
            status: 502,
            message: "bad gateway".into(),
        });
        assert!(outage.is_retryable());

        assert!(!EngineError::Validation("size".into()).is_retryable());
        assert!(!EngineError::Configuration("urls".into()).is_retryable());
    }

    #[test]
    fn test_scheduler_errors_map_to_taxonomy() {
        assert!(matches!(
            EngineError::from(SchedulerError::Cancelled),
            EngineError::Cancelled
        ));
        assert!(matches!(
            EngineError::from(SchedulerError::Configuration("x".into())),
            EngineError::Configuration(_)
        ));
        assert!(matches!(
            EngineError::from(SchedulerError::PartFailed {
                part_number: 1,
                attempts: 3,
                source: TransferError::Timeout(std::time::Duration::from_secs(1)),
            }),
            EngineError::PartUpload(_)
        ));
    }
}
