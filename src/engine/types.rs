use crate::transfer::InitiatedTransfer;
use std::path::PathBuf;

/// Parameters for a fresh upload.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub file_path: PathBuf,
    pub project_id: String,
    /// Object key to request from the backend.
    pub destination: Option<String>,
    /// Overrides the type guessed from the file extension.
    pub mime_type: Option<String>,
    /// Transfer the host already opened; skips `initiate_transfer`.
    pub initiated: Option<InitiatedTransfer>,
}

impl StartRequest {
    pub fn new(file_path: impl Into<PathBuf>, project_id: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            project_id: project_id.into(),
            destination: None,
            mime_type: None,
            initiated: None,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_initiated(mut self, initiated: InitiatedTransfer) -> Self {
        self.initiated = Some(initiated);
        self
    }
}

/// Parameters for picking up a persisted upload with its original file.
#[derive(Debug, Clone)]
pub struct ResumeWithFileRequest {
    pub file_path: PathBuf,
    pub project_id: String,
    pub upload_id: String,
    /// Fresh pre-signed URLs, for when the stored ones have expired.
    pub part_urls: Option<Vec<String>>,
}

impl ResumeWithFileRequest {
    pub fn new(
        file_path: impl Into<PathBuf>,
        project_id: impl Into<String>,
        upload_id: impl Into<String>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            project_id: project_id.into(),
            upload_id: upload_id.into(),
            part_urls: None,
        }
    }

    pub fn with_part_urls(mut self, part_urls: Vec<String>) -> Self {
        self.part_urls = Some(part_urls);
        self
    }
}

/// Kind of per-project operation currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProjectOp {
    Starting,
    Resuming,
    Cancelling,
}
