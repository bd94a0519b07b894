use crate::session::{UploadSession, UploadStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UploadEventKind {
    Progress,
    Complete {
        #[serde(rename = "finalKey")]
        final_key: String,
    },
    Paused,
    Cancelled,
    /// `retryable` tells the host whether starting a fresh upload may help.
    Error { message: String, retryable: bool },
}

/// Notification pushed to whoever hosts the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadEvent {
    #[serde(flatten)]
    pub kind: UploadEventKind,
    pub project_id: String,
    pub upload_id: String,
    pub status: UploadStatus,
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub progress: u8,
    /// Human-readable description of the current step.
    pub step: String,
}

impl UploadEvent {
    pub fn from_session(session: &UploadSession, kind: UploadEventKind, step: impl Into<String>) -> Self {
        Self {
            kind,
            project_id: session.project_id.clone(),
            upload_id: session.upload_id.clone(),
            status: session.status,
            bytes_uploaded: session.bytes_uploaded(),
            total_bytes: session.file_size,
            progress: session.progress,
            step: step.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            UploadEventKind::Complete { .. } | UploadEventKind::Cancelled | UploadEventKind::Error { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let session = UploadSession::new(
            "project-1".into(),
            "upload-1".into(),
            "uploads/project-1/a.mp4".into(),
            "a.mp4".into(),
            100,
            "video/mp4".into(),
            10,
            vec![],
        );
        let event = UploadEvent::from_session(
            &session,
            UploadEventKind::Complete {
                final_key: "uploads/project-1/a.mp4".into(),
            },
            "Upload complete",
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "complete");
        assert_eq!(json["finalKey"], "uploads/project-1/a.mp4");
        assert_eq!(json["projectId"], "project-1");
        assert_eq!(json["status"], "uploading");
        assert!(event.is_terminal());
    }
}
