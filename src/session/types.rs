use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Uploading => "uploading",
            UploadStatus::Paused => "paused",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Cancelled
        )
    }

    /// Statuses a persisted record may be resumed from after a restart.
    pub fn is_resumable(&self) -> bool {
        matches!(self, UploadStatus::Uploading | UploadStatus::Paused)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(UploadStatus::Uploading),
            "paused" => Ok(UploadStatus::Paused),
            "completed" => Ok(UploadStatus::Completed),
            "failed" => Ok(UploadStatus::Failed),
            "cancelled" => Ok(UploadStatus::Cancelled),
            other => Err(format!("unknown upload status `{other}`")),
        }
    }
}

/// One part acknowledged by the storage backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadedChunk {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// Durable state of one multipart upload.
///
/// `parts` is kept sorted by `part_number` and unique by it; use
/// [`UploadSession::record_part`] rather than pushing directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub project_id: String,
    pub upload_id: String,
    pub destination_key: String,
    pub parts: Vec<UploadedChunk>,
    pub next_part_number: u32,
    pub status: UploadStatus,
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub file_size: u64,
    pub file_name: String,
    pub mime_type: String,
    pub chunk_size: u64,
    pub part_urls: Vec<String>,
    pub error: Option<String>,
}

impl UploadSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_id: String,
        upload_id: String,
        destination_key: String,
        file_name: String,
        file_size: u64,
        mime_type: String,
        chunk_size: u64,
        part_urls: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            project_id,
            upload_id,
            destination_key,
            parts: Vec::new(),
            next_part_number: 1,
            status: UploadStatus::Uploading,
            progress: 0,
            started_at: now,
            last_activity: now,
            file_size,
            file_name,
            mime_type,
            chunk_size,
            part_urls,
            error: None,
        }
    }

    /// Insert or replace the record for `chunk.part_number` and recompute progress.
    pub fn record_part(&mut self, chunk: UploadedChunk) {
        self.next_part_number = self.next_part_number.max(chunk.part_number + 1);
        match self
            .parts
            .binary_search_by_key(&chunk.part_number, |p| p.part_number)
        {
            Ok(idx) => self.parts[idx] = chunk,
            Err(idx) => self.parts.insert(idx, chunk),
        }
        self.recompute_progress();
        self.touch();
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.parts.iter().map(|p| p.size).sum()
    }

    /// Fraction of `file_size` covered by recorded parts, in `[0, 1]`.
    pub fn coverage(&self) -> f64 {
        if self.file_size == 0 {
            return if self.parts.is_empty() { 0.0 } else { 1.0 };
        }
        (self.bytes_uploaded() as f64 / self.file_size as f64).min(1.0)
    }

    pub fn recompute_progress(&mut self) {
        let computed = if self.file_size == 0 {
            if self.parts.is_empty() {
                0
            } else {
                100
            }
        } else {
            ((self.bytes_uploaded().min(self.file_size) * 100) / self.file_size) as u8
        };
        self.progress = computed;
    }

    pub fn has_part(&self, part_number: u32) -> bool {
        self.parts
            .binary_search_by_key(&part_number, |p| p.part_number)
            .is_ok()
    }

    /// Parts in strictly ascending `part_number` order, as completion requires.
    pub fn sorted_parts(&self) -> Vec<UploadedChunk> {
        let mut parts = self.parts.clone();
        parts.sort_by_key(|p| p.part_number);
        parts.dedup_by_key(|p| p.part_number);
        parts
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}
