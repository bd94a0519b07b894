use serde::{Deserialize, Serialize};

/// Parameters for opening a multipart transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub file_name: String,
    pub file_size: u64,
    pub project_id: String,
    pub mime_type: String,
    /// Requested object key; the backend picks one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_key: Option<String>,
}

/// An opened multipart transfer: one pre-signed URL per expected part.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InitiatedTransfer {
    pub upload_id: String,
    pub destination_key: String,
    pub part_urls: Vec<String>,
    pub chunk_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt {
    pub etag: String,
    pub bytes_sent: u64,
}
