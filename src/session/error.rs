use thiserror::Error;

/// Local persistence failure. Degrades resumability but never aborts an
/// in-flight transfer on its own.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Corrupt session record {upload_id}: {reason}")]
    CorruptRecord { upload_id: String, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError(err.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
