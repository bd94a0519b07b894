pub mod error;
pub mod store;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use store::SessionStore;
pub use types::{UploadSession, UploadStatus, UploadedChunk};
