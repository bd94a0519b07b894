//! Resumable multipart uploads of large files to object storage.
//!
//! [`UploadEngine`] drives each upload through a bounded pool of part
//! workers, persists progress in a [`SessionStore`] after every
//! acknowledged part, and publishes [`UploadEvent`]s to its host. Uploads
//! interrupted by a restart can be picked up again with the original file,
//! or finalized from recorded parts when nearly complete.

pub mod config;
pub mod engine;
pub mod events;
pub mod metrics;
pub mod scheduler;
pub mod session;
pub mod transfer;

pub use config::EngineConfig;
pub use engine::{EngineError, EngineResult, ResumeWithFileRequest, StartRequest, UploadEngine};
pub use events::{UploadEvent, UploadEventKind};
pub use session::{SessionStore, UploadSession, UploadStatus, UploadedChunk};
pub use transfer::{HttpTransferClient, TransferClient};
