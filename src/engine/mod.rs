pub mod engine;
pub mod error;
pub mod state_machine;
pub mod types;

pub use engine::UploadEngine;
pub use error::{sanitize_message, EngineError, EngineResult};
pub use state_machine::Transition;
pub use types::{ResumeWithFileRequest, StartRequest};
