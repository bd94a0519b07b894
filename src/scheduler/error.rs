use crate::transfer::TransferError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The run's cancellation signal fired. Not a failure.
    #[error("Upload run cancelled")]
    Cancelled,

    #[error("Part {part_number} failed after {attempts} attempt(s): {source}")]
    PartFailed {
        part_number: u32,
        attempts: u32,
        #[source]
        source: TransferError,
    },

    #[error("Invalid upload configuration: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl SchedulerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SchedulerError::Cancelled)
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
