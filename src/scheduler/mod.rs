pub mod error;
pub mod plan;
pub mod retry;
pub mod scheduler;
pub mod source;

pub use error::{SchedulerError, SchedulerResult};
pub use plan::{PartPlan, PartRange};
pub use retry::RetryPolicy;
pub use scheduler::{ChunkScheduler, RunSummary, SchedulerConfig, UploadJob};
pub use source::{guess_mime_type, FileSource};
