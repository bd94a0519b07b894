pub mod channel;
pub mod types;

pub use channel::EventChannel;
pub use types::{UploadEvent, UploadEventKind};
