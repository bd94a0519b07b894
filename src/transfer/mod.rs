pub mod client;
pub mod error;
pub mod http;
pub mod mock;
pub mod types;

pub use client::TransferClient;
pub use error::{TransferError, TransferResult};
pub use http::{HttpTransferClient, DEFAULT_REQUEST_TIMEOUT};
pub use mock::MockTransferClient;
pub use types::{InitiateRequest, InitiatedTransfer, PartReceipt};
