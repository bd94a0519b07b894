use crate::session::UploadedChunk;
use crate::transfer::error::TransferResult;
use crate::transfer::types::{InitiateRequest, InitiatedTransfer, PartReceipt};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::time::Duration;

/// Wire-level operations against the coordination service and the object
/// store behind it.
///
/// Every call may fail transiently; retry policy lives in the scheduler, not
/// here. Implementations must be cheap to share behind an `Arc`.
pub trait TransferClient: Send + Sync {
    /// Open a multipart transfer. Non-success status maps to
    /// [`TransferError::Initiation`](crate::transfer::TransferError::Initiation).
    fn initiate_transfer(
        &self,
        request: InitiateRequest,
    ) -> BoxFuture<'_, TransferResult<InitiatedTransfer>>;

    /// PUT one part to its pre-signed URL. The request is dropped at
    /// `deadline` and reported as a timeout.
    fn upload_part<'a>(
        &'a self,
        url: &'a str,
        data: Bytes,
        deadline: Duration,
    ) -> BoxFuture<'a, TransferResult<PartReceipt>>;

    fn list_uploaded_parts<'a>(
        &'a self,
        destination_key: &'a str,
        upload_id: &'a str,
    ) -> BoxFuture<'a, TransferResult<Vec<UploadedChunk>>>;

    /// Finalize the transfer. `parts` are sent exactly as given; callers
    /// must already have sorted them ascending.
    fn complete_transfer<'a>(
        &'a self,
        destination_key: &'a str,
        upload_id: &'a str,
        parts: &'a [UploadedChunk],
    ) -> BoxFuture<'a, TransferResult<String>>;

    fn abort_transfer<'a>(
        &'a self,
        destination_key: &'a str,
        upload_id: &'a str,
    ) -> BoxFuture<'a, TransferResult<()>>;
}
