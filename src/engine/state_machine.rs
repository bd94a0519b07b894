use crate::engine::error::{EngineError, EngineResult};
use crate::session::{UploadSession, UploadStatus};

/// Requests that move an upload between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Pause,
    Resume,
    /// Take over a persisted record after a restart.
    Reattach,
    Complete,
    Fail,
    Cancel,
}

/// Next status for `transition` from `current`, or an error if the move is
/// not allowed.
pub fn next_status(current: UploadStatus, transition: Transition) -> EngineResult<UploadStatus> {
    use Transition::*;
    use UploadStatus::*;

    let next = match (current, transition) {
        (Uploading, Pause) => Paused,
        (Paused, Resume) => Uploading,
        (Uploading | Paused, Reattach) => Uploading,
        (Uploading, Complete) => Completed,
        (Uploading | Paused, Fail) => Failed,
        (Uploading | Paused, Cancel) => Cancelled,
        _ => {
            return Err(EngineError::InvalidStateTransition(format!(
                "cannot {transition:?} an upload that is {current}"
            )));
        }
    };
    Ok(next)
}

/// Apply `transition` to the session, touching `last_activity`.
pub fn apply(session: &mut UploadSession, transition: Transition) -> EngineResult<UploadStatus> {
    let next = next_status(session.status, transition)?;
    tracing::debug!(
        upload_id = %session.upload_id,
        from = %session.status,
        to = %next,
        "upload status transition"
    );
    session.status = next;
    session.touch();
    Ok(next)
}
