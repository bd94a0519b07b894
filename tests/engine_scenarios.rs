use resumable_upload::engine::{EngineError, ResumeWithFileRequest, StartRequest, UploadEngine};
use resumable_upload::events::{UploadEvent, UploadEventKind};
use resumable_upload::session::{SessionStore, UploadSession, UploadStatus, UploadedChunk};
use resumable_upload::transfer::{MockTransferClient, TransferError};
use resumable_upload::EngineConfig;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::broadcast;

const MB: u64 = 1024 * 1024;

fn create_test_config() -> EngineConfig {
    EngineConfig {
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        max_jitter: Duration::ZERO,
        ..Default::default()
    }
}

async fn create_test_store() -> Arc<SessionStore> {
    Arc::new(SessionStore::new_in_memory().await.unwrap())
}

fn create_test_engine(mock: &Arc<MockTransferClient>, store: &Arc<SessionStore>) -> UploadEngine {
    UploadEngine::new(mock.clone(), store.clone(), create_test_config()).unwrap()
}

fn create_test_file(len: u64) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    file.write_all(&data).unwrap();
    file.flush().unwrap();
    file
}

fn file_name(file: &NamedTempFile) -> String {
    file.path()
        .file_name()
        .unwrap()
        .to_string_lossy()
        .to_string()
}

/// Persisted record as a previous process would have left it.
fn create_persisted_session(
    project_id: &str,
    upload_id: &str,
    file: &NamedTempFile,
    file_size: u64,
    chunk_size: u64,
) -> UploadSession {
    let parts = file_size.div_ceil(chunk_size).max(1) as u32;
    UploadSession::new(
        project_id.into(),
        upload_id.into(),
        format!("uploads/{project_id}/{}", file_name(file)),
        file_name(file),
        file_size,
        "application/octet-stream".into(),
        chunk_size,
        MockTransferClient::part_urls(upload_id, parts),
    )
}

fn chunk(part_number: u32, size: u64) -> UploadedChunk {
    UploadedChunk {
        part_number,
        etag: format!("\"etag-{part_number}\""),
        size,
    }
}

async fn next_event<F>(rx: &mut broadcast::Receiver<UploadEvent>, mut matches: F) -> UploadEvent
where
    F: FnMut(&UploadEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for upload event")
}

async fn wait_for_terminal(rx: &mut broadcast::Receiver<UploadEvent>) -> UploadEvent {
    next_event(rx, |e| e.is_terminal()).await
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true")
}

fn part_numbers(parts: &[UploadedChunk]) -> Vec<u32> {
    parts.iter().map(|p| p.part_number).collect()
}

#[tokio::test]
async fn test_fresh_upload_of_three_parts() {
    let mock = Arc::new(MockTransferClient::new(10 * MB));
    let store = create_test_store().await;
    let engine = create_test_engine(&mock, &store);
    let mut events = engine.subscribe();
    let file = create_test_file(25 * MB);

    let upload_id = engine
        .start(StartRequest::new(file.path(), "project-a"))
        .await
        .unwrap();

    let mut progress = Vec::new();
    let done = next_event(&mut events, |e| {
        if e.kind == UploadEventKind::Progress {
            progress.push(e.progress);
        }
        e.is_terminal()
    })
    .await;

    assert_eq!(
        done.kind,
        UploadEventKind::Complete {
            final_key: format!("uploads/project-a/{}", file_name(&file))
        }
    );
    assert_eq!(done.progress, 100);
    assert_eq!(done.bytes_uploaded, 25 * MB);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {progress:?}");

    let initiated = mock.initiate_calls();
    assert_eq!(initiated.len(), 1);
    assert_eq!(initiated[0].file_size, 25 * MB);

    let mut uploaded = mock.uploaded_parts();
    uploaded.sort();
    assert_eq!(uploaded, vec![1, 2, 3]);

    let completed = mock.complete_calls();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].upload_id, upload_id);
    assert_eq!(part_numbers(&completed[0].parts), vec![1, 2, 3]);
    let sizes: Vec<u64> = completed[0].parts.iter().map(|p| p.size).collect();
    assert_eq!(sizes, vec![10 * MB, 10 * MB, 5 * MB]);

    assert!(store.get(&upload_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_transient_part_failures_are_retried() {
    let mock = Arc::new(MockTransferClient::new(10));
    let store = create_test_store().await;
    let engine = create_test_engine(&mock, &store);
    let mut events = engine.subscribe();
    let file = create_test_file(25);

    let unavailable = || TransferError::Http {
        status: 503,
        message: "slow down".into(),
    };
    mock.fail_part(2, vec![unavailable(), unavailable()]);

    engine
        .start(StartRequest::new(file.path(), "project-b"))
        .await
        .unwrap();

    let done = wait_for_terminal(&mut events).await;
    assert!(matches!(done.kind, UploadEventKind::Complete { .. }));
    assert_eq!(mock.attempts_for(2), 3);
    assert_eq!(mock.attempts_for(1), 1);
    assert_eq!(mock.attempts_for(3), 1);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_upload() {
    let mock = Arc::new(MockTransferClient::new(10));
    let store = create_test_store().await;
    let engine = create_test_engine(&mock, &store);
    let mut events = engine.subscribe();
    let file = create_test_file(25);

    let unavailable = || TransferError::Http {
        status: 503,
        message: "slow down".into(),
    };
    mock.fail_part(2, vec![unavailable(), unavailable(), unavailable()]);

    let upload_id = engine
        .start(StartRequest::new(file.path(), "project-b"))
        .await
        .unwrap();

    let done = wait_for_terminal(&mut events).await;
    assert!(matches!(done.kind, UploadEventKind::Error { .. }));
    assert_eq!(mock.attempts_for(2), 3);
    assert!(mock.complete_calls().is_empty());

    let record = store.get(&upload_id).await.unwrap().unwrap();
    assert_eq!(record.status, UploadStatus::Failed);
    assert!(record.error.is_some());

    assert!(engine.acknowledge(&upload_id).await.unwrap());
    assert!(store.get(&upload_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_pause_and_resume_in_memory() {
    let mock = Arc::new(MockTransferClient::new(10));
    let store = create_test_store().await;
    let engine = create_test_engine(&mock, &store);
    let mut events = engine.subscribe();
    let file = create_test_file(25);

    mock.hold_part(2);
    mock.hold_part(3);
    let upload_id = engine
        .start(StartRequest::new(file.path(), "project-c"))
        .await
        .unwrap();

    next_event(&mut events, |e| e.bytes_uploaded == 10).await;
    engine.pause(&upload_id).await.unwrap();
    let paused = next_event(&mut events, |e| e.kind == UploadEventKind::Paused).await;
    assert_eq!(paused.status, UploadStatus::Paused);

    let session = engine.get_session(&upload_id).await.unwrap().unwrap();
    assert_eq!(session.status, UploadStatus::Paused);
    assert_eq!(part_numbers(&session.parts), vec![1]);
    let persisted = store.get(&upload_id).await.unwrap().unwrap();
    assert_eq!(persisted.status, UploadStatus::Paused);

    mock.release_parts();
    engine.resume(&upload_id).await.unwrap();

    let done = wait_for_terminal(&mut events).await;
    assert!(matches!(done.kind, UploadEventKind::Complete { .. }));
    assert_eq!(mock.attempts_for(1), 1);

    let mut uploaded = mock.uploaded_parts();
    uploaded.sort();
    assert_eq!(uploaded, vec![1, 2, 3]);
    assert_eq!(part_numbers(&mock.complete_calls()[0].parts), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_resume_rejected_unless_paused() {
    let mock = Arc::new(MockTransferClient::new(10));
    let store = create_test_store().await;
    let engine = create_test_engine(&mock, &store);
    let file = create_test_file(25);

    mock.hold_part(1);
    let upload_id = engine
        .start(StartRequest::new(file.path(), "project-c"))
        .await
        .unwrap();

    assert!(matches!(
        engine.resume(&upload_id).await,
        Err(EngineError::InvalidStateTransition(_))
    ));

    mock.release_parts();
    engine.shutdown().await;
}

#[tokio::test]
async fn test_interrupted_upload_near_complete_is_finalized() {
    let mock = Arc::new(MockTransferClient::new(24));
    let store = create_test_store().await;
    let engine = create_test_engine(&mock, &store);
    let mut events = engine.subscribe();
    let file = create_test_file(100);

    let mut session = create_persisted_session("project-d", "upload-d", &file, 100, 24);
    for n in [3, 1, 4, 2] {
        session.record_part(chunk(n, 24));
    }
    store.put(&session).await.unwrap();
    drop(file);

    let final_key = engine.resume_interrupted("project-d").await.unwrap();
    assert_eq!(final_key, session.destination_key);

    assert_eq!(mock.upload_calls(), 0);
    let completed = mock.complete_calls();
    assert_eq!(completed.len(), 1);
    assert_eq!(part_numbers(&completed[0].parts), vec![1, 2, 3, 4]);

    let done = wait_for_terminal(&mut events).await;
    assert_eq!(done.status, UploadStatus::Completed);
    assert!(matches!(done.kind, UploadEventKind::Complete { .. }));
    assert!(store.get("upload-d").await.unwrap().is_none());
}

#[tokio::test]
async fn test_interrupted_upload_below_threshold_needs_file() {
    let mock = Arc::new(MockTransferClient::new(24));
    let store = create_test_store().await;
    let engine = create_test_engine(&mock, &store);
    let mut events = engine.subscribe();
    let file = create_test_file(100);

    let mut session = create_persisted_session("project-d", "upload-d", &file, 100, 24);
    for n in 1..=3 {
        session.record_part(chunk(n, 24));
    }
    store.put(&session).await.unwrap();

    let err = engine.resume_interrupted("project-d").await.unwrap_err();
    match err {
        EngineError::OriginalFileRequired {
            upload_id,
            coverage_percent,
        } => {
            assert_eq!(upload_id, "upload-d");
            assert_eq!(coverage_percent, 72);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(mock.complete_calls().is_empty());
    assert!(store.get("upload-d").await.unwrap().is_none());

    let event = wait_for_terminal(&mut events).await;
    assert_eq!(event.status, UploadStatus::Failed);
    assert!(matches!(event.kind, UploadEventKind::Error { .. }));
}

#[tokio::test]
async fn test_interrupted_upload_threshold_is_configurable() {
    let mock = Arc::new(MockTransferClient::new(24));
    let store = create_test_store().await;
    let config = EngineConfig {
        resume_completion_threshold: 0.7,
        ..create_test_config()
    };
    let engine = UploadEngine::new(mock.clone(), store.clone(), config).unwrap();
    let file = create_test_file(100);

    let mut session = create_persisted_session("project-d", "upload-d", &file, 100, 24);
    for n in 1..=3 {
        session.record_part(chunk(n, 24));
    }
    store.put(&session).await.unwrap();

    engine.resume_interrupted("project-d").await.unwrap();
    assert_eq!(mock.complete_calls().len(), 1);
}

#[tokio::test]
async fn test_resume_with_mismatched_file_is_rejected() {
    let mock = Arc::new(MockTransferClient::new(10));
    let store = create_test_store().await;
    let engine = create_test_engine(&mock, &store);
    let file = create_test_file(25);

    let session = create_persisted_session("project-e", "upload-e", &file, 30, 10);
    store.put(&session).await.unwrap();

    let err = engine
        .resume_with_file(ResumeWithFileRequest::new(file.path(), "project-e", "upload-e"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    assert_eq!(mock.upload_calls(), 0);
    assert_eq!(mock.list_calls(), 0);
    let untouched = store.get("upload-e").await.unwrap().unwrap();
    assert_eq!(untouched, session);
}

#[tokio::test]
async fn test_resume_with_file_after_restart() {
    let mock = Arc::new(MockTransferClient::new(10));
    let store = create_test_store().await;
    let file = create_test_file(25);

    let first = create_test_engine(&mock, &store);
    let mut events = first.subscribe();
    mock.hold_part(3);
    let upload_id = first
        .start(StartRequest::new(file.path(), "project-r"))
        .await
        .unwrap();
    next_event(&mut events, |e| e.bytes_uploaded == 20).await;
    first.shutdown().await;

    let persisted = store.get(&upload_id).await.unwrap().unwrap();
    assert_eq!(persisted.status, UploadStatus::Uploading);
    assert_eq!(part_numbers(&persisted.parts), vec![1, 2]);
    assert_eq!(persisted.progress, 80);

    mock.release_parts();
    let second = create_test_engine(&mock, &store);
    let mut events = second.subscribe();
    second
        .resume_with_file(ResumeWithFileRequest::new(file.path(), "project-r", &upload_id))
        .await
        .unwrap();

    let done = wait_for_terminal(&mut events).await;
    assert!(matches!(done.kind, UploadEventKind::Complete { .. }));
    assert_eq!(mock.list_calls(), 1);
    assert_eq!(mock.attempts_for(1), 1);
    assert_eq!(mock.attempts_for(2), 1);
    assert_eq!(part_numbers(&mock.complete_calls()[0].parts), vec![1, 2, 3]);
    assert!(store.get(&upload_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_resume_with_file_skips_parts_the_backend_already_has() {
    let mock = Arc::new(MockTransferClient::new(10));
    let store = create_test_store().await;
    let engine = create_test_engine(&mock, &store);
    let mut events = engine.subscribe();
    let file = create_test_file(25);

    let mut session = create_persisted_session("project-r", "upload-r", &file, 25, 10);
    session.record_part(chunk(1, 10));
    session.status = UploadStatus::Paused;
    store.put(&session).await.unwrap();
    mock.seed_remote_parts("upload-r", vec![chunk(1, 10), chunk(2, 10)]);

    engine
        .resume_with_file(ResumeWithFileRequest::new(file.path(), "project-r", "upload-r"))
        .await
        .unwrap();

    let done = wait_for_terminal(&mut events).await;
    assert!(matches!(done.kind, UploadEventKind::Complete { .. }));
    assert_eq!(mock.uploaded_parts(), vec![3]);
    assert_eq!(part_numbers(&mock.complete_calls()[0].parts), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_resume_with_file_tolerates_list_failure() {
    let mock = Arc::new(MockTransferClient::new(10));
    let store = create_test_store().await;
    let engine = create_test_engine(&mock, &store);
    let mut events = engine.subscribe();
    let file = create_test_file(25);

    let mut session = create_persisted_session("project-r", "upload-r", &file, 25, 10);
    session.record_part(chunk(1, 10));
    store.put(&session).await.unwrap();
    mock.fail_list_parts(500);

    engine
        .resume_with_file(ResumeWithFileRequest::new(file.path(), "project-r", "upload-r"))
        .await
        .unwrap();

    let done = wait_for_terminal(&mut events).await;
    assert!(matches!(done.kind, UploadEventKind::Complete { .. }));
    let mut uploaded = mock.uploaded_parts();
    uploaded.sort();
    assert_eq!(uploaded, vec![2, 3]);
}

#[tokio::test]
async fn test_resume_with_fresh_part_urls() {
    let mock = Arc::new(MockTransferClient::new(10));
    let store = create_test_store().await;
    let engine = create_test_engine(&mock, &store);
    let mut events = engine.subscribe();
    let file = create_test_file(25);

    let mut session = create_persisted_session("project-r", "upload-r", &file, 25, 10);
    session.part_urls = vec!["expired".into()];
    store.put(&session).await.unwrap();

    let request = ResumeWithFileRequest::new(file.path(), "project-r", "upload-r")
        .with_part_urls(MockTransferClient::part_urls("upload-r", 3));
    engine.resume_with_file(request).await.unwrap();

    let done = wait_for_terminal(&mut events).await;
    assert!(matches!(done.kind, UploadEventKind::Complete { .. }));
}

#[tokio::test]
async fn test_repeated_resume_with_file_uploads_nothing_more() {
    let mock = Arc::new(MockTransferClient::new(10));
    let store = create_test_store().await;
    let engine = create_test_engine(&mock, &store);
    let mut events = engine.subscribe();
    let file = create_test_file(25);

    let session = create_persisted_session("project-i", "upload-i", &file, 25, 10);
    store.put(&session).await.unwrap();
    mock.hold_part(3);

    let request = ResumeWithFileRequest::new(file.path(), "project-i", "upload-i");
    engine.resume_with_file(request.clone()).await.unwrap();
    next_event(&mut events, |e| e.bytes_uploaded == 20).await;

    // Still running: the second call is a no-op.
    engine.resume_with_file(request.clone()).await.unwrap();
    mock.release_parts();

    let done = wait_for_terminal(&mut events).await;
    assert!(matches!(done.kind, UploadEventKind::Complete { .. }));
    let calls = mock.upload_calls();
    assert_eq!(mock.attempts_for(1), 1);
    assert_eq!(mock.attempts_for(2), 1);

    // Finished: nothing left to resume.
    assert!(matches!(
        engine.resume_with_file(request).await,
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(mock.upload_calls(), calls);
}

#[tokio::test]
async fn test_concurrent_resume_for_project_is_coalesced() {
    let mock = Arc::new(MockTransferClient::new(10));
    let store = create_test_store().await;
    let engine = create_test_engine(&mock, &store);
    let mut events = engine.subscribe();
    let file = create_test_file(25);

    let mut session = create_persisted_session("project-x", "upload-x", &file, 25, 10);
    session.status = UploadStatus::Paused;
    store.put(&session).await.unwrap();
    mock.hold_list_parts();

    let request = ResumeWithFileRequest::new(file.path(), "project-x", "upload-x");
    let first = tokio::spawn({
        let engine = engine.clone();
        let request = request.clone();
        async move { engine.resume_with_file(request).await }
    });
    wait_until(|| mock.list_calls() == 1).await;

    assert!(matches!(
        engine.resume_with_file(request).await,
        Err(EngineError::ResumeInProgress(_))
    ));
    assert!(matches!(
        engine.resume_interrupted("project-x").await,
        Err(EngineError::ResumeInProgress(_))
    ));

    mock.release_parts();
    first.await.unwrap().unwrap();

    let done = wait_for_terminal(&mut events).await;
    assert!(matches!(done.kind, UploadEventKind::Complete { .. }));
    for n in 1..=3 {
        assert_eq!(mock.attempts_for(n), 1);
    }
}

#[tokio::test]
async fn test_cancel_waits_out_resume_with_file_reconciliation() {
    let mock = Arc::new(MockTransferClient::new(10));
    let store = create_test_store().await;
    let engine = create_test_engine(&mock, &store);
    let mut events = engine.subscribe();
    let file = create_test_file(25);

    let mut session = create_persisted_session("project-r", "upload-r", &file, 25, 10);
    session.status = UploadStatus::Paused;
    store.put(&session).await.unwrap();
    mock.hold_list_parts();
    mock.set_part_delay(Duration::from_millis(300));

    let resume = tokio::spawn({
        let engine = engine.clone();
        let request = ResumeWithFileRequest::new(file.path(), "project-r", "upload-r");
        async move { engine.resume_with_file(request).await }
    });
    wait_until(|| mock.list_calls() == 1).await;

    assert!(matches!(
        engine.cancel("upload-r").await,
        Err(EngineError::ResumeInProgress(_))
    ));
    assert!(store.get("upload-r").await.unwrap().is_some());
    assert!(mock.abort_calls().is_empty());

    mock.release_parts();
    resume.await.unwrap().unwrap();

    // Resident now, so the cancel goes through and nothing is finalized.
    engine.cancel("upload-r").await.unwrap();
    let done = wait_for_terminal(&mut events).await;
    assert_eq!(done.kind, UploadEventKind::Cancelled);
    assert!(store.get("upload-r").await.unwrap().is_none());
    wait_until(|| !mock.abort_calls().is_empty()).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(mock.complete_calls().is_empty());
    assert!(store.get("upload-r").await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_rejected_while_interrupted_upload_finalizes() {
    let mock = Arc::new(MockTransferClient::new(24));
    let store = create_test_store().await;
    let engine = create_test_engine(&mock, &store);
    let file = create_test_file(100);

    let mut session = create_persisted_session("project-f", "upload-f", &file, 100, 24);
    for n in 1..=4 {
        session.record_part(chunk(n, 24));
    }
    store.put(&session).await.unwrap();
    mock.hold_complete();

    let finalize = tokio::spawn({
        let engine = engine.clone();
        async move { engine.resume_interrupted("project-f").await }
    });
    wait_until(|| mock.complete_calls().len() == 1).await;

    assert!(matches!(
        engine.cancel("upload-f").await,
        Err(EngineError::ResumeInProgress(_))
    ));
    assert!(store.get("upload-f").await.unwrap().is_some());

    mock.release_parts();
    let final_key = finalize.await.unwrap().unwrap();
    assert_eq!(final_key, session.destination_key);
    assert!(store.get("upload-f").await.unwrap().is_none());
    assert!(mock.abort_calls().is_empty());
}

#[tokio::test]
async fn test_commands_stay_responsive_while_finalizing() {
    let mock = Arc::new(MockTransferClient::new(10));
    let store = create_test_store().await;
    let engine = create_test_engine(&mock, &store);
    let mut events = engine.subscribe();
    let file = create_test_file(25);

    mock.hold_complete();
    let upload_id = engine
        .start(StartRequest::new(file.path(), "project-z"))
        .await
        .unwrap();
    next_event(&mut events, |e| e.step == "Finalizing upload").await;
    wait_until(|| mock.complete_calls().len() == 1).await;

    let budget = Duration::from_secs(1);
    let session = tokio::time::timeout(budget, engine.get_session(&upload_id))
        .await
        .expect("get_session blocked on finalization")
        .unwrap()
        .unwrap();
    assert_eq!(session.status, UploadStatus::Uploading);
    assert_eq!(session.parts.len(), 3);

    let listed = tokio::time::timeout(budget, engine.list_active_uploads())
        .await
        .expect("list_active_uploads blocked on finalization")
        .unwrap();
    assert_eq!(listed.len(), 1);

    let paused = tokio::time::timeout(budget, engine.pause(&upload_id))
        .await
        .expect("pause blocked on finalization");
    assert!(matches!(paused, Err(EngineError::InvalidStateTransition(_))));

    tokio::time::timeout(budget, engine.cancel(&upload_id))
        .await
        .expect("cancel blocked on finalization")
        .unwrap();
    let done = wait_for_terminal(&mut events).await;
    assert_eq!(done.kind, UploadEventKind::Cancelled);

    mock.release_parts();
    wait_until(|| !mock.abort_calls().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event.kind, UploadEventKind::Complete { .. }),
            "cancelled upload reported completion"
        );
    }
    assert!(store.get(&upload_id).await.unwrap().is_none());
    assert!(engine.get_session(&upload_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_completion_parts_sorted_when_parts_finish_out_of_order() {
    let mock = Arc::new(MockTransferClient::new(10));
    let store = create_test_store().await;
    let engine = create_test_engine(&mock, &store);
    let mut events = engine.subscribe();
    let file = create_test_file(25);

    mock.hold_part(1);
    engine
        .start(StartRequest::new(file.path(), "project-o"))
        .await
        .unwrap();
    next_event(&mut events, |e| e.bytes_uploaded == 15).await;
    mock.release_parts();

    let done = wait_for_terminal(&mut events).await;
    assert!(matches!(done.kind, UploadEventKind::Complete { .. }));
    assert_eq!(mock.uploaded_parts().last(), Some(&1));
    assert_eq!(part_numbers(&mock.complete_calls()[0].parts), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_cancel_running_upload() {
    let mock = Arc::new(MockTransferClient::new(10));
    let store = create_test_store().await;
    let engine = create_test_engine(&mock, &store);
    let mut events = engine.subscribe();
    let file = create_test_file(25);

    mock.hold_part(2);
    mock.hold_part(3);
    let upload_id = engine
        .start(StartRequest::new(file.path(), "project-k"))
        .await
        .unwrap();
    next_event(&mut events, |e| e.bytes_uploaded == 10).await;

    engine.cancel(&upload_id).await.unwrap();
    let event = wait_for_terminal(&mut events).await;
    assert_eq!(event.kind, UploadEventKind::Cancelled);

    assert!(store.get(&upload_id).await.unwrap().is_none());
    assert!(engine.get_session(&upload_id).await.unwrap().is_none());
    wait_until(|| !mock.abort_calls().is_empty()).await;
    assert_eq!(mock.abort_calls()[0].1, upload_id);

    mock.release_parts();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(mock.complete_calls().is_empty());
    assert!(store.get(&upload_id).await.unwrap().is_none());

    assert!(matches!(
        engine.cancel(&upload_id).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_list_active_uploads_merges_memory_and_storage() {
    let mock = Arc::new(MockTransferClient::new(10));
    let store = create_test_store().await;
    let engine = create_test_engine(&mock, &store);
    let file = create_test_file(25);

    let mut stored = create_persisted_session("project-s", "upload-s", &file, 25, 10);
    stored.status = UploadStatus::Paused;
    stored.last_activity = chrono::Utc::now() - chrono::Duration::hours(1);
    store.put(&stored).await.unwrap();

    let mut failed = create_persisted_session("project-f", "upload-f", &file, 25, 10);
    failed.status = UploadStatus::Failed;
    store.put(&failed).await.unwrap();

    mock.hold_part(1);
    let upload_id = engine
        .start(StartRequest::new(file.path(), "project-m"))
        .await
        .unwrap();

    let active = engine.list_active_uploads().await.unwrap();
    let ids: Vec<&str> = active.iter().map(|s| s.upload_id.as_str()).collect();
    assert_eq!(ids, vec![upload_id.as_str(), "upload-s"]);

    mock.release_parts();
    engine.shutdown().await;
}

#[tokio::test]
async fn test_reap_stale_sessions() {
    let mock = Arc::new(MockTransferClient::new(10));
    let store = create_test_store().await;
    let config = EngineConfig {
        session_max_age: Duration::from_secs(60),
        ..create_test_config()
    };
    let engine = UploadEngine::new(mock.clone(), store.clone(), config).unwrap();
    let file = create_test_file(25);

    let mut old = create_persisted_session("project-1", "old", &file, 25, 10);
    old.last_activity = chrono::Utc::now() - chrono::Duration::hours(2);
    store.put(&old).await.unwrap();
    let fresh = create_persisted_session("project-2", "fresh", &file, 25, 10);
    store.put(&fresh).await.unwrap();

    assert_eq!(engine.reap_stale().await.unwrap(), 1);
    assert!(store.get("old").await.unwrap().is_none());
    assert!(store.get("fresh").await.unwrap().is_some());
}

#[tokio::test]
async fn test_zero_byte_file_uploads_one_empty_part() {
    let mock = Arc::new(MockTransferClient::new(10));
    let store = create_test_store().await;
    let engine = create_test_engine(&mock, &store);
    let mut events = engine.subscribe();
    let file = create_test_file(0);

    engine
        .start(StartRequest::new(file.path(), "project-z"))
        .await
        .unwrap();

    let done = wait_for_terminal(&mut events).await;
    assert!(matches!(done.kind, UploadEventKind::Complete { .. }));
    assert_eq!(done.progress, 100);
    let completed = mock.complete_calls();
    assert_eq!(completed[0].parts.len(), 1);
    assert_eq!(completed[0].parts[0].size, 0);
}
