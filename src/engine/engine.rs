use crate::config::EngineConfig;
use crate::engine::error::{sanitize_message, EngineError, EngineResult};
use crate::engine::state_machine::{self, Transition};
use crate::engine::types::{ProjectOp, ResumeWithFileRequest, StartRequest};
use crate::events::{EventChannel, UploadEvent, UploadEventKind};
use crate::metrics;
use crate::scheduler::{ChunkScheduler, FileSource, PartPlan, SchedulerError, UploadJob};
use crate::session::{SessionStore, UploadSession, UploadStatus, UploadedChunk};
use crate::transfer::{InitiateRequest, TransferClient};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// An upload owned by this process.
///
/// `session` is the single writer for the upload's state; every mutation
/// and every persist happens while holding it.
struct ActiveUpload {
    upload_id: String,
    project_id: String,
    source: FileSource,
    session: Mutex<UploadSession>,
    /// Token of the current scheduler run. Replaced on every launch.
    cancel: parking_lot::Mutex<CancellationToken>,
    run: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    /// Set while `complete_transfer` is in flight; the session lock is not
    /// held across that call.
    finalizing: AtomicBool,
}

impl ActiveUpload {
    fn new(session: UploadSession, source: FileSource) -> Arc<Self> {
        Arc::new(Self {
            upload_id: session.upload_id.clone(),
            project_id: session.project_id.clone(),
            source,
            session: Mutex::new(session),
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
            run: Mutex::new(None),
            generation: AtomicU64::new(0),
            finalizing: AtomicBool::new(false),
        })
    }

    fn stop(&self) {
        self.cancel.lock().cancel();
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}

/// Marks a start or resume in flight for one project until dropped.
struct ProjectGuard<'a> {
    ops: &'a DashMap<String, ProjectOp>,
    project_id: String,
}

impl Drop for ProjectGuard<'_> {
    fn drop(&mut self) {
        self.ops.remove(&self.project_id);
    }
}

struct EngineInner {
    client: Arc<dyn TransferClient>,
    store: Arc<SessionStore>,
    scheduler: ChunkScheduler,
    events: EventChannel,
    config: EngineConfig,
    active: DashMap<String, Arc<ActiveUpload>>,
    project_ops: DashMap<String, ProjectOp>,
    shutdown: CancellationToken,
}

/// Owns the lifecycle of every upload: start, pause, resume, cancel,
/// completion and restart recovery.
///
/// Cheap to clone; clones share the same uploads.
#[derive(Clone)]
pub struct UploadEngine {
    inner: Arc<EngineInner>,
}

impl UploadEngine {
    pub fn new(
        client: Arc<dyn TransferClient>,
        store: Arc<SessionStore>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config
            .validate()
            .map_err(|e| EngineError::Configuration(e.0))?;

        let scheduler = ChunkScheduler::new(client.clone(), config.scheduler_config());
        let events = EventChannel::new(config.event_capacity);

        Ok(Self {
            inner: Arc::new(EngineInner {
                client,
                store,
                scheduler,
                events,
                config,
                active: DashMap::new(),
                project_ops: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.events.subscribe()
    }

    /// Open a transfer for `request.file_path` and start uploading it.
    ///
    /// Returns the upload id once the session is persisted and the first
    /// scheduler run is launched; completion is reported through events.
    pub async fn start(&self, request: StartRequest) -> EngineResult<String> {
        let _guard = self.claim_project(&request.project_id, ProjectOp::Starting)?;
        if self.resident_for_project(&request.project_id).is_some() {
            return Err(EngineError::AlreadyInProgress(request.project_id));
        }

        let mut source = FileSource::open(&request.file_path).await?;
        if let Some(mime_type) = request.mime_type {
            source = source.with_mime_type(mime_type);
        }

        metrics::record_upload_started(false);
        let initiated = match request.initiated {
            Some(initiated) => initiated,
            None => {
                let initiate = InitiateRequest {
                    file_name: source.file_name().to_string(),
                    file_size: source.file_size(),
                    project_id: request.project_id.clone(),
                    mime_type: source.mime_type().to_string(),
                    destination_key: request.destination,
                };
                match self.inner.client.initiate_transfer(initiate).await {
                    Ok(initiated) => initiated,
                    Err(e) => {
                        let err = EngineError::Initiation(e);
                        self.report_detached_failure(&request.project_id, "", source.file_size(), &err);
                        return Err(err);
                    }
                }
            }
        };

        let mismatch = match PartPlan::new(source.file_size(), initiated.chunk_size) {
            Ok(plan) if initiated.part_urls.len() >= plan.part_count() as usize => None,
            Ok(plan) => Some(format!(
                "backend returned {} part URLs for {} parts",
                initiated.part_urls.len(),
                plan.part_count()
            )),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = mismatch {
            let err = EngineError::Configuration(reason);
            self.abort_in_background(initiated.destination_key.clone(), initiated.upload_id.clone());
            self.report_detached_failure(
                &request.project_id,
                &initiated.upload_id,
                source.file_size(),
                &err,
            );
            return Err(err);
        }

        let session = UploadSession::new(
            request.project_id.clone(),
            initiated.upload_id.clone(),
            initiated.destination_key,
            source.file_name().to_string(),
            source.file_size(),
            source.mime_type().to_string(),
            initiated.chunk_size,
            initiated.part_urls,
        );
        self.persist(&session).await;

        tracing::info!(
            upload_id = %session.upload_id,
            project_id = %session.project_id,
            file_name = %session.file_name,
            file_size = session.file_size,
            parts = session.part_urls.len(),
            "upload started"
        );
        self.publish(&session, UploadEventKind::Progress, "Upload started");

        let upload_id = session.upload_id.clone();
        let upload = ActiveUpload::new(session, source);
        self.inner.active.insert(upload_id.clone(), upload.clone());
        self.launch(upload).await;

        Ok(upload_id)
    }

    /// Stop scheduling new parts. In-flight part requests are abandoned;
    /// parts already acknowledged stay recorded.
    pub async fn pause(&self, upload_id: &str) -> EngineResult<()> {
        let upload = self.resident_or_err(upload_id).await?;
        let mut session = upload.session.lock().await;
        if upload.finalizing.load(Ordering::SeqCst) {
            return Err(EngineError::InvalidStateTransition(format!(
                "upload {upload_id} is finalizing"
            )));
        }
        state_machine::apply(&mut session, Transition::Pause)?;
        upload.stop();
        self.persist(&session).await;

        tracing::info!(upload_id, progress = session.progress, "upload paused");
        metrics::record_upload_paused();
        self.publish(&session, UploadEventKind::Paused, "Paused");
        Ok(())
    }

    /// Resume a paused upload still resident in this process.
    pub async fn resume(&self, upload_id: &str) -> EngineResult<()> {
        let upload = self.resident_or_err(upload_id).await?;
        let _guard = self.claim_project(&upload.project_id, ProjectOp::Resuming)?;
        self.resume_resident(upload).await
    }

    /// Resume a persisted upload after a restart, given the original file.
    ///
    /// The file must match the persisted name and size. Parts the backend
    /// already holds are reconciled before any bytes are sent.
    pub async fn resume_with_file(&self, request: ResumeWithFileRequest) -> EngineResult<()> {
        let _guard = self.claim_project(&request.project_id, ProjectOp::Resuming)?;

        if let Some(upload) = self.resident(&request.upload_id) {
            let source = FileSource::open(&request.file_path).await?;
            {
                let mut session = upload.session.lock().await;
                check_file_matches(&session, &request.project_id, &source)?;
                if session.status == UploadStatus::Uploading {
                    tracing::debug!(upload_id = %request.upload_id, "upload already running");
                    return Ok(());
                }
                if let Some(part_urls) = request.part_urls {
                    session.part_urls = part_urls;
                }
            }
            return self.resume_resident(upload).await;
        }

        let mut session = self
            .inner
            .store
            .get(&request.upload_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(request.upload_id.clone()))?;
        if !session.status.is_resumable() {
            return Err(EngineError::InvalidStateTransition(format!(
                "upload {} is {}",
                session.upload_id, session.status
            )));
        }

        let source = FileSource::open(&request.file_path).await?;
        check_file_matches(&session, &request.project_id, &source)?;
        let source = source.with_mime_type(session.mime_type.clone());
        let part_count = PartPlan::new(session.file_size, session.chunk_size)
            .map_err(EngineError::from)?
            .part_count();

        if let Some(part_urls) = request.part_urls {
            session.part_urls = part_urls;
        }

        match self
            .inner
            .client
            .list_uploaded_parts(&session.destination_key, &session.upload_id)
            .await
        {
            Ok(remote) => {
                let known = session.parts.len();
                for part in remote {
                    if (1..=part_count).contains(&part.part_number) {
                        session.record_part(part);
                    }
                }
                tracing::debug!(
                    upload_id = %session.upload_id,
                    local = known,
                    merged = session.parts.len(),
                    "reconciled parts with backend"
                );
            }
            Err(e) => {
                tracing::warn!(
                    upload_id = %session.upload_id,
                    error = %e,
                    "could not list uploaded parts, relying on local record"
                );
            }
        }

        session.recompute_progress();
        state_machine::apply(&mut session, Transition::Reattach)?;
        session.error = None;
        self.inner.store.put(&session).await?;

        tracing::info!(
            upload_id = %session.upload_id,
            project_id = %session.project_id,
            recorded = session.parts.len(),
            part_count,
            "resuming upload from file"
        );
        self.publish(&session, UploadEventKind::Progress, "Resuming upload");

        let upload_id = session.upload_id.clone();
        let upload = ActiveUpload::new(session, source);
        self.inner.active.insert(upload_id, upload.clone());
        metrics::record_upload_started(true);
        self.launch(upload).await;
        Ok(())
    }

    /// Recover the most recent upload of a project without its file.
    ///
    /// Finalizes from recorded parts when they cover enough of the file;
    /// otherwise fails the upload, drops the record and returns
    /// [`EngineError::OriginalFileRequired`]. Returns the final object key.
    pub async fn resume_interrupted(&self, project_id: &str) -> EngineResult<String> {
        let _guard = self.claim_project(project_id, ProjectOp::Resuming)?;

        let mut session = self
            .inner
            .store
            .find_by_project_id(project_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("no upload recorded for project {project_id}")))?;
        if self.resident(&session.upload_id).is_some() {
            return Err(EngineError::AlreadyInProgress(project_id.to_string()));
        }
        state_machine::apply(&mut session, Transition::Reattach)?;
        metrics::record_upload_started(true);

        session.recompute_progress();
        let coverage = session.coverage();
        if coverage < self.inner.config.resume_completion_threshold {
            let err = EngineError::OriginalFileRequired {
                upload_id: session.upload_id.clone(),
                coverage_percent: session.progress,
            };
            state_machine::apply(&mut session, Transition::Fail)?;
            session.error = Some(err.to_string());
            if let Err(e) = self.inner.store.delete(&session.upload_id).await {
                tracing::warn!(upload_id = %session.upload_id, error = %e, "failed to delete upload session");
            }
            tracing::warn!(upload_id = %session.upload_id, coverage, "upload cannot be recovered without its file");
            metrics::record_upload_failed(err.kind());
            self.publish(
                &session,
                UploadEventKind::Error {
                    message: err.to_string(),
                    retryable: err.is_retryable(),
                },
                "Original file required",
            );
            return Err(err);
        }

        tracing::info!(upload_id = %session.upload_id, coverage, "finalizing interrupted upload from recorded parts");
        self.publish(&session, UploadEventKind::Progress, "Finalizing upload");
        let parts = session.sorted_parts();
        match self
            .inner
            .client
            .complete_transfer(&session.destination_key, &session.upload_id, &parts)
            .await
        {
            Ok(final_key) => {
                self.complete_session(&mut session, &final_key).await?;
                Ok(final_key)
            }
            Err(e) => {
                let err = EngineError::Completion(e);
                self.fail_session(&mut session, &err).await;
                Err(err)
            }
        }
    }

    /// Cancel an upload, resident or persisted only. The record is removed
    /// right away; the remote abort runs in the background.
    ///
    /// A persisted-only record that a resume is reattaching is rejected with
    /// [`EngineError::ResumeInProgress`]; cancel again once it is resident.
    pub async fn cancel(&self, upload_id: &str) -> EngineResult<()> {
        let (resident, _guard) = match self.resident(upload_id) {
            Some(upload) => (Some(upload), None),
            None => {
                let session = self
                    .inner
                    .store
                    .get(upload_id)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(upload_id.to_string()))?;
                let guard = self.claim_project(&session.project_id, ProjectOp::Cancelling)?;
                (self.resident(upload_id), Some(guard))
            }
        };

        let (snapshot, was_running) = match resident {
            Some(upload) => {
                let mut session = upload.session.lock().await;
                let was_running = session.status == UploadStatus::Uploading;
                state_machine::apply(&mut session, Transition::Cancel)?;
                upload.stop();
                self.inner.active.remove(upload_id);
                (session.clone(), was_running)
            }
            None => {
                let mut session = self
                    .inner
                    .store
                    .get(upload_id)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(upload_id.to_string()))?;
                state_machine::apply(&mut session, Transition::Cancel)?;
                (session, false)
            }
        };

        if let Err(e) = self.inner.store.delete(upload_id).await {
            tracing::warn!(upload_id, error = %e, "failed to delete upload session");
        }
        self.abort_in_background(snapshot.destination_key.clone(), snapshot.upload_id.clone());

        tracing::info!(upload_id, "upload cancelled");
        metrics::record_upload_cancelled(was_running);
        self.publish(&snapshot, UploadEventKind::Cancelled, "Upload cancelled");
        Ok(())
    }

    /// Current view of an upload, resident first, then persisted.
    pub async fn get_session(&self, upload_id: &str) -> EngineResult<Option<UploadSession>> {
        if let Some(upload) = self.resident(upload_id) {
            return Ok(Some(upload.session.lock().await.clone()));
        }
        Ok(self.inner.store.get(upload_id).await?)
    }

    /// Every upload that is uploading or paused, newest activity first.
    pub async fn list_active_uploads(&self) -> EngineResult<Vec<UploadSession>> {
        let mut sessions = HashMap::new();
        for status in [UploadStatus::Uploading, UploadStatus::Paused] {
            for session in self.inner.store.list_by_status(status).await? {
                sessions.insert(session.upload_id.clone(), session);
            }
        }

        let resident: Vec<Arc<ActiveUpload>> =
            self.inner.active.iter().map(|e| e.value().clone()).collect();
        for upload in resident {
            let session = upload.session.lock().await.clone();
            if !session.status.is_terminal() {
                sessions.insert(session.upload_id.clone(), session);
            }
        }

        let mut sessions: Vec<UploadSession> = sessions.into_values().collect();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(sessions)
    }

    /// Drop the record of a failed upload once the host has seen it.
    /// Returns `false` if there was nothing to drop.
    pub async fn acknowledge(&self, upload_id: &str) -> EngineResult<bool> {
        let Some(session) = self.inner.store.get(upload_id).await? else {
            return Ok(false);
        };
        if session.status != UploadStatus::Failed {
            return Err(EngineError::InvalidStateTransition(format!(
                "only failed uploads can be acknowledged, {upload_id} is {}",
                session.status
            )));
        }
        Ok(self.inner.store.delete(upload_id).await?)
    }

    /// Delete persisted records idle for longer than `session_max_age`.
    pub async fn reap_stale(&self) -> EngineResult<u64> {
        let reaped = self
            .inner
            .store
            .reap_older_than(self.inner.config.session_max_age)
            .await?;
        if reaped > 0 {
            tracing::info!(reaped, "reaped stale upload sessions");
        }
        Ok(reaped)
    }

    /// Run [`reap_stale`](Self::reap_stale) every `reap_interval` until
    /// [`shutdown`](Self::shutdown).
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.inner.config.reap_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = engine.inner.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = engine.reap_stale().await {
                            tracing::warn!(error = %e, "session reaper failed");
                        }
                    }
                }
            }
            tracing::debug!("session reaper stopped");
        })
    }

    /// Stop every scheduler run without touching upload status, so the
    /// persisted records can be resumed by the next process.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let uploads: Vec<Arc<ActiveUpload>> =
            self.inner.active.iter().map(|e| e.value().clone()).collect();
        for upload in &uploads {
            upload.stop();
            let task = upload.run.lock().await.take();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    tracing::warn!(upload_id = %upload.upload_id, error = %e, "upload task ended abnormally");
                }
            }
            if upload.session.lock().await.status == UploadStatus::Uploading {
                metrics::record_upload_stopped();
            }
        }
        self.inner.active.clear();
        tracing::info!(stopped = uploads.len(), "upload engine shut down");
    }

    async fn resume_resident(&self, upload: Arc<ActiveUpload>) -> EngineResult<()> {
        {
            let mut session = upload.session.lock().await;
            state_machine::apply(&mut session, Transition::Resume)?;
            session.error = None;
            self.persist(&session).await;
            tracing::info!(upload_id = %session.upload_id, progress = session.progress, "upload resumed");
            self.publish(&session, UploadEventKind::Progress, "Resuming upload");
        }
        metrics::record_upload_started(true);
        self.launch(upload).await;
        Ok(())
    }

    /// Start a scheduler run for `upload`, after the previous one (if any)
    /// has fully stopped. Only one run per upload is ever live.
    async fn launch(&self, upload: Arc<ActiveUpload>) {
        let mut run = upload.run.lock().await;
        if let Some(previous) = run.take() {
            upload.stop();
            if let Err(e) = previous.await {
                tracing::warn!(upload_id = %upload.upload_id, error = %e, "previous upload task ended abnormally");
            }
        }

        let session = upload.session.lock().await;
        if session.status != UploadStatus::Uploading {
            return;
        }
        let cancel = self.inner.shutdown.child_token();
        *upload.cancel.lock() = cancel.clone();
        let generation = upload.generation.fetch_add(1, Ordering::SeqCst) + 1;
        drop(session);

        let engine = self.clone();
        *run = Some(tokio::spawn(engine.drive(upload.clone(), cancel, generation)));
    }

    async fn drive(self, upload: Arc<ActiveUpload>, cancel: CancellationToken, generation: u64) {
        let (job, part_count) = {
            let mut session = upload.session.lock().await;
            match PartPlan::new(session.file_size, session.chunk_size) {
                Ok(plan) => {
                    let part_count = plan.part_count();
                    let job = UploadJob {
                        upload_id: session.upload_id.clone(),
                        source: upload.source.clone(),
                        plan,
                        part_urls: session.part_urls.clone(),
                        completed: session.parts.iter().map(|p| p.part_number).collect(),
                    };
                    (job, part_count)
                }
                Err(e) => {
                    self.fail_session(&mut session, &EngineError::from(e)).await;
                    return;
                }
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = self.inner.scheduler.clone();
        let run = scheduler.run(job, cancel, tx);
        tokio::pin!(run);

        let result = loop {
            tokio::select! {
                Some(chunk) = rx.recv() => self.record_chunk(&upload, chunk, part_count).await,
                result = &mut run => break result,
            }
        };
        while let Ok(chunk) = rx.try_recv() {
            self.record_chunk(&upload, chunk, part_count).await;
        }

        match result {
            Ok(summary) => {
                tracing::debug!(
                    upload_id = %upload.upload_id,
                    uploaded = summary.uploaded,
                    skipped = summary.skipped,
                    "all parts uploaded"
                );
                self.finish(&upload, generation, part_count).await;
            }
            Err(SchedulerError::Cancelled) => {
                tracing::debug!(upload_id = %upload.upload_id, "upload run stopped");
            }
            Err(e) => {
                let mut session = upload.session.lock().await;
                if upload.is_current(generation) && session.status == UploadStatus::Uploading {
                    self.fail_session(&mut session, &EngineError::from(e)).await;
                }
            }
        }
    }

    async fn record_chunk(&self, upload: &ActiveUpload, chunk: UploadedChunk, part_count: u32) {
        let mut session = upload.session.lock().await;
        if session.status.is_terminal() {
            return;
        }
        let part_number = chunk.part_number;
        session.record_part(chunk);
        self.persist(&session).await;

        tracing::debug!(
            upload_id = %session.upload_id,
            part_number,
            progress = session.progress,
            "part recorded"
        );
        self.publish(
            &session,
            UploadEventKind::Progress,
            format!("Uploaded part {part_number} of {part_count}"),
        );
    }

    async fn finish(&self, upload: &ActiveUpload, generation: u64, part_count: u32) {
        let (destination_key, parts) = {
            let mut session = upload.session.lock().await;
            if !upload.is_current(generation) || session.status != UploadStatus::Uploading {
                return;
            }
            if let Some(missing) = (1..=part_count).find(|n| !session.has_part(*n)) {
                let err = EngineError::Configuration(format!("part {missing} was never acknowledged"));
                self.fail_session(&mut session, &err).await;
                return;
            }

            let mut parts = session.sorted_parts();
            parts.retain(|p| p.part_number <= part_count);
            upload.finalizing.store(true, Ordering::SeqCst);
            self.publish(&session, UploadEventKind::Progress, "Finalizing upload");
            (session.destination_key.clone(), parts)
        };

        let result = self
            .inner
            .client
            .complete_transfer(&destination_key, &upload.upload_id, &parts)
            .await;

        let mut session = upload.session.lock().await;
        upload.finalizing.store(false, Ordering::SeqCst);
        if !upload.is_current(generation) || session.status != UploadStatus::Uploading {
            tracing::warn!(
                upload_id = %upload.upload_id,
                status = %session.status,
                completed = result.is_ok(),
                "upload changed while finalizing"
            );
            return;
        }

        match result {
            Ok(final_key) => {
                if let Err(e) = self.complete_session(&mut session, &final_key).await {
                    tracing::warn!(upload_id = %upload.upload_id, error = %e, "could not mark upload completed");
                }
            }
            Err(e) => {
                self.fail_session(&mut session, &EngineError::Completion(e)).await;
            }
        }
    }

    async fn complete_session(&self, session: &mut UploadSession, final_key: &str) -> EngineResult<()> {
        state_machine::apply(session, Transition::Complete)?;
        session.progress = 100;
        if let Err(e) = self.inner.store.delete(&session.upload_id).await {
            tracing::warn!(upload_id = %session.upload_id, error = %e, "failed to delete upload session");
        }
        self.inner.active.remove(&session.upload_id);

        let elapsed = (Utc::now() - session.started_at).to_std().unwrap_or_default();
        metrics::record_upload_completed(elapsed);
        tracing::info!(
            upload_id = %session.upload_id,
            final_key,
            elapsed_ms = elapsed.as_millis() as u64,
            "upload completed"
        );
        self.publish(
            session,
            UploadEventKind::Complete {
                final_key: final_key.to_string(),
            },
            "Upload complete",
        );
        Ok(())
    }

    /// Mark the upload failed and keep its record for diagnostics until the
    /// host acknowledges it.
    async fn fail_session(&self, session: &mut UploadSession, err: &EngineError) {
        if state_machine::apply(session, Transition::Fail).is_err() {
            return;
        }
        let message = sanitize_message(&err.to_string());
        session.error = Some(message.clone());
        self.persist(session).await;
        self.inner.active.remove(&session.upload_id);

        tracing::error!(upload_id = %session.upload_id, error = %err, "upload failed");
        metrics::record_upload_failed(err.kind());
        self.publish(
            session,
            UploadEventKind::Error {
                message: message.clone(),
                retryable: err.is_retryable(),
            },
            message,
        );
    }

    /// Error event for a failure that happened before a session existed.
    fn report_detached_failure(
        &self,
        project_id: &str,
        upload_id: &str,
        total_bytes: u64,
        err: &EngineError,
    ) {
        let message = sanitize_message(&err.to_string());
        tracing::error!(project_id, upload_id, error = %err, "upload could not be started");
        metrics::record_upload_failed(err.kind());
        self.inner.events.publish(UploadEvent {
            kind: UploadEventKind::Error {
                message: message.clone(),
                retryable: err.is_retryable(),
            },
            project_id: project_id.to_string(),
            upload_id: upload_id.to_string(),
            status: UploadStatus::Failed,
            bytes_uploaded: 0,
            total_bytes,
            progress: 0,
            step: message,
        });
    }

    fn abort_in_background(&self, destination_key: String, upload_id: String) {
        let client = self.inner.client.clone();
        tokio::spawn(async move {
            match client.abort_transfer(&destination_key, &upload_id).await {
                Ok(()) => tracing::debug!(%upload_id, "remote transfer aborted"),
                Err(e) => tracing::warn!(%upload_id, error = %e, "failed to abort remote transfer"),
            }
        });
    }

    /// Persist failures degrade resumability but never stop a transfer.
    async fn persist(&self, session: &UploadSession) {
        if let Err(e) = self.inner.store.put(session).await {
            tracing::warn!(upload_id = %session.upload_id, error = %e, "failed to persist upload session");
        }
    }

    fn publish(&self, session: &UploadSession, kind: UploadEventKind, step: impl Into<String>) {
        self.inner
            .events
            .publish(UploadEvent::from_session(session, kind, step));
    }

    fn claim_project(&self, project_id: &str, op: ProjectOp) -> EngineResult<ProjectGuard<'_>> {
        match self.inner.project_ops.entry(project_id.to_string()) {
            Entry::Occupied(entry) => Err(match entry.get() {
                ProjectOp::Resuming => EngineError::ResumeInProgress(project_id.to_string()),
                ProjectOp::Starting => EngineError::AlreadyInProgress(project_id.to_string()),
                ProjectOp::Cancelling => EngineError::InvalidStateTransition(format!(
                    "cancel in progress for project {project_id}"
                )),
            }),
            Entry::Vacant(entry) => {
                entry.insert(op);
                Ok(ProjectGuard {
                    ops: &self.inner.project_ops,
                    project_id: project_id.to_string(),
                })
            }
        }
    }

    fn resident(&self, upload_id: &str) -> Option<Arc<ActiveUpload>> {
        self.inner.active.get(upload_id).map(|e| e.value().clone())
    }

    fn resident_for_project(&self, project_id: &str) -> Option<Arc<ActiveUpload>> {
        self.inner
            .active
            .iter()
            .find(|e| e.value().project_id == project_id)
            .map(|e| e.value().clone())
    }

    async fn resident_or_err(&self, upload_id: &str) -> EngineResult<Arc<ActiveUpload>> {
        if let Some(upload) = self.resident(upload_id) {
            return Ok(upload);
        }
        match self.inner.store.get(upload_id).await? {
            Some(_) => Err(EngineError::NotResident(upload_id.to_string())),
            None => Err(EngineError::NotFound(upload_id.to_string())),
        }
    }
}

fn check_file_matches(
    session: &UploadSession,
    project_id: &str,
    source: &FileSource,
) -> EngineResult<()> {
    if session.project_id != project_id {
        return Err(EngineError::Validation(format!(
            "upload {} belongs to project {}",
            session.upload_id, session.project_id
        )));
    }
    if source.file_name() != session.file_name {
        return Err(EngineError::Validation(format!(
            "expected file {:?}, got {:?}",
            session.file_name,
            source.file_name()
        )));
    }
    if source.file_size() != session.file_size {
        return Err(EngineError::Validation(format!(
            "expected {} bytes, file has {}",
            session.file_size,
            source.file_size()
        )));
    }
    Ok(())
}
