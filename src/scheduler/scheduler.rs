use crate::metrics;
use crate::scheduler::error::{SchedulerError, SchedulerResult};
use crate::scheduler::plan::{PartPlan, PartRange};
use crate::scheduler::retry::RetryPolicy;
use crate::scheduler::source::FileSource;
use crate::session::UploadedChunk;
use crate::transfer::{TransferClient, TransferError};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_concurrent_chunks: usize,
    pub retry: RetryPolicy,
    pub part_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: 3,
            retry: RetryPolicy::default(),
            part_timeout: Duration::from_secs(120),
        }
    }
}

/// Everything one scheduler run needs to know about an upload.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub upload_id: String,
    pub source: FileSource,
    pub plan: PartPlan,
    pub part_urls: Vec<String>,
    /// Parts already acknowledged; never re-sent.
    pub completed: HashSet<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub uploaded: u32,
    pub skipped: u32,
}

struct RunContext {
    upload_id: String,
    client: Arc<dyn TransferClient>,
    config: SchedulerConfig,
    source: FileSource,
    part_urls: Vec<String>,
    pending: Mutex<VecDeque<PartRange>>,
    abort: CancellationToken,
    updates: mpsc::UnboundedSender<UploadedChunk>,
}

/// Bounded-concurrency part uploader.
///
/// Each run pulls parts from a shared queue into at most
/// `max_concurrent_chunks` workers. A part that exhausts its retries, or
/// fails with a non-retryable error, stops the whole run. Every accepted
/// part is pushed to `updates` as soon as it lands; the caller owns
/// persistence and the final completion call.
#[derive(Clone)]
pub struct ChunkScheduler {
    client: Arc<dyn TransferClient>,
    config: SchedulerConfig,
}

impl ChunkScheduler {
    pub fn new(client: Arc<dyn TransferClient>, config: SchedulerConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub async fn run(
        &self,
        job: UploadJob,
        cancel: CancellationToken,
        updates: mpsc::UnboundedSender<UploadedChunk>,
    ) -> SchedulerResult<RunSummary> {
        let part_count = job.plan.part_count() as usize;
        if job.part_urls.len() < part_count {
            return Err(SchedulerError::Configuration(format!(
                "{} part URLs for {} parts",
                job.part_urls.len(),
                part_count
            )));
        }
        if cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }

        let pending: VecDeque<PartRange> = job
            .plan
            .parts()
            .iter()
            .filter(|p| !job.completed.contains(&p.part_number))
            .copied()
            .collect();
        let skipped = (part_count - pending.len()) as u32;

        if pending.is_empty() {
            tracing::debug!(upload_id = %job.upload_id, "all parts already recorded");
            return Ok(RunSummary {
                uploaded: 0,
                skipped,
            });
        }

        let workers = self.config.max_concurrent_chunks.max(1).min(pending.len());
        tracing::info!(
            upload_id = %job.upload_id,
            pending = pending.len(),
            skipped,
            workers,
            "starting part uploads"
        );

        let ctx = Arc::new(RunContext {
            upload_id: job.upload_id,
            client: self.client.clone(),
            config: self.config,
            source: job.source,
            part_urls: job.part_urls,
            pending: Mutex::new(pending),
            abort: cancel.child_token(),
            updates,
        });

        let mut set = JoinSet::new();
        for _ in 0..workers {
            let ctx = ctx.clone();
            set.spawn(async move { worker(ctx).await });
        }

        let mut uploaded = 0u32;
        let mut first_error: Option<SchedulerError> = None;
        while let Some(joined) = set.join_next().await {
            let outcome = joined.unwrap_or_else(|e| Err(SchedulerError::Worker(e.to_string())));
            match outcome {
                Ok(count) => uploaded += count,
                Err(err) => {
                    if first_error.is_none() {
                        if !err.is_cancelled() {
                            tracing::warn!(upload_id = %ctx.upload_id, error = %err, "stopping remaining workers");
                        }
                        ctx.abort.cancel();
                        first_error = Some(err);
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(RunSummary { uploaded, skipped }),
        }
    }
}

async fn worker(ctx: Arc<RunContext>) -> SchedulerResult<u32> {
    let mut uploaded = 0;
    loop {
        if ctx.abort.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }
        let Some(range) = ctx.pending.lock().pop_front() else {
            return Ok(uploaded);
        };

        let chunk = upload_with_retry(&ctx, &range).await?;
        // The receiver only goes away when the engine abandoned this run.
        let _ = ctx.updates.send(chunk);
        uploaded += 1;
    }
}

async fn upload_with_retry(ctx: &RunContext, range: &PartRange) -> SchedulerResult<UploadedChunk> {
    let url = &ctx.part_urls[(range.part_number - 1) as usize];
    let data = ctx.source.read_range(range).await?;
    let policy = ctx.config.retry;
    let max_attempts = policy.max_attempts.max(1);

    let mut attempt = 0;
    loop {
        attempt += 1;
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = ctx.abort.cancelled() => return Err(SchedulerError::Cancelled),
            r = ctx.client.upload_part(url, data.clone(), ctx.config.part_timeout) => r,
        };

        match result {
            Ok(receipt) => {
                metrics::record_part_uploaded(receipt.bytes_sent, started.elapsed());
                tracing::debug!(
                    upload_id = %ctx.upload_id,
                    part_number = range.part_number,
                    attempt,
                    bytes = receipt.bytes_sent,
                    "part uploaded"
                );
                return Ok(UploadedChunk {
                    part_number: range.part_number,
                    etag: receipt.etag,
                    size: receipt.bytes_sent,
                });
            }
            Err(TransferError::Cancelled) => return Err(SchedulerError::Cancelled),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay(attempt);
                metrics::record_part_retry(err.status());
                tracing::warn!(
                    upload_id = %ctx.upload_id,
                    part_number = range.part_number,
                    attempt,
                    max_attempts,
                    error = %err,
                    "part upload failed, retrying in {:?}",
                    delay
                );
                tokio::select! {
                    biased;
                    _ = ctx.abort.cancelled() => return Err(SchedulerError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => {
                return Err(SchedulerError::PartFailed {
                    part_number: range.part_number,
                    attempts: attempt,
                    source: err,
                });
            }
        }
    }
}
