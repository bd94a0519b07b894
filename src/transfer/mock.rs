//! Scripted in-memory [`TransferClient`] for tests and offline hosts.
//!
//! Part URLs handed out by [`MockTransferClient::initiate_transfer`] have the
//! shape `mock://<upload_id>/part/<n>`; the mock parses them back to know
//! which upload and part a PUT belongs to.

use crate::session::UploadedChunk;
use crate::transfer::client::TransferClient;
use crate::transfer::error::{TransferError, TransferResult};
use crate::transfer::types::{InitiateRequest, InitiatedTransfer, PartReceipt};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteCall {
    pub destination_key: String,
    pub upload_id: String,
    pub parts: Vec<UploadedChunk>,
}

#[derive(Default)]
struct MockState {
    chunk_size: u64,
    initiate_failure: Option<u16>,
    complete_failure: Option<u16>,
    list_failure: Option<u16>,
    part_failures: HashMap<u32, VecDeque<TransferError>>,
    held_parts: HashSet<u32>,
    list_held: bool,
    complete_held: bool,
    part_delay: Option<Duration>,
    attempts: HashMap<u32, u32>,
    uploaded: Vec<(String, u32)>,
    remote_parts: HashMap<String, Vec<UploadedChunk>>,
    initiated: Vec<InitiateRequest>,
    completed: Vec<CompleteCall>,
    aborted: Vec<(String, String)>,
    list_calls: u32,
}

pub struct MockTransferClient {
    state: Mutex<MockState>,
    release: watch::Sender<bool>,
}

impl MockTransferClient {
    pub fn new(chunk_size: u64) -> Self {
        let (release, _) = watch::channel(false);
        Self {
            state: Mutex::new(MockState {
                chunk_size,
                ..Default::default()
            }),
            release,
        }
    }

    pub fn part_url(upload_id: &str, part_number: u32) -> String {
        format!("mock://{upload_id}/part/{part_number}")
    }

    pub fn part_urls(upload_id: &str, count: u32) -> Vec<String> {
        (1..=count).map(|n| Self::part_url(upload_id, n)).collect()
    }

    /// Queue errors returned by successive attempts of one part.
    pub fn fail_part(&self, part_number: u32, errors: Vec<TransferError>) {
        self.state
            .lock()
            .part_failures
            .entry(part_number)
            .or_default()
            .extend(errors);
    }

    /// Uploads of `part_number` block until [`release_parts`](Self::release_parts).
    pub fn hold_part(&self, part_number: u32) {
        self.state.lock().held_parts.insert(part_number);
    }

    /// `list_uploaded_parts` blocks until [`release_parts`](Self::release_parts).
    pub fn hold_list_parts(&self) {
        self.state.lock().list_held = true;
    }

    /// `complete_transfer` blocks until [`release_parts`](Self::release_parts).
    /// The call is recorded before it blocks.
    pub fn hold_complete(&self) {
        self.state.lock().complete_held = true;
    }

    /// Let every held call through.
    pub fn release_parts(&self) {
        {
            let mut state = self.state.lock();
            state.held_parts.clear();
            state.list_held = false;
            state.complete_held = false;
        }
        self.release.send_replace(true);
    }

    async fn wait_for_release(&self) -> TransferResult<()> {
        let mut rx = self.release.subscribe();
        rx.wait_for(|released| *released)
            .await
            .map(|_| ())
            .map_err(|_| TransferError::Network("mock shut down".into()))
    }

    pub fn set_part_delay(&self, delay: Duration) {
        self.state.lock().part_delay = Some(delay);
    }

    pub fn fail_initiate(&self, status: u16) {
        self.state.lock().initiate_failure = Some(status);
    }

    pub fn fail_complete(&self, status: u16) {
        self.state.lock().complete_failure = Some(status);
    }

    pub fn fail_list_parts(&self, status: u16) {
        self.state.lock().list_failure = Some(status);
    }

    /// Pretend the backend already holds these parts for `upload_id`.
    pub fn seed_remote_parts(&self, upload_id: &str, parts: Vec<UploadedChunk>) {
        self.state
            .lock()
            .remote_parts
            .insert(upload_id.to_string(), parts);
    }

    /// Total PUT attempts for a part, failed ones included.
    pub fn attempts_for(&self, part_number: u32) -> u32 {
        self.state
            .lock()
            .attempts
            .get(&part_number)
            .copied()
            .unwrap_or(0)
    }

    /// Every PUT attempt, failed ones included.
    pub fn upload_calls(&self) -> u32 {
        self.state.lock().attempts.values().sum()
    }

    /// Part numbers that were accepted, in acceptance order.
    pub fn uploaded_parts(&self) -> Vec<u32> {
        self.state.lock().uploaded.iter().map(|(_, n)| *n).collect()
    }

    pub fn initiate_calls(&self) -> Vec<InitiateRequest> {
        self.state.lock().initiated.clone()
    }

    pub fn complete_calls(&self) -> Vec<CompleteCall> {
        self.state.lock().completed.clone()
    }

    pub fn abort_calls(&self) -> Vec<(String, String)> {
        self.state.lock().aborted.clone()
    }

    pub fn list_calls(&self) -> u32 {
        self.state.lock().list_calls
    }

    fn parse_url(url: &str) -> TransferResult<(String, u32)> {
        let rest = url
            .strip_prefix("mock://")
            .ok_or_else(|| TransferError::Http {
                status: 400,
                message: "not a mock url".into(),
            })?;
        let (upload_id, part) = rest.split_once("/part/").ok_or_else(|| TransferError::Http {
            status: 400,
            message: "malformed mock url".into(),
        })?;
        let part_number = part.parse().map_err(|_| TransferError::Http {
            status: 400,
            message: "malformed part number".into(),
        })?;
        Ok((upload_id.to_string(), part_number))
    }

    async fn put(&self, url: &str, data: Bytes) -> TransferResult<PartReceipt> {
        let (upload_id, part_number) = Self::parse_url(url)?;

        let (scripted, held, delay) = {
            let mut state = self.state.lock();
            *state.attempts.entry(part_number).or_insert(0) += 1;
            let scripted = state
                .part_failures
                .get_mut(&part_number)
                .and_then(|q| q.pop_front());
            (
                scripted,
                state.held_parts.contains(&part_number),
                state.part_delay,
            )
        };

        if held {
            self.wait_for_release().await?;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = scripted {
            return Err(err);
        }

        let etag = format!("\"etag-{upload_id}-{part_number}\"");
        let chunk = UploadedChunk {
            part_number,
            etag: etag.clone(),
            size: data.len() as u64,
        };

        let mut state = self.state.lock();
        state.uploaded.push((upload_id.clone(), part_number));
        let remote = state.remote_parts.entry(upload_id).or_default();
        remote.retain(|p| p.part_number != part_number);
        remote.push(chunk);

        Ok(PartReceipt {
            etag,
            bytes_sent: data.len() as u64,
        })
    }
}

impl TransferClient for MockTransferClient {
    fn initiate_transfer(
        &self,
        request: InitiateRequest,
    ) -> BoxFuture<'_, TransferResult<InitiatedTransfer>> {
        async move {
            let mut state = self.state.lock();
            state.initiated.push(request.clone());
            if let Some(status) = state.initiate_failure {
                return Err(TransferError::Initiation {
                    status,
                    message: "initiate rejected".into(),
                });
            }

            let upload_id = uuid::Uuid::new_v4().to_string();
            let chunk_size = state.chunk_size.max(1);
            let parts = request.file_size.div_ceil(chunk_size).max(1) as u32;
            Ok(InitiatedTransfer {
                destination_key: request.destination_key.clone().unwrap_or_else(|| {
                    format!("uploads/{}/{}", request.project_id, request.file_name)
                }),
                part_urls: Self::part_urls(&upload_id, parts),
                upload_id,
                chunk_size,
            })
        }
        .boxed()
    }

    fn upload_part<'a>(
        &'a self,
        url: &'a str,
        data: Bytes,
        deadline: Duration,
    ) -> BoxFuture<'a, TransferResult<PartReceipt>> {
        async move {
            match tokio::time::timeout(deadline, self.put(url, data)).await {
                Ok(result) => result,
                Err(_) => Err(TransferError::Timeout(deadline)),
            }
        }
        .boxed()
    }

    fn list_uploaded_parts<'a>(
        &'a self,
        _destination_key: &'a str,
        upload_id: &'a str,
    ) -> BoxFuture<'a, TransferResult<Vec<UploadedChunk>>> {
        async move {
            let held = {
                let mut state = self.state.lock();
                state.list_calls += 1;
                state.list_held
            };
            if held {
                self.wait_for_release().await?;
            }

            let state = self.state.lock();
            if let Some(status) = state.list_failure {
                return Err(TransferError::Http {
                    status,
                    message: "list rejected".into(),
                });
            }
            let mut parts = state.remote_parts.get(upload_id).cloned().unwrap_or_default();
            parts.sort_by_key(|p| p.part_number);
            Ok(parts)
        }
        .boxed()
    }

    fn complete_transfer<'a>(
        &'a self,
        destination_key: &'a str,
        upload_id: &'a str,
        parts: &'a [UploadedChunk],
    ) -> BoxFuture<'a, TransferResult<String>> {
        async move {
            let held = {
                let mut state = self.state.lock();
                state.completed.push(CompleteCall {
                    destination_key: destination_key.to_string(),
                    upload_id: upload_id.to_string(),
                    parts: parts.to_vec(),
                });
                state.complete_held
            };
            if held {
                self.wait_for_release().await?;
            }

            let state = self.state.lock();
            if let Some(status) = state.complete_failure {
                return Err(TransferError::Completion {
                    status,
                    message: "complete rejected".into(),
                });
            }
            if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
                return Err(TransferError::Completion {
                    status: 400,
                    message: "parts out of order".into(),
                });
            }
            Ok(destination_key.to_string())
        }
        .boxed()
    }

    fn abort_transfer<'a>(
        &'a self,
        destination_key: &'a str,
        upload_id: &'a str,
    ) -> BoxFuture<'a, TransferResult<()>> {
        async move {
            let mut state = self.state.lock();
            state
                .aborted
                .push((destination_key.to_string(), upload_id.to_string()));
            state.remote_parts.remove(upload_id);
            Ok(())
        }
        .boxed()
    }
}
