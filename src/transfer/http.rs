//! Coordination-service client over HTTP.
//!
//! JSON endpoints live under a base URL (`/initiate`, `/complete`, `/abort`,
//! `/list-parts`); part bytes go straight to the pre-signed URLs the backend
//! hands out.

use crate::session::UploadedChunk;
use crate::transfer::client::TransferClient;
use crate::transfer::error::{TransferError, TransferResult};
use crate::transfer::types::{InitiateRequest, InitiatedTransfer, PartReceipt};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, ETAG};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest error body we keep from a failed response.
const MAX_ERROR_BODY: usize = 512;

/// Default budget for one coordination request. Part PUTs use the deadline
/// passed to `upload_part` instead.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitiateResponse {
    upload_id: String,
    key: String,
    presigned_urls: Vec<String>,
    chunk_size: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransferRef<'a> {
    key: &'a str,
    upload_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteRequest<'a> {
    key: &'a str,
    upload_id: &'a str,
    parts: &'a [UploadedChunk],
}

#[derive(Debug, Deserialize)]
struct CompleteResponse {
    key: String,
}

#[derive(Debug, Deserialize)]
struct ListPartsResponse {
    parts: Vec<UploadedChunk>,
}

/// [`TransferClient`] backed by `reqwest`.
///
/// The bearer token only goes to the coordination endpoints. Pre-signed part
/// URLs carry their own credentials and reject a second auth mechanism.
#[derive(Clone)]
pub struct HttpTransferClient {
    http: reqwest::Client,
    base_url: String,
    auth: Option<HeaderValue>,
    request_timeout: Duration,
}

impl HttpTransferClient {
    pub fn new(base_url: impl Into<String>) -> TransferResult<Self> {
        Self::build(base_url.into(), None)
    }

    /// Client that sends `Authorization: Bearer <token>` to the
    /// coordination endpoints.
    pub fn with_bearer_token(base_url: impl Into<String>, token: &str) -> TransferResult<Self> {
        Self::build(base_url.into(), Some(token))
    }

    fn build(base_url: String, token: Option<&str>) -> TransferResult<Self> {
        let auth = match token {
            Some(token) => {
                let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| TransferError::Decode("invalid bearer token".into()))?;
                value.set_sensitive(true);
                Some(value)
            }
            None => None,
        };

        let http = reqwest::Client::builder().build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Bound each initiate, list, complete and abort call.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn coordination(&self, path: &str) -> RequestBuilder {
        let request = self
            .http
            .post(self.endpoint(path))
            .timeout(self.request_timeout);
        match &self.auth {
            Some(auth) => request.header(AUTHORIZATION, auth.clone()),
            None => request,
        }
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> TransferResult<Result<T, (u16, String)>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self.coordination(path).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Ok(Err((status.as_u16(), error_body(resp).await)));
        }
        let bytes = resp.bytes().await?;
        Ok(Ok(serde_json::from_slice(&bytes)?))
    }

    async fn initiate(&self, request: InitiateRequest) -> TransferResult<InitiatedTransfer> {
        let resp: InitiateResponse = self
            .post_json("initiate", &request)
            .await?
            .map_err(|(status, message)| TransferError::Initiation { status, message })?;

        Ok(InitiatedTransfer {
            upload_id: resp.upload_id,
            destination_key: resp.key,
            part_urls: resp.presigned_urls,
            chunk_size: resp.chunk_size,
        })
    }

    async fn put_part(&self, url: &str, data: Bytes) -> TransferResult<PartReceipt> {
        let bytes_sent = data.len() as u64;
        let resp = self
            .http
            .put(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransferError::Http {
                status: status.as_u16(),
                message: error_body(resp).await,
            });
        }

        let etag = resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(TransferError::MissingEtag)?
            .to_string();

        Ok(PartReceipt { etag, bytes_sent })
    }

    async fn list_parts(&self, key: &str, upload_id: &str) -> TransferResult<Vec<UploadedChunk>> {
        let resp: ListPartsResponse = self
            .post_json("list-parts", &TransferRef { key, upload_id })
            .await?
            .map_err(|(status, message)| TransferError::Http { status, message })?;

        let mut parts = resp.parts;
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedChunk],
    ) -> TransferResult<String> {
        let resp: CompleteResponse = self
            .post_json(
                "complete",
                &CompleteRequest {
                    key,
                    upload_id,
                    parts,
                },
            )
            .await?
            .map_err(|(status, message)| TransferError::Completion { status, message })?;

        Ok(resp.key)
    }

    async fn abort(&self, key: &str, upload_id: &str) -> TransferResult<()> {
        // Abort replies may have an empty body, so only the status matters.
        let resp = self
            .coordination("abort")
            .json(&TransferRef { key, upload_id })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransferError::Http {
                status: status.as_u16(),
                message: error_body(resp).await,
            });
        }
        Ok(())
    }
}

impl TransferClient for HttpTransferClient {
    fn initiate_transfer(
        &self,
        request: InitiateRequest,
    ) -> BoxFuture<'_, TransferResult<InitiatedTransfer>> {
        self.initiate(request).boxed()
    }

    fn upload_part<'a>(
        &'a self,
        url: &'a str,
        data: Bytes,
        deadline: Duration,
    ) -> BoxFuture<'a, TransferResult<PartReceipt>> {
        async move {
            match tokio::time::timeout(deadline, self.put_part(url, data)).await {
                Ok(result) => result,
                Err(_) => Err(TransferError::Timeout(deadline)),
            }
        }
        .boxed()
    }

    fn list_uploaded_parts<'a>(
        &'a self,
        destination_key: &'a str,
        upload_id: &'a str,
    ) -> BoxFuture<'a, TransferResult<Vec<UploadedChunk>>> {
        self.list_parts(destination_key, upload_id).boxed()
    }

    fn complete_transfer<'a>(
        &'a self,
        destination_key: &'a str,
        upload_id: &'a str,
        parts: &'a [UploadedChunk],
    ) -> BoxFuture<'a, TransferResult<String>> {
        self.complete(destination_key, upload_id, parts).boxed()
    }

    fn abort_transfer<'a>(
        &'a self,
        destination_key: &'a str,
        upload_id: &'a str,
    ) -> BoxFuture<'a, TransferResult<()>> {
        self.abort(destination_key, upload_id).boxed()
    }
}

async fn error_body(resp: Response) -> String {
    let mut body = resp.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}
