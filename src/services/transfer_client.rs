//! Client for the remote blob host.
//!
//! The host accepts a binary blob and returns a path, serves the blob back
//! from that path, and deletes it when presented with the credential that
//! uploaded it. Calls are not idempotent: retrying a `put` can leave a
//! duplicate object under a different path.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use reqwest::{
    Client, StatusCode,
    multipart::{Form, Part},
};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const TOTAL_TIMEOUT_SECS: u64 = 300;
const UPLOAD_PATH: &str = "/image";
const UPLOAD_FIELD: &str = "image";
const UPLOAD_FILENAME: &str = "chunk.png";
const CREDENTIAL_HEADER: &str = "Auth-Token";

// The host only serves images to requests that look like an image fetch.
const FETCH_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36";
const FETCH_ACCEPT: &str = "image/avif,image/webp,image/apng,image/svg+xml,image/*,*/*;q=0.8";
const FETCH_REFERER: &str = "https://xviewer.pages.dev/";

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request to blob host failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("blob host answered {status} for {location}")]
    Status { status: u16, location: String },
    #[error("blob host rejected the upload")]
    Rejected,
    #[error("blob host has no object at {0}")]
    NotFound(String),
    #[error("credential does not own {0}")]
    Forbidden(String),
}

pub type TransferResult<T> = Result<T, TransferError>;

/// Body of a fetched blob, delivered as it arrives.
pub type BlobStream = BoxStream<'static, TransferResult<Bytes>>;

/// Remote blob host contract.
#[async_trait]
pub trait TransferClient: Send + Sync + 'static {
    /// Store `blob`, returning the location the host assigned to it.
    async fn put(&self, blob: Bytes, credential: &str) -> TransferResult<String>;

    /// Fetch the blob stored at `location`.
    async fn get(&self, location: &str) -> TransferResult<BlobStream>;

    /// Delete the blob at `location`; `credential` must be the one that stored it.
    async fn delete(&self, location: &str, credential: &str) -> TransferResult<()>;
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    src: String,
}

/// [`TransferClient`] speaking the image host's HTTP API.
#[derive(Clone, Debug)]
pub struct HttpTransferClient {
    client: Client,
    base_url: String,
}

impl HttpTransferClient {
    pub fn new(base_url: impl Into<String>) -> TransferResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(TOTAL_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, location: &str) -> String {
        if location.starts_with('/') {
            format!("{}{}", self.base_url, location)
        } else {
            format!("{}/{}", self.base_url, location)
        }
    }
}

#[async_trait]
impl TransferClient for HttpTransferClient {
    async fn put(&self, blob: Bytes, credential: &str) -> TransferResult<String> {
        let size = blob.len();
        let part = Part::stream(blob)
            .file_name(UPLOAD_FILENAME)
            .mime_str("image/png")?;
        let form = Form::new().part(UPLOAD_FIELD, part);

        let resp = self
            .client
            .post(format!("{}{}", self.base_url, UPLOAD_PATH))
            .header(CREDENTIAL_HEADER, credential)
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(TransferError::Status {
                status: resp.status().as_u16(),
                location: UPLOAD_PATH.to_string(),
            });
        }

        let body: UploadResponse = resp.json().await?;
        if !body.ok || body.src.is_empty() {
            return Err(TransferError::Rejected);
        }

        tracing::debug!(size, location = %body.src, "stored blob");
        Ok(body.src)
    }

    async fn get(&self, location: &str) -> TransferResult<BlobStream> {
        let resp = self
            .client
            .get(self.url_for(location))
            .header(reqwest::header::USER_AGENT, FETCH_USER_AGENT)
            .header(reqwest::header::ACCEPT, FETCH_ACCEPT)
            .header(reqwest::header::REFERER, FETCH_REFERER)
            .header("Sec-Fetch-Dest", "image")
            .header("Sec-Fetch-Mode", "no-cors")
            .header("Sec-Fetch-Site", "cross-site")
            .send()
            .await?;

        match resp.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(TransferError::NotFound(location.to_string())),
            status => {
                return Err(TransferError::Status {
                    status: status.as_u16(),
                    location: location.to_string(),
                });
            }
        }

        Ok(resp.bytes_stream().map_err(TransferError::from).boxed())
    }

    async fn delete(&self, location: &str, credential: &str) -> TransferResult<()> {
        // The host exposes deletion as an authenticated GET on the object path.
        let resp = self
            .client
            .get(self.url_for(location))
            .header(CREDENTIAL_HEADER, credential)
            .send()
            .await?;

        if matches!(resp.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(TransferError::Forbidden(location.to_string()));
        }
        if resp.status() != StatusCode::OK {
            return Err(TransferError::Status {
                status: resp.status().as_u16(),
                location: location.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod memory {
    //! In-process blob host with failure injection, for pipeline tests.

    use super::*;
    use futures::stream;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct MemoryTransferClient {
        objects: Mutex<HashMap<String, (Bytes, String)>>,
        puts: AtomicUsize,
        fail_put_at: Mutex<Option<usize>>,
        fail_get: Mutex<HashSet<String>>,
        truncate_get: Mutex<HashSet<String>>,
        fail_delete: Mutex<HashSet<String>>,
        piece_size: Mutex<Option<usize>>,
    }

    impl MemoryTransferClient {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the `n`th `put` (zero-based) and every one after it.
        pub fn fail_put_at(&self, n: usize) {
            *self.fail_put_at.lock() = Some(n);
        }

        pub fn fail_get(&self, location: &str) {
            self.fail_get.lock().insert(location.to_string());
        }

        /// Serve only the first 100 bytes of `location`.
        pub fn truncate_get(&self, location: &str) {
            self.truncate_get.lock().insert(location.to_string());
        }

        pub fn fail_delete(&self, location: &str) {
            self.fail_delete.lock().insert(location.to_string());
        }

        /// Deliver fetched blobs in pieces of `size` bytes.
        pub fn set_piece_size(&self, size: usize) {
            *self.piece_size.lock() = Some(size);
        }

        pub fn object_count(&self) -> usize {
            self.objects.lock().len()
        }

        pub fn contains(&self, location: &str) -> bool {
            self.objects.lock().contains_key(location)
        }

        pub fn put_count(&self) -> usize {
            self.puts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TransferClient for MemoryTransferClient {
        async fn put(&self, blob: Bytes, credential: &str) -> TransferResult<String> {
            let n = self.puts.fetch_add(1, Ordering::SeqCst);
            if self.fail_put_at.lock().is_some_and(|at| n >= at) {
                return Err(TransferError::Status {
                    status: 502,
                    location: UPLOAD_PATH.to_string(),
                });
            }
            let location = format!("/file/{}.png", uuid::Uuid::new_v4());
            self.objects
                .lock()
                .insert(location.clone(), (blob, credential.to_string()));
            Ok(location)
        }

        async fn get(&self, location: &str) -> TransferResult<BlobStream> {
            if self.fail_get.lock().contains(location) {
                return Err(TransferError::Status {
                    status: 503,
                    location: location.to_string(),
                });
            }
            let mut blob = self
                .objects
                .lock()
                .get(location)
                .map(|(blob, _)| blob.clone())
                .ok_or_else(|| TransferError::NotFound(location.to_string()))?;
            if self.truncate_get.lock().contains(location) {
                blob.truncate(100);
            }

            let piece = self.piece_size.lock().unwrap_or(blob.len().max(1));
            let pieces: Vec<TransferResult<Bytes>> = blob
                .chunks(piece)
                .map(|p| Ok(Bytes::copy_from_slice(p)))
                .collect();
            Ok(stream::iter(pieces).boxed())
        }

        async fn delete(&self, location: &str, credential: &str) -> TransferResult<()> {
            if self.fail_delete.lock().contains(location) {
                return Err(TransferError::Status {
                    status: 500,
                    location: location.to_string(),
                });
            }
            let mut objects = self.objects.lock();
            match objects.get(location) {
                None => Err(TransferError::NotFound(location.to_string())),
                Some((_, owner)) if owner != credential => {
                    Err(TransferError::Forbidden(location.to_string()))
                }
                Some(_) => {
                    objects.remove(location);
                    Ok(())
                }
            }
        }
    }
}
