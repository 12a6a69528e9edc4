//! src/services/pipeline_service.rs
//!
//! PipelineService drives chunked transfers between a client stream and
//! the remote blob host, keeping the SQLite index in step.
//!
//! Upload:   stream -> ChunkSplitter -> CarrierCodec::wrap -> TransferClient::put
//!           -> MetadataStore::append_chunk, strictly in `chunk_order`.
//! Download: MetadataStore::list_chunks_ordered -> TransferClient::get
//!           -> carrier strip -> concatenated output stream.
//!
//! There is no two-phase commit with the remote host. A failed upload
//! leaves chunks `{0..k-1}` indexed and stored; the failure names the
//! chunk order and stage it stopped at so callers can clean up.

use crate::{
    models::{chunk::ChunkRecord, file::FileRecord, share::ShareTarget},
    services::{
        buffer_pool::{BufferPool, PoolStats},
        carrier::{CARRIER_VERSION, CarrierCodec, CarrierError, Unwrapper},
        chunk_splitter::{ChunkSplitter, SplitError, chunk_count},
        metadata_store::{MetadataStore, StoreError},
        transfer_client::{BlobStream, TransferClient, TransferError},
    },
};
use bytes::Bytes;
use futures::{
    Stream, StreamExt, TryStreamExt,
    stream::{self, BoxStream},
};
use serde::Serialize;
use std::{fmt, future::Future, sync::Arc};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("bad input: {0}")]
    BadInput(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("share link not found")]
    ShareNotFound,
    #[error("file {file_id} is incomplete: {reason}")]
    IncompleteFile { file_id: i64, reason: String },
    #[error("chunk {chunk_order} uses carrier version {version}, expected {CARRIER_VERSION}")]
    UnsupportedCarrier { chunk_order: i64, version: i64 },
    #[error("transfer cancelled")]
    Cancelled,
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Carrier(#[from] CarrierError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Where an upload was when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStage {
    Initiated,
    Splitting,
    Transferring,
    Indexing,
    Completed,
}

/// Where a download was when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStage {
    Fetching,
    Unwrapping,
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for DownloadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Terminal `Failed` state of an upload.
///
/// `file_id` is set once the file record exists; `chunk_order` is the chunk
/// being processed when the failure happened. Chunks below it stay indexed.
#[derive(Debug, Error)]
#[error("upload failed while {stage} (file {file_id:?}, chunk {chunk_order:?}): {error}")]
pub struct UploadFailure {
    pub file_id: Option<i64>,
    pub chunk_order: Option<i64>,
    pub stage: UploadStage,
    #[source]
    pub error: PipelineError,
}

/// Terminal `Failed` state of a download, raised after a prefix of the
/// output may already have been emitted.
#[derive(Debug, Error)]
#[error("download failed while {stage} chunk {chunk_order}: {error}")]
pub struct DownloadFailure {
    pub chunk_order: i64,
    pub stage: DownloadStage,
    #[source]
    pub error: PipelineError,
}

impl DownloadFailure {
    fn new(chunk_order: i64, stage: DownloadStage, error: impl Into<PipelineError>) -> Self {
        Self {
            chunk_order,
            stage,
            error: error.into(),
        }
    }
}

/// What the caller supplies alongside the byte stream.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub filename: String,
    pub declared_size: Option<u64>,
    pub credential: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub file_id: i64,
    pub chunk_count: i64,
    pub total_size: i64,
}

/// An opened download: metadata up front, bytes on demand.
pub struct Download {
    pub file: FileRecord,
    pub chunk_count: usize,
    pub body: BoxStream<'static, Result<Bytes, DownloadFailure>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoteDeleteResult {
    pub location: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Local removal is authoritative; remote removal is best effort.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub file_id: i64,
    pub local_chunks_removed: u64,
    pub remote: Vec<RemoteDeleteResult>,
}

impl DeleteOutcome {
    pub fn remote_failures(&self) -> usize {
        self.remote.iter().filter(|r| !r.ok).count()
    }
}

/// PipelineService ties the splitter, carrier codec, blob host and index
/// together. Cloning is cheap; different files transfer fully in parallel
/// while each file's chunks move strictly one after another.
#[derive(Clone)]
pub struct PipelineService {
    pub store: MetadataStore,
    transfer: Arc<dyn TransferClient>,
    codec: CarrierCodec,
    pool: BufferPool,
}

impl PipelineService {
    pub fn new(
        store: MetadataStore,
        transfer: Arc<dyn TransferClient>,
        codec: CarrierCodec,
        pool: BufferPool,
    ) -> Self {
        Self {
            store,
            transfer,
            codec,
            pool,
        }
    }

    pub fn codec(&self) -> &CarrierCodec {
        &self.codec
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Upload `reader` as a new file.
    ///
    /// The file record is created first; each chunk is then wrapped,
    /// transferred, and indexed before the next one is read. The first
    /// failure ends the upload without touching chunks already stored.
    pub async fn upload<R>(
        &self,
        request: UploadRequest,
        reader: R,
        cancel: &CancellationToken,
    ) -> Result<UploadReceipt, UploadFailure>
    where
        R: AsyncRead + Unpin + Send,
    {
        let fail = |file_id: Option<i64>,
                    chunk_order: Option<i64>,
                    stage: UploadStage,
                    error: PipelineError| UploadFailure {
            file_id,
            chunk_order,
            stage,
            error,
        };

        let filename = request.filename.trim();
        if filename.is_empty() {
            return Err(fail(
                None,
                None,
                UploadStage::Initiated,
                PipelineError::BadInput("filename is required".into()),
            ));
        }
        if request.credential.is_empty() {
            return Err(fail(
                None,
                None,
                UploadStage::Initiated,
                PipelineError::BadInput("transfer credential is required".into()),
            ));
        }
        let declared = match request.declared_size.map(i64::try_from) {
            Some(Ok(size)) => Some(size),
            Some(Err(_)) => {
                return Err(fail(
                    None,
                    None,
                    UploadStage::Initiated,
                    PipelineError::BadInput("declared size is too large".into()),
                ));
            }
            None => None,
        };

        let file_id = self
            .store
            .create_file(filename, declared.unwrap_or(0))
            .await
            .map_err(|e| fail(None, None, UploadStage::Initiated, e.into()))?;
        info!(
            file_id,
            filename,
            declared_size = ?declared,
            expected_chunks = ?request
                .declared_size
                .map(|size| chunk_count(size, self.pool.buffer_size())),
            "upload initiated"
        );

        let mut splitter = ChunkSplitter::new(reader, &self.pool, request.declared_size)
            .await
            .map_err(|e| fail(Some(file_id), None, UploadStage::Splitting, e.into()))?;

        let mut indexed: i64 = 0;
        loop {
            let order = indexed;
            let next = cancellable(cancel, async {
                match splitter.next_chunk().await? {
                    Some(chunk) => {
                        debug!(
                            file_id,
                            chunk_order = chunk.order,
                            size = chunk.data.len(),
                            "wrapping chunk"
                        );
                        Ok::<_, PipelineError>(Some(self.codec.wrap(chunk.data)))
                    }
                    None => Ok(None),
                }
            })
            .await
            .map_err(|e| fail(Some(file_id), Some(order), UploadStage::Splitting, e))?;

            let Some(blob) = next else {
                break;
            };

            debug!(file_id, chunk_order = order, size = blob.len(), "transferring chunk");
            let location = cancellable(cancel, async {
                Ok::<_, PipelineError>(self.transfer.put(blob, &request.credential).await?)
            })
            .await
            .map_err(|e| fail(Some(file_id), Some(order), UploadStage::Transferring, e))?;

            // Not cancellable: a stored chunk is always recorded.
            self.store
                .append_chunk(file_id, order, &location, &request.credential, CARRIER_VERSION)
                .await
                .map_err(|e| fail(Some(file_id), Some(order), UploadStage::Indexing, e.into()))?;
            debug!(file_id, chunk_order = order, location = %location, "indexed chunk");

            indexed += 1;
        }

        let total_size = splitter.consumed() as i64;
        self.store
            .complete_file(file_id, total_size, indexed)
            .await
            .map_err(|e| fail(Some(file_id), None, UploadStage::Completed, e.into()))?;

        info!(file_id, chunk_count = indexed, total_size, "upload completed");
        Ok(UploadReceipt {
            file_id,
            chunk_count: indexed,
            total_size,
        })
    }

    /// Locate a file's chunks and return a lazy stream of its bytes.
    ///
    /// Chunks are fetched one at a time as the stream is polled, so a
    /// consumer that stops reading stops further fetches. A failure ends the
    /// stream after whatever prefix was already produced.
    pub async fn open_download(&self, file_id: i64) -> PipelineResult<Download> {
        let file = self.store.get_file(file_id).await?;
        let chunks = self.store.list_chunks_ordered(file_id).await?;
        verify_complete(&file, &chunks)?;

        if let Some(chunk) = chunks.iter().find(|c| c.carrier_version != CARRIER_VERSION) {
            return Err(PipelineError::UnsupportedCarrier {
                chunk_order: chunk.chunk_order,
                version: chunk.carrier_version,
            });
        }

        info!(file_id, chunks = chunks.len(), "download located");
        let chunk_count = chunks.len();
        let body = self.chunk_stream(file_id, chunks);
        Ok(Download {
            file,
            chunk_count,
            body,
        })
    }

    fn chunk_stream(
        &self,
        file_id: i64,
        chunks: Vec<ChunkRecord>,
    ) -> BoxStream<'static, Result<Bytes, DownloadFailure>> {
        let transfer = self.transfer.clone();
        let codec = self.codec.clone();
        let last_order = chunks.len() as i64 - 1;

        stream::iter(chunks)
            .then(move |chunk| {
                let transfer = transfer.clone();
                let unwrapper = codec.unwrapper();
                async move {
                    debug!(file_id, chunk_order = chunk.chunk_order, "fetching chunk");
                    let blob = transfer
                        .get(&chunk.remote_location)
                        .await
                        .map_err(|e| {
                            DownloadFailure::new(chunk.chunk_order, DownloadStage::Fetching, e)
                        })?;
                    Ok::<_, DownloadFailure>(strip_carrier(
                        blob,
                        unwrapper,
                        file_id,
                        chunk.chunk_order,
                        chunk.chunk_order == last_order,
                    ))
                }
            })
            .try_flatten()
            .inspect_err(move |err| warn!(file_id, error = %err, "download failed"))
            .boxed()
    }

    /// Delete a file: index rows first (atomically), then the remote object of
    /// every chunk row that was removed.
    ///
    /// Remote failures are collected rather than raised, so orphaned remote
    /// objects are visible to the caller.
    pub async fn delete_file(&self, file_id: i64, credential: &str) -> PipelineResult<DeleteOutcome> {
        if credential.is_empty() {
            return Err(PipelineError::BadInput(
                "transfer credential is required".into(),
            ));
        }

        let chunks = self
            .store
            .delete_file(file_id, credential)
            .await
            .map_err(|err| match err {
                StoreError::NotOwner(_) => PipelineError::Unauthorized,
                err => err.into(),
            })?;
        let local_chunks_removed = chunks.len() as u64;

        let mut remote = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let result = self
                .transfer
                .delete(&chunk.remote_location, &chunk.owner_token)
                .await;
            if let Err(err) = &result {
                warn!(
                    file_id,
                    chunk_order = chunk.chunk_order,
                    location = %chunk.remote_location,
                    error = %err,
                    "failed to delete remote chunk"
                );
            }
            remote.push(RemoteDeleteResult {
                location: chunk.remote_location.clone(),
                ok: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            });
        }

        let outcome = DeleteOutcome {
            file_id,
            local_chunks_removed,
            remote,
        };
        info!(
            file_id,
            chunks = outcome.local_chunks_removed,
            remote_failures = outcome.remote_failures(),
            "file deleted"
        );
        Ok(outcome)
    }

    /// Resolve a share token to its file.
    pub async fn share_target(&self, token: &str) -> PipelineResult<ShareTarget> {
        if token.is_empty() {
            return Err(PipelineError::BadInput("share token is required".into()));
        }
        self.store
            .find_by_share_token(token)
            .await?
            .ok_or(PipelineError::ShareNotFound)
    }

    /// Open a download through a share token, enforcing its password.
    pub async fn open_shared_download(
        &self,
        token: &str,
        password: Option<&str>,
    ) -> PipelineResult<Download> {
        let target = self.share_target(token).await?;
        if !target.permits(password) {
            return Err(PipelineError::Unauthorized);
        }
        info!(file_id = target.file_id, "download via share link");
        self.open_download(target.file_id).await
    }
}

/// Resolve `fut` unless `cancel` fires first.
async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> PipelineResult<T>
where
    F: Future<Output = PipelineResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        res = fut => res,
    }
}

fn verify_complete(file: &FileRecord, chunks: &[ChunkRecord]) -> PipelineResult<()> {
    let incomplete = |reason: String| PipelineError::IncompleteFile {
        file_id: file.id,
        reason,
    };

    if !file.is_complete() {
        return Err(incomplete("upload did not complete".into()));
    }
    let expected = file.chunk_count.unwrap_or_default();
    if chunks.len() as i64 != expected {
        return Err(incomplete(format!(
            "expected {} chunks, found {}",
            expected,
            chunks.len()
        )));
    }
    if let Some((i, _)) = chunks
        .iter()
        .enumerate()
        .find(|(i, c)| c.chunk_order != *i as i64)
    {
        return Err(incomplete(format!("chunk order gap at {}", i)));
    }
    Ok(())
}

/// Strip the carrier from one fetched blob as its pieces arrive.
fn strip_carrier(
    blob: BlobStream,
    unwrapper: Unwrapper,
    file_id: i64,
    chunk_order: i64,
    is_last: bool,
) -> impl Stream<Item = Result<Bytes, DownloadFailure>> + Send + 'static {
    stream::unfold(Some((blob, unwrapper)), move |state| async move {
        let (mut blob, mut unwrapper) = state?;
        loop {
            match blob.next().await {
                Some(Ok(piece)) => {
                    if let Some(payload) = unwrapper.feed(piece) {
                        return Some((Ok(payload), Some((blob, unwrapper))));
                    }
                }
                Some(Err(err)) => {
                    let failure = DownloadFailure::new(chunk_order, DownloadStage::Fetching, err);
                    return Some((Err(failure), None));
                }
                None => {
                    return match unwrapper.finish() {
                        Ok(()) => {
                            debug!(file_id, chunk_order, "chunk emitted");
                            if is_last {
                                info!(file_id, "download completed");
                            }
                            None
                        }
                        Err(err) => {
                            let failure =
                                DownloadFailure::new(chunk_order, DownloadStage::Unwrapping, err);
                            Some((Err(failure), None))
                        }
                    };
                }
            }
        }
    })
}
