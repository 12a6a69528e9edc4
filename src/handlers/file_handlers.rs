//! Session-protected file operations used by the web client.
//! Upload and download bodies are streamed chunk by chunk; neither side is
//! buffered whole in memory.

use crate::{
    errors::AppError,
    models::{
        file::FileRecord,
        share::{CreateShareRequest, ShareDetails},
    },
    services::pipeline_service::{DeleteOutcome, Download, RemoteDeleteResult, UploadRequest},
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io;
use tokio_util::io::StreamReader;

/// Header carrying the caller's credential for the remote blob host.
pub const CREDENTIAL_HEADER: &str = "auth-token";

const FILE_FIELD: &str = "image";
const SIZE_FIELD: &str = "filesize";

#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ShareDetailsQuery {
    pub id: i64,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub ok: bool,
    pub file_id: i64,
    pub filesize: i64,
    pub chunks: i64,
}

#[derive(Debug, Serialize)]
pub struct LocalDelete {
    pub ok: bool,
    pub chunks_removed: u64,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub ok: bool,
    pub file_id: i64,
    pub local: LocalDelete,
    pub remote: Vec<RemoteDeleteResult>,
}

impl From<DeleteOutcome> for DeleteResponse {
    fn from(outcome: DeleteOutcome) -> Self {
        Self {
            ok: true,
            file_id: outcome.file_id,
            local: LocalDelete {
                ok: true,
                chunks_removed: outcome.local_chunks_removed,
            },
            remote: outcome.remote,
        }
    }
}

/// Required `Auth-Token` header.
pub(crate) fn transfer_credential(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(CREDENTIAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::bad_input("Auth-Token header is required"))
}

/// Stream a download with its headers set from the file record.
///
/// `Content-Length` is the recorded size, so a body that ends early is seen
/// by the client as a truncated transfer.
pub(crate) fn download_response(download: Download) -> Response {
    let Download {
        file,
        chunk_count,
        body,
    } = download;
    tracing::debug!(file_id = file.id, chunks = chunk_count, "streaming download");

    let mut response = Response::new(Body::from_stream(body));
    let headers = response.headers_mut();

    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file.total_size));
    let disposition = format!(
        "attachment; filename=\"{}\"",
        file.filename.replace(['"', '\\', '\r', '\n'], "_")
    );
    if let Ok(value) = HeaderValue::from_bytes(disposition.as_bytes()) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

/// `POST /api/upload`
///
/// Multipart body with the file in the `image` part. A `filesize` part sent
/// before it declares the expected length.
pub async fn upload_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let credential = transfer_credential(&headers)?;
    let mut declared_size = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_input(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            SIZE_FIELD => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::bad_input(format!("invalid filesize part: {}", e)))?;
                let size = text
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| AppError::bad_input("filesize must be a byte count"))?;
                declared_size = Some(size);
            }
            FILE_FIELD => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| AppError::bad_input("file part has no filename"))?;

                let reader = StreamReader::new(field.map_err(io::Error::other));
                tokio::pin!(reader);

                let cancel = state.shutdown.child_token();
                let request = UploadRequest {
                    filename,
                    declared_size,
                    credential,
                };
                let receipt = state.pipeline.upload(request, reader, &cancel).await?;

                return Ok(Json(UploadResponse {
                    ok: true,
                    file_id: receipt.file_id,
                    filesize: receipt.total_size,
                    chunks: receipt.chunk_count,
                }));
            }
            _ => continue,
        }
    }

    Err(AppError::bad_input("missing `image` file part"))
}

/// `GET /api/download/{id}`
pub async fn download_file(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
) -> Result<Response, AppError> {
    let download = state.pipeline.open_download(file_id).await?;
    Ok(download_response(download))
}

/// `DELETE /api/delete/{id}`
pub async fn delete_file(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, AppError> {
    let credential = transfer_credential(&headers)?;
    let outcome = state.pipeline.delete_file(file_id, &credential).await?;
    Ok(Json(outcome.into()))
}

/// `GET /api/files?search=`
pub async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<ListFilesQuery>,
) -> Result<Json<Vec<FileRecord>>, AppError> {
    let search = query.search.as_deref().filter(|s| !s.is_empty());
    let files = state.pipeline.store.list_files(search).await?;
    Ok(Json(files))
}

/// `POST /api/share`
pub async fn create_share(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateShareRequest>,
) -> Result<impl IntoResponse, AppError> {
    let token = state.pipeline.store.set_share(req.file_id, &req.password).await?;
    tracing::info!(
        file_id = req.file_id,
        protected = !req.password.is_empty(),
        "share link created"
    );

    let base = match &state.config.public_host {
        Some(host) => host.clone(),
        None => headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|host| format!("http://{}", host))
            .unwrap_or_default(),
    };
    let share_link = format!("{}/share.html?file={}", base, token);

    Ok(Json(json!({ "share_link": share_link, "share_token": token })))
}

/// `GET /api/file/share-details?id=`
pub async fn share_details(
    State(state): State<AppState>,
    Query(query): Query<ShareDetailsQuery>,
) -> Result<Json<ShareDetails>, AppError> {
    Ok(Json(state.pipeline.store.share_details(query.id).await?))
}

/// `GET /api/config`
pub async fn client_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "authToken": state.config.auth_token.clone().unwrap_or_default() }))
}
