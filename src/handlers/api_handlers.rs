//! Programmatic `/api/v1` endpoints.
//!
//! Uploads take the raw request body; the filename comes from
//! `Content-Disposition` and `Content-Length`, when present, is the
//! declared size the stream must match.

use crate::{
    errors::AppError,
    handlers::file_handlers::{DeleteResponse, download_response, transfer_credential},
    services::pipeline_service::UploadRequest,
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, header},
    response::Response,
};
use futures::TryStreamExt;
use serde::Serialize;
use std::io;
use tokio_util::io::StreamReader;

#[derive(Debug, Serialize)]
pub struct ApiUploadResponse {
    pub ok: bool,
    pub file_id: i64,
    pub url: String,
}

/// Pull the filename out of `attachment; filename="..."`.
///
/// Accepts quoted and bare values; the first `filename=` parameter wins.
pub fn parse_content_disposition(value: &str) -> Option<String> {
    value
        .split(';')
        .map(str::trim)
        .find_map(|param| {
            let (key, raw) = param.split_once('=')?;
            if !key.trim().eq_ignore_ascii_case("filename") {
                return None;
            }
            let raw = raw.trim();
            let name = raw
                .strip_prefix('"')
                .and_then(|r| r.strip_suffix('"'))
                .unwrap_or(raw);
            Some(name.to_string())
        })
        .filter(|name| !name.is_empty())
}

/// `POST /api/v1/files/upload`
pub async fn api_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<ApiUploadResponse>, AppError> {
    let credential = transfer_credential(&headers)?;
    let filename = headers
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_disposition)
        .ok_or_else(|| {
            AppError::bad_input("Content-Disposition header with a filename is required")
        })?;
    let declared_size = match headers.get(header::CONTENT_LENGTH) {
        Some(value) => Some(
            value
                .to_str()
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| AppError::bad_input("invalid Content-Length"))?,
        ),
        None => None,
    };

    let stream = body.into_data_stream().map_err(io::Error::other);
    let reader = StreamReader::new(stream);

    let cancel = state.shutdown.child_token();
    let request = UploadRequest {
        filename,
        declared_size,
        credential,
    };
    let receipt = state.pipeline.upload(request, reader, &cancel).await?;

    Ok(Json(ApiUploadResponse {
        ok: true,
        file_id: receipt.file_id,
        url: format!("/api/v1/files/public/download/{}", receipt.file_id),
    }))
}

/// `GET /api/v1/files/download/{id}` and `GET /api/v1/files/public/download/{id}`
pub async fn api_download(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
) -> Result<Response, AppError> {
    let download = state.pipeline.open_download(file_id).await?;
    Ok(download_response(download))
}

/// `DELETE /api/v1/files/delete/{id}`
pub async fn api_delete(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, AppError> {
    let credential = transfer_credential(&headers)?;
    let outcome = state.pipeline.delete_file(file_id, &credential).await?;
    Ok(Json(outcome.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_and_bare_filenames() {
        assert_eq!(
            parse_content_disposition("attachment; filename=\"report.pdf\"").as_deref(),
            Some("report.pdf")
        );
        assert_eq!(
            parse_content_disposition("attachment; filename=notes.txt").as_deref(),
            Some("notes.txt")
        );
        assert_eq!(
            parse_content_disposition("attachment;FILENAME=\"a b.tar.gz\"").as_deref(),
            Some("a b.tar.gz")
        );
    }

    #[test]
    fn missing_or_empty_filename_is_none() {
        assert_eq!(parse_content_disposition("attachment"), None);
        assert_eq!(parse_content_disposition("attachment; filename=\"\""), None);
        assert_eq!(parse_content_disposition(""), None);
    }
}
