//! Public share-link endpoints. The share token is the capability; an
//! optional password narrows it further.

use crate::{
    errors::AppError, handlers::file_handlers::download_response, models::share::ShareInfo,
    state::AppState,
};
use axum::{
    Json,
    extract::{Query, State},
    response::Response,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ShareQuery {
    #[serde(default)]
    pub file: String,
    pub password: Option<String>,
}

/// `GET /api/share/info?file=<token>`
pub async fn share_info(
    State(state): State<AppState>,
    Query(query): Query<ShareQuery>,
) -> Result<Json<ShareInfo>, AppError> {
    let target = state.pipeline.share_target(&query.file).await?;
    Ok(Json(ShareInfo {
        has_password: target.requires_password(),
        filename: target.filename,
        filesize: target.filesize,
    }))
}

/// `GET /api/share/download?file=<token>&password=`
pub async fn share_download(
    State(state): State<AppState>,
    Query(query): Query<ShareQuery>,
) -> Result<Response, AppError> {
    let download = state
        .pipeline
        .open_shared_download(&query.file, query.password.as_deref())
        .await?;
    Ok(download_response(download))
}
