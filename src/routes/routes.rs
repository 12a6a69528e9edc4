//! Defines routes for the web client, share links and the `/api/v1` API.
//!
//! ## Structure
//! - **Public**
//!   - `GET  /healthz`, `GET /readyz`
//!   - `POST /api/login`, `POST /api/logout`
//!   - `GET  /api/share/info?file=`, `GET /api/share/download?file=&password=`
//!   - `GET  /api/v1/files/public/download/{id}`
//!
//! - **Session cookie required**
//!   - `POST   /api/upload`, `GET /api/download/{id}`, `DELETE /api/delete/{id}`
//!   - `GET    /api/files`, `POST /api/share`, `GET /api/file/share-details`
//!   - `GET    /api/config`
//!
//! - **`X-API-Key` required**
//!   - `POST   /api/v1/files/upload`, `GET /api/v1/files/download/{id}`
//!   - `DELETE /api/v1/files/delete/{id}`
//!
//! Upload routes have no body size limit; bodies are streamed in chunks.

use crate::{
    handlers::{
        api_handlers::{api_delete, api_download, api_upload},
        auth_handlers::{login, logout, require_api_key, require_session},
        file_handlers::{
            client_config, create_share, delete_file, download_file, list_files, share_details,
            upload_file,
        },
        health_handlers::{healthz, readyz},
        share_handlers::{share_download, share_info},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
};

/// Build the application router with its shared state attached.
pub fn routes(state: AppState) -> Router {
    let session_routes = Router::new()
        .route(
            "/api/upload",
            post(upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/download/{id}", get(download_file))
        .route("/api/delete/{id}", delete(delete_file))
        .route("/api/files", get(list_files))
        .route("/api/share", post(create_share))
        .route("/api/file/share-details", get(share_details))
        .route("/api/config", get(client_config))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_session,
        ));

    let api_routes = Router::new()
        .route(
            "/api/v1/files/upload",
            post(api_upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/v1/files/download/{id}", get(api_download))
        .route("/api/v1/files/delete/{id}", delete(api_delete))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/share/info", get(share_info))
        .route("/api/share/download", get(share_download))
        .route("/api/v1/files/public/download/{id}", get(api_download))
        .merge(session_routes)
        .merge(api_routes)
        .with_state(state)
}
