//! Login sessions and API-key checks.
//!
//! - POST /api/login  -> verify the password, set the `session_token` cookie
//! - POST /api/logout -> forget the session and clear the cookie
//!
//! `require_session` and `require_api_key` are mounted as route layers.

use crate::{errors::AppError, state::AppState};
use axum::{
    Json,
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;

pub const SESSION_COOKIE: &str = "session_token";
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

fn secrets_match(expected: &str, supplied: &str) -> bool {
    bool::from(expected.as_bytes().ct_eq(supplied.as_bytes()))
}

/// `POST /api/login`
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    if !secrets_match(&state.config.password, &req.password) {
        tracing::warn!("rejected login attempt");
        return Err(AppError::unauthorized("invalid password"));
    }

    let (token, expires_at) = state.sessions.issue().await;
    let cookie = Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .build();

    Ok((
        jar.add(cookie),
        Json(json!({ "ok": true, "expires_at": expires_at })),
    ))
}

/// `POST /api/logout`
pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> impl IntoResponse {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        state.sessions.delete(cookie.value()).await;
    }
    let jar = jar.remove(Cookie::build(SESSION_COOKIE).path("/"));
    (jar, Json(json!({ "ok": true })))
}

/// Reject requests without a live session cookie.
pub async fn require_session(
    State(state): State<AppState>,
    jar: CookieJar,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let valid = match jar.get(SESSION_COOKIE) {
        Some(cookie) => state.sessions.is_valid(cookie.value()).await,
        None => false,
    };
    if !valid {
        return Err(AppError::unauthorized("login required"));
    }
    Ok(next.run(request).await)
}

/// Reject requests whose `X-API-Key` does not match the configured key.
pub async fn require_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let supplied = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if supplied.is_empty() || !secrets_match(&state.config.api_key, supplied) {
        return Err(AppError::unauthorized("invalid API key"));
    }
    Ok(next.run(request).await)
}
