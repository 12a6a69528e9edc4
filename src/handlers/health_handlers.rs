//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the metadata store and carrier codec

use crate::{services::carrier::CARRIER_LEN, state::AppState};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Very small liveness probe; always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Runs a lightweight query against SQLite (`SELECT 1`).
/// 2. Wraps and unwraps a probe payload through the carrier codec.
///
/// Returns JSON describing each check plus buffer pool usage. HTTP 200 when
/// all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let sqlite_check = match state.pipeline.store.ping().await {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };

    let codec = state.pipeline.codec();
    let probe: &[u8] = b"readyz";
    let carrier_check = match codec.unwrap(codec.wrap(probe)) {
        Ok(payload) if payload.as_ref() == probe && codec.carrier_len() == CARRIER_LEN => {
            CheckStatus::ok()
        }
        Ok(_) => CheckStatus::failed("payload mismatch".into()),
        Err(e) => CheckStatus::failed(e.to_string()),
    };

    let overall_ok = sqlite_check.ok && carrier_check.ok;

    let mut checks = HashMap::new();
    checks.insert("sqlite", sqlite_check);
    checks.insert("carrier", carrier_check);

    let pool = state.pipeline.pool_stats();
    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
        buffers: BufferUsage {
            idle: pool.idle,
            available: pool.available,
            max: pool.max_buffers,
        },
        sessions: state.sessions.len().await,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
    buffers: BufferUsage,
    sessions: usize,
}

#[derive(Serialize)]
struct BufferUsage {
    idle: usize,
    available: usize,
    max: usize,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
