use crate::services::{
    carrier::CarrierError,
    chunk_splitter::SplitError,
    metadata_store::StoreError,
    pipeline_service::{PipelineError, UploadFailure},
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};
use std::fmt;

/// Error returned by handlers, rendered as a JSON body.
///
/// `kind` is a stable machine-readable tag; `message` is safe to show to
/// clients. Internal detail (SQL, remote responses) is logged, not returned.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
    pub details: Map<String, Value>,
}

impl AppError {
    pub fn new(status: StatusCode, kind: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: msg.into(),
            details: Map::new(),
        }
    }

    /// Attach an extra field to the response body.
    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", msg)
    }

    pub fn bad_input(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_input", msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = self.details;
        body.insert("error".into(), json!(self.message));
        body.insert("kind".into(), json!(self.kind));
        body.insert("status".into(), json!(self.status.as_u16()));

        (self.status, Json(Value::Object(body))).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = ?err, "unhandled error");
        AppError::internal("internal error")
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::FileNotFound(id) => AppError::not_found(format!("file {} not found", id)),
            StoreError::NotOwner(_) => AppError::unauthorized("credential does not match"),
            StoreError::OrderConflict { .. } => {
                tracing::warn!(error = %err, "chunk index conflict");
                AppError::new(StatusCode::CONFLICT, "store_failure", "chunk index conflict")
            }
            StoreError::Sqlx(ref e) => {
                tracing::error!(error = %e, "metadata store failure");
                AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "store_failure",
                    "metadata store failure",
                )
            }
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::BadInput(msg) => AppError::bad_input(msg),
            PipelineError::Unauthorized => AppError::unauthorized("credential does not match"),
            PipelineError::ShareNotFound => AppError::not_found("share link not found"),
            PipelineError::IncompleteFile { .. } => {
                AppError::new(StatusCode::CONFLICT, "incomplete_file", err.to_string())
            }
            PipelineError::UnsupportedCarrier { .. } => AppError::new(
                StatusCode::CONFLICT,
                "unsupported_carrier",
                err.to_string(),
            ),
            PipelineError::Cancelled => AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "cancelled",
                "server is shutting down",
            ),
            PipelineError::Split(SplitError::LengthMismatch { .. }) => {
                AppError::new(StatusCode::BAD_REQUEST, "length_mismatch", err.to_string())
            }
            PipelineError::Split(SplitError::Io(ref e)) => {
                tracing::warn!(error = %e, "client stream failed");
                AppError::bad_input("failed to read request body")
            }
            PipelineError::Split(SplitError::PoolClosed) => {
                AppError::internal("chunk buffers unavailable")
            }
            PipelineError::Carrier(CarrierError::TruncatedCarrier { .. }) => {
                AppError::new(StatusCode::BAD_GATEWAY, "truncated_carrier", err.to_string())
            }
            PipelineError::Carrier(ref e) => {
                tracing::error!(error = %e, "carrier failure");
                AppError::internal("carrier failure")
            }
            PipelineError::Transfer(ref e) => {
                tracing::warn!(error = %e, "remote transfer failed");
                AppError::new(
                    StatusCode::BAD_GATEWAY,
                    "remote_transfer_failure",
                    "remote transfer failed",
                )
            }
            PipelineError::Store(e) => e.into(),
        }
    }
}

impl From<UploadFailure> for AppError {
    fn from(failure: UploadFailure) -> Self {
        let mut err = AppError::from(failure.error).with_detail("stage", failure.stage.to_string());
        if let Some(file_id) = failure.file_id {
            err = err.with_detail("file_id", file_id);
        }
        if let Some(order) = failure.chunk_order {
            err = err.with_detail("chunk_order", order);
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::pipeline_service::UploadStage;
    use http_body_util::BodyExt;

    async fn body_json(err: AppError) -> (StatusCode, Value) {
        let resp = err.into_response();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn upload_failure_names_the_chunk() {
        let failure = UploadFailure {
            file_id: Some(7),
            chunk_order: Some(3),
            stage: UploadStage::Transferring,
            error: PipelineError::Transfer(
                crate::services::transfer_client::TransferError::Rejected,
            ),
        };
        let (status, body) = body_json(failure.into()).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["kind"], "remote_transfer_failure");
        assert_eq!(body["file_id"], 7);
        assert_eq!(body["chunk_order"], 3);
        assert_eq!(body["stage"], "Transferring");
    }

    #[tokio::test]
    async fn store_internals_are_not_exposed() {
        let err: AppError = StoreError::Sqlx(sqlx::Error::RowNotFound).into();
        let (status, body) = body_json(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["kind"], "store_failure");
        assert_eq!(body["error"], "metadata store failure");
    }

    #[test]
    fn length_mismatch_is_a_client_error() {
        let err: AppError = PipelineError::Split(SplitError::LengthMismatch {
            declared: 10,
            observed: 4,
        })
        .into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.kind, "length_mismatch");
    }
}
