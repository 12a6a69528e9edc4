//! Represents an uploaded file and its share grant.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// A file reconstructed from an ordered run of remote chunks.
///
/// The record is created before the first chunk is transferred so chunk
/// rows can reference it. `chunk_count` stays `None` until the upload
/// pipeline reaches its completed state.
#[derive(Serialize, Clone, FromRow, Debug)]
pub struct FileRecord {
    /// Stable identifier for the file's lifetime.
    pub id: i64,

    /// Filename declared by the uploader.
    pub filename: String,

    /// Size in bytes (declared up front, or observed once the stream ends).
    #[serde(rename = "filesize")]
    #[sqlx(rename = "filesize")]
    pub total_size: i64,

    /// When the upload was initiated.
    #[serde(rename = "upload_timestamp")]
    #[sqlx(rename = "upload_timestamp")]
    pub created_at: DateTime<Utc>,

    /// Capability token for share links, if the file has been shared.
    #[serde(skip_serializing)]
    pub share_token: Option<String>,

    /// Share password; an empty string means no password is required.
    #[serde(skip_serializing)]
    pub share_password: Option<String>,

    /// Number of chunks once the upload has completed.
    pub chunk_count: Option<i64>,
}

impl FileRecord {
    /// Whether the upload pipeline finished for this file.
    pub fn is_complete(&self) -> bool {
        self.chunk_count.is_some()
    }
}
