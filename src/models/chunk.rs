//! Represents one remotely stored slice of a file.

use serde::Serialize;
use sqlx::FromRow;

/// Index entry mapping `(file_id, chunk_order)` to a remote location.
///
/// Rows are inserted only after the remote `put` succeeded, and the set of
/// `chunk_order` values for one file is always `{0..n-1}`.
#[derive(Serialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct ChunkRecord {
    pub id: i64,

    /// Owning file; rows are removed together with it.
    pub file_id: i64,

    /// Zero-based position in the reconstructed byte stream.
    pub chunk_order: i64,

    /// Path returned by the remote host.
    #[serde(rename = "image_path")]
    #[sqlx(rename = "image_path")]
    pub remote_location: String,

    /// Credential that performed the transfer; the host requires it again to delete.
    #[serde(skip_serializing)]
    #[sqlx(rename = "auth_token")]
    pub owner_token: String,

    /// Carrier layout the payload was wrapped with.
    pub carrier_version: i64,
}
