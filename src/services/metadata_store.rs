//! Transactional index of files, chunks and share grants, backed by SQLite.

use crate::models::{
    chunk::ChunkRecord,
    file::FileRecord,
    share::{ShareDetails, ShareTarget},
};
use chrono::Utc;
use rand::RngCore;
use sqlx::{
    QueryBuilder, SqlitePool,
    sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode},
};
use std::{str::FromStr, sync::Arc, time::Duration};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;

/// Schema applied at startup; every statement is idempotent.
pub const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const SHARE_TOKEN_BYTES: usize = 16;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("file {0} not found")]
    FileNotFound(i64),
    #[error("chunk order {got} out of sequence for file {file_id}, expected {expected}")]
    OrderConflict {
        file_id: i64,
        expected: i64,
        got: i64,
    },
    #[error("credential does not own every chunk of file {0}")]
    NotOwner(i64),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

const FILE_COLUMNS: &str =
    "id, filename, filesize, upload_timestamp, share_password, share_token, chunk_count";
const CHUNK_COLUMNS: &str = "id, file_id, chunk_order, image_path, auth_token, carrier_version";

/// Connection options for a database URL.
///
/// WAL lets downloads read while an upload indexes; writers queue on the busy
/// timeout instead of failing.
pub fn connect_options(url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT))
}

/// Shared metadata index. Cloning shares the underlying pool.
#[derive(Clone, Debug)]
pub struct MetadataStore {
    pub db: Arc<SqlitePool>,
}

impl MetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply [`SCHEMA`], statement by statement.
    pub async fn migrate(&self) -> StoreResult<usize> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(statements.len())
    }

    /// Insert a file record before any of its chunks are transferred.
    pub async fn create_file(&self, filename: &str, total_size: i64) -> StoreResult<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO files (filename, filesize, upload_timestamp) VALUES (?, ?, ?)
             RETURNING id",
        )
        .bind(filename)
        .bind(total_size)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;

        debug!(file_id = id, filename, total_size, "created file record");
        Ok(id)
    }

    pub async fn get_file(&self, file_id: i64) -> StoreResult<FileRecord> {
        sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE id = ?"
        ))
        .bind(file_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(StoreError::FileNotFound(file_id))
    }

    /// List files newest first, optionally filtered by a filename substring.
    pub async fn list_files(&self, search: Option<&str>) -> StoreResult<Vec<FileRecord>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {FILE_COLUMNS} FROM files"));
        if let Some(term) = search.filter(|s| !s.is_empty()) {
            builder.push(" WHERE filename LIKE ");
            builder.push_bind(format!("%{}%", term));
        }
        builder.push(" ORDER BY upload_timestamp DESC, id DESC");

        Ok(builder
            .build_query_as::<FileRecord>()
            .fetch_all(&*self.db)
            .await?)
    }

    /// Index a chunk whose remote `put` has already succeeded.
    ///
    /// `order` must be exactly the number of chunks already indexed for the
    /// file, so the orders stay dense. The check and the insert share one
    /// write transaction; a parent deleted meanwhile surfaces as `FileNotFound`.
    pub async fn append_chunk(
        &self,
        file_id: i64,
        order: i64,
        location: &str,
        credential: &str,
        carrier_version: i64,
    ) -> StoreResult<()> {
        // Take the write lock before reading; a deferred read-then-write
        // transaction fails with SQLITE_BUSY when another writer is active.
        let mut tx = self.db.begin_with("BEGIN IMMEDIATE").await?;

        let exists =
            sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM files WHERE id = ?)")
                .bind(file_id)
                .fetch_one(&mut *tx)
                .await?;
        if !exists {
            return Err(StoreError::FileNotFound(file_id));
        }

        let expected = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM chunks WHERE file_id = ?",
        )
        .bind(file_id)
        .fetch_one(&mut *tx)
        .await?;
        if expected != order {
            return Err(StoreError::OrderConflict {
                file_id,
                expected,
                got: order,
            });
        }

        let inserted = sqlx::query(
            "INSERT INTO chunks (file_id, chunk_order, image_path, auth_token, carrier_version)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(file_id)
        .bind(order)
        .bind(location)
        .bind(credential)
        .bind(carrier_version)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(err)) if err.is_foreign_key_violation() => {
                return Err(StoreError::FileNotFound(file_id));
            }
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                return Err(StoreError::OrderConflict {
                    file_id,
                    expected,
                    got: order,
                });
            }
            Err(err) => return Err(err.into()),
        }

        tx.commit().await?;
        Ok(())
    }

    /// Chunks of a file in ascending `chunk_order`.
    pub async fn list_chunks_ordered(&self, file_id: i64) -> StoreResult<Vec<ChunkRecord>> {
        Ok(sqlx::query_as::<_, ChunkRecord>(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE file_id = ? ORDER BY chunk_order ASC"
        ))
        .bind(file_id)
        .fetch_all(&*self.db)
        .await?)
    }

    /// Mark the upload finished, recording the observed size and chunk count.
    pub async fn complete_file(
        &self,
        file_id: i64,
        total_size: i64,
        chunk_count: i64,
    ) -> StoreResult<()> {
        let result = sqlx::query("UPDATE files SET filesize = ?, chunk_count = ? WHERE id = ?")
            .bind(total_size)
            .bind(chunk_count)
            .bind(file_id)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::FileNotFound(file_id));
        }
        Ok(())
    }

    /// Remove a file and all of its chunk rows as one unit, returning the
    /// removed chunks in order.
    ///
    /// Every removed chunk must have been transferred with `credential`,
    /// otherwise nothing is deleted. The chunk set is read by the same write
    /// transaction that deletes it, so a chunk indexed concurrently is either
    /// returned here or rejected with `FileNotFound`.
    pub async fn delete_file(
        &self,
        file_id: i64,
        credential: &str,
    ) -> StoreResult<Vec<ChunkRecord>> {
        let mut tx = self.db.begin_with("BEGIN IMMEDIATE").await?;

        let mut chunks = sqlx::query_as::<_, ChunkRecord>(&format!(
            "DELETE FROM chunks WHERE file_id = ? RETURNING {CHUNK_COLUMNS}"
        ))
        .bind(file_id)
        .fetch_all(&mut *tx)
        .await?;

        let owned = chunks
            .iter()
            .all(|c| bool::from(c.owner_token.as_bytes().ct_eq(credential.as_bytes())));
        if !owned {
            tx.rollback().await?;
            return Err(StoreError::NotOwner(file_id));
        }

        let files = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if files == 0 {
            tx.rollback().await?;
            return Err(StoreError::FileNotFound(file_id));
        }

        tx.commit().await?;
        chunks.sort_by_key(|c| c.chunk_order);
        debug!(file_id, chunks = chunks.len(), "deleted file record");
        Ok(chunks)
    }

    /// Issue a fresh share token for a file, replacing any previous one.
    pub async fn set_share(&self, file_id: i64, password: &str) -> StoreResult<String> {
        let token = generate_share_token();
        let result =
            sqlx::query("UPDATE files SET share_password = ?, share_token = ? WHERE id = ?")
                .bind(password)
                .bind(&token)
                .bind(file_id)
                .execute(&*self.db)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::FileNotFound(file_id));
        }
        Ok(token)
    }

    pub async fn find_by_share_token(&self, token: &str) -> StoreResult<Option<ShareTarget>> {
        Ok(sqlx::query_as::<_, ShareTarget>(
            "SELECT id, filename, filesize, share_password FROM files WHERE share_token = ?",
        )
        .bind(token)
        .fetch_optional(&*self.db)
        .await?)
    }

    pub async fn share_details(&self, file_id: i64) -> StoreResult<ShareDetails> {
        let file = self.get_file(file_id).await?;
        Ok(ShareDetails {
            share_token: file.share_token.unwrap_or_default(),
            share_password: file.share_password.unwrap_or_default(),
        })
    }

    /// Liveness probe used by `/readyz`.
    pub async fn ping(&self) -> StoreResult<i64> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?)
    }
}

/// 16 random bytes, hex encoded.
fn generate_share_token() -> String {
    let mut bytes = [0u8; SHARE_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
