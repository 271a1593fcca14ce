//! src/services/catalog.rs
//!
//! Catalog: durable SQLite store for file records and caller identities.
//! It is the source of truth for whether a file exists and who owns it;
//! payload bytes live in the blob store.

use crate::models::{
    file_record::{FileRecord, RecordStatus},
    identity::Identity,
};
use chrono::{DateTime, Utc};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{str::FromStr, sync::Arc};
use thiserror::Error;
use tracing::debug;

const INIT_MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

const FILE_COLUMNS: &str = "id, file_name, uploaded_at, creator";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog row `{0}` already exists")]
    Duplicate(String),
    #[error("catalog storage unavailable: {0}")]
    StorageUnavailable(#[from] sqlx::Error),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Selector for [`Catalog::count_files`].
#[derive(Debug, Clone, Copy)]
pub enum FileFilter<'a> {
    Id(&'a str),
    Creator(&'a str),
}

/// Catalog wraps the SQLite pool shared by every request.
///
/// File rows carry a status column: inserts land as `pending` and only
/// `committed` rows are returned by the lookup and listing operations.
#[derive(Clone)]
pub struct Catalog {
    db: Arc<SqlitePool>,
}

impl Catalog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Open (creating if missing) the SQLite database at `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> CatalogResult<Self> {
        debug!("Connecting using raw URL => {}", database_url);
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self::new(Arc::new(pool)))
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> CatalogResult<()> {
        let statements = INIT_MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("Running {} migration statements...", statements.len());

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Lightweight connectivity probe.
    pub async fn ping(&self) -> CatalogResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.db.close().await;
    }

    /// Insert a new `pending` file row.
    ///
    /// Returns `Duplicate` if the id is already taken by any row.
    pub async fn insert_file(&self, record: &FileRecord) -> CatalogResult<()> {
        let result = sqlx::query(
            "INSERT INTO files (id, file_name, uploaded_at, creator, status)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(record.uploaded_at)
        .bind(&record.creator)
        .bind(RecordStatus::Pending.as_str())
        .execute(&*self.db)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(CatalogError::Duplicate(record.id.clone())),
            Err(err) => Err(err.into()),
        }
    }

    /// Promote a pending row to committed. Returns false if no pending row
    /// with that id exists.
    pub async fn commit_file(&self, id: &str) -> CatalogResult<bool> {
        let result = sqlx::query("UPDATE files SET status = ? WHERE id = ? AND status = ?")
            .bind(RecordStatus::Committed.as_str())
            .bind(id)
            .bind(RecordStatus::Pending.as_str())
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Remove a pending row. Committed rows are left alone.
    pub async fn discard_pending(&self, id: &str) -> CatalogResult<bool> {
        let result = sqlx::query("DELETE FROM files WHERE id = ? AND status = ?")
            .bind(id)
            .bind(RecordStatus::Pending.as_str())
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Fetch a committed file row.
    pub async fn find_file_by_id(&self, id: &str) -> CatalogResult<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE id = ? AND status = ?"
        ))
        .bind(id)
        .bind(RecordStatus::Committed.as_str())
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }

    /// Committed rows uploaded by `creator`, in creation order.
    pub async fn list_files_by_creator(&self, creator: &str) -> CatalogResult<Vec<FileRecord>> {
        let records = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE creator = ? AND status = ?
             ORDER BY rowid ASC"
        ))
        .bind(creator)
        .bind(RecordStatus::Committed.as_str())
        .fetch_all(&*self.db)
        .await?;
        Ok(records)
    }

    /// Every committed row, in creation order.
    pub async fn list_all_files(&self) -> CatalogResult<Vec<FileRecord>> {
        let records = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE status = ? ORDER BY rowid ASC"
        ))
        .bind(RecordStatus::Committed.as_str())
        .fetch_all(&*self.db)
        .await?;
        Ok(records)
    }

    /// Delete a committed row. Returns false if it was already gone.
    pub async fn delete_file_by_id(&self, id: &str) -> CatalogResult<bool> {
        let result = sqlx::query("DELETE FROM files WHERE id = ? AND status = ?")
            .bind(id)
            .bind(RecordStatus::Committed.as_str())
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Count file rows of any status matching `filter`.
    pub async fn count_files(&self, filter: FileFilter<'_>) -> CatalogResult<i64> {
        let (sql, value) = match filter {
            FileFilter::Id(id) => ("SELECT COUNT(*) FROM files WHERE id = ?", id),
            FileFilter::Creator(creator) => ("SELECT COUNT(*) FROM files WHERE creator = ?", creator),
        };
        let count = sqlx::query_scalar::<_, i64>(sql)
            .bind(value)
            .fetch_one(&*self.db)
            .await?;
        Ok(count)
    }

    /// Pending rows created before `cutoff`.
    pub async fn list_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
    ) -> CatalogResult<Vec<FileRecord>> {
        let records = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE status = ? AND uploaded_at < ?
             ORDER BY rowid ASC"
        ))
        .bind(RecordStatus::Pending.as_str())
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await?;
        Ok(records)
    }

    /// Look up the identity holding `token`.
    pub async fn find_identity_by_token(&self, token: &str) -> CatalogResult<Option<Identity>> {
        let identity = sqlx::query_as::<_, Identity>(
            "SELECT api_key, username, permissions FROM users WHERE api_key = ?",
        )
        .bind(token)
        .fetch_optional(&*self.db)
        .await?;
        Ok(identity)
    }

    /// Replace any identity named `identity.username` with `identity`.
    ///
    /// Runs in one transaction; a token already held by another user
    /// yields `Duplicate`.
    pub async fn replace_identity(&self, identity: &Identity) -> CatalogResult<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query("DELETE FROM users WHERE username = ?")
            .bind(&identity.username)
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query("INSERT INTO users (api_key, username, permissions) VALUES (?, ?, ?)")
            .bind(&identity.token)
            .bind(&identity.username)
            .bind(identity.role.level())
            .execute(&mut *tx)
            .await;

        match inserted {
            Ok(_) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) if is_unique_violation(&err) => {
                Err(CatalogError::Duplicate(identity.username.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
