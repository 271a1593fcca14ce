//! Represents a stored file's catalog entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Number of characters in a file id.
pub const FILE_ID_LEN: usize = 8;

/// Catalog metadata for one uploaded file.
///
/// The bytes themselves live in the blob store under the same `id`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Opaque 8-character alphanumeric identifier.
    pub id: String,

    /// Original filename as supplied by the uploader.
    #[sqlx(rename = "file_name")]
    pub name: String,

    /// When the upload was accepted.
    pub uploaded_at: DateTime<Utc>,

    /// Username of the uploader.
    pub creator: String,
}

/// Lifecycle state of a catalog row.
///
/// Rows start `Pending` while their blob is written and only become visible
/// once promoted to `Committed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Pending,
    Committed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Committed => "committed",
        }
    }
}

/// True if `id` has the shape of an allocated file id.
pub fn is_well_formed_id(id: &str) -> bool {
    id.len() == FILE_ID_LEN && id.bytes().all(|b| b.is_ascii_alphanumeric())
}
