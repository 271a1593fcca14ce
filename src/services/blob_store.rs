//! src/services/blob_store.rs
//!
//! Blob storage keyed by file id. The local implementation keeps one
//! `<id>.dat` file per blob in a flat directory. Payloads are first staged
//! into a fsynced temporary file and later renamed into place, so readers
//! never observe a partially written blob.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream::BoxStream};
use std::{
    io::{self, ErrorKind},
    path::PathBuf,
    pin::Pin,
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWriteExt},
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::file_record::is_well_formed_id;

const BLOB_EXTENSION: &str = "dat";
const TEMP_PREFIX: &str = ".tmp-";

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("invalid blob id `{0}`")]
    InvalidId(String),
    #[error("payload exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },
    /// The incoming byte stream failed (client disconnect, malformed body).
    #[error("upload stream failed: {0}")]
    Source(#[source] io::Error),
    #[error("blob storage unavailable: {0}")]
    StorageUnavailable(#[from] io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Owned reader over a stored blob.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// A committed blob as seen by a directory scan.
#[derive(Debug, Clone)]
pub struct BlobEntry {
    pub id: String,
    pub modified: DateTime<Utc>,
}

/// A fully written payload that is not yet visible under any id.
#[derive(Debug)]
pub struct StagedBlob {
    /// Store-specific handle. For [`LocalBlobStore`] the temp file name.
    pub key: String,
    pub size: u64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Drain `body` into private, durable storage.
    ///
    /// Staged payloads are invisible to `read`, `list` and `exists` until
    /// published. While the body is still arriving the staging area counts
    /// as fresh for [`BlobStore::purge_partial`].
    async fn stage<'a>(&self, body: BoxStream<'a, io::Result<Bytes>>) -> BlobResult<StagedBlob>;

    /// Atomically make a staged payload visible under `id`.
    async fn publish(&self, staged: &StagedBlob, id: &str) -> BlobResult<()>;

    /// Drop a staged payload that will not be published.
    async fn discard(&self, staged: &StagedBlob) -> BlobResult<()>;

    /// Stage and publish in one step, returning the number of bytes written.
    async fn write<'a>(
        &self,
        id: &str,
        body: BoxStream<'a, io::Result<Bytes>>,
    ) -> BlobResult<u64> {
        let staged = self.stage(body).await?;
        if let Err(err) = self.publish(&staged, id).await {
            if let Err(discard_err) = self.discard(&staged).await {
                warn!("staged payload {} left behind: {}", staged.key, discard_err);
            }
            return Err(err);
        }
        Ok(staged.size)
    }

    /// Open the blob for reading.
    async fn read(&self, id: &str) -> BlobResult<BlobReader>;

    /// Remove the blob. `NotFound` if it does not exist.
    async fn delete(&self, id: &str) -> BlobResult<()>;

    async fn exists(&self, id: &str) -> BlobResult<bool>;

    /// Every committed blob currently stored.
    async fn list(&self) -> BlobResult<Vec<BlobEntry>>;

    /// Remove temporary files left by abandoned writes that are older than
    /// `older_than`. Returns how many were removed.
    async fn purge_partial(&self, older_than: Duration) -> BlobResult<usize>;

    /// Round-trip a probe file through the store.
    async fn health_check(&self) -> BlobResult<()>;
}

/// Filesystem-backed blob store rooted at `base_path`.
#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    base_path: PathBuf,
    max_bytes: u64,
}

impl LocalBlobStore {
    pub fn new(base_path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            base_path: base_path.into(),
            max_bytes,
        }
    }

    /// Only ids of the allocated shape are accepted, which keeps every path
    /// inside `base_path`.
    fn blob_path(&self, id: &str) -> BlobResult<PathBuf> {
        if !is_well_formed_id(id) {
            return Err(BlobError::InvalidId(id.to_string()));
        }
        Ok(self.base_path.join(format!("{}.{}", id, BLOB_EXTENSION)))
    }

    fn staged_path(&self, staged: &StagedBlob) -> BlobResult<PathBuf> {
        let key = &staged.key;
        if !key.starts_with(TEMP_PREFIX) || key.contains(['/', '\\']) {
            return Err(BlobError::InvalidId(key.clone()));
        }
        Ok(self.base_path.join(key))
    }

    async fn stream_to_temp<'a>(
        &self,
        file: &mut File,
        mut body: BoxStream<'a, io::Result<Bytes>>,
    ) -> BlobResult<u64> {
        let mut size_bytes: u64 = 0;
        while let Some(chunk_res) = body.next().await {
            let chunk = chunk_res.map_err(BlobError::Source)?;
            size_bytes += chunk.len() as u64;
            if size_bytes > self.max_bytes {
                return Err(BlobError::TooLarge {
                    limit: self.max_bytes,
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(size_bytes)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn stage<'a>(&self, body: BoxStream<'a, io::Result<Bytes>>) -> BlobResult<StagedBlob> {
        fs::create_dir_all(&self.base_path).await?;

        let key = format!("{}{}", TEMP_PREFIX, Uuid::new_v4());
        let tmp_path = self.base_path.join(&key);
        let mut file = File::create(&tmp_path).await?;

        let size = match self.stream_to_temp(&mut file, body).await {
            Ok(size) => size,
            Err(err) => {
                drop(file);
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };
        drop(file);

        debug!("staged {} bytes at {}", size, tmp_path.display());
        Ok(StagedBlob { key, size })
    }

    async fn publish(&self, staged: &StagedBlob, id: &str) -> BlobResult<()> {
        let file_path = self.blob_path(id)?;
        let tmp_path = self.staged_path(staged)?;
        fs::rename(&tmp_path, &file_path).await?;
        debug!("stored blob {} ({} bytes)", file_path.display(), staged.size);
        Ok(())
    }

    async fn discard(&self, staged: &StagedBlob) -> BlobResult<()> {
        let tmp_path = self.staged_path(staged)?;
        match fs::remove_file(&tmp_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn read(&self, id: &str) -> BlobResult<BlobReader> {
        let file_path = self.blob_path(id)?;
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BlobError::NotFound(id.to_string())
            } else {
                BlobError::StorageUnavailable(err)
            }
        })?;
        Ok(Box::pin(file))
    }

    async fn delete(&self, id: &str) -> BlobResult<()> {
        let file_path = self.blob_path(id)?;
        match fs::remove_file(&file_path).await {
            Ok(_) => {
                debug!("removed blob {}", file_path.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BlobError::NotFound(id.to_string()))
            }
            Err(err) => Err(BlobError::StorageUnavailable(err)),
        }
    }

    async fn exists(&self, id: &str) -> BlobResult<bool> {
        let file_path = self.blob_path(id)?;
        Ok(fs::try_exists(&file_path).await?)
    }

    async fn list(&self) -> BlobResult<Vec<BlobEntry>> {
        let mut entries = Vec::new();
        let mut dir = match fs::read_dir(&self.base_path).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if !is_well_formed_id(id) {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            entries.push(BlobEntry {
                id: id.to_string(),
                modified: modified.into(),
            });
        }
        Ok(entries)
    }

    async fn purge_partial(&self, older_than: Duration) -> BlobResult<usize> {
        let mut dir = match fs::read_dir(&self.base_path).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(TEMP_PREFIX) {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age < older_than {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(_) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(removed)
    }

    async fn health_check(&self) -> BlobResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        // Temp-prefixed so a probe that cannot be removed is swept later.
        let probe = self
            .base_path
            .join(format!("{}readyz-{}", TEMP_PREFIX, Uuid::new_v4()));
        fs::write(&probe, b"readyz").await?;
        let read_back = fs::read(&probe).await;
        if let Err(err) = fs::remove_file(&probe).await {
            warn!("could not remove probe file {}: {}", probe.display(), err);
        }
        if read_back? != b"readyz" {
            return Err(BlobError::StorageUnavailable(io::Error::other(
                "probe file content mismatch",
            )));
        }
        Ok(())
    }
}
