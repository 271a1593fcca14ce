//! src/services/file_service.rs
//!
//! FileService: upload, download, list and delete, pairing a catalog row
//! with a blob for every file.
//!
//! Upload stages the bytes, writes a `pending` row, publishes the blob under
//! the row's id and then promotes the row, so a visible record always has its
//! bytes. Delete removes the row first and the blob second. Leftovers from
//! failures in between are logged here and swept by the reconciler.

use crate::{
    models::file_record::FileRecord,
    services::{
        access_guard::{AccessError, Caller},
        blob_store::{BlobError, BlobReader, BlobStore, StagedBlob},
        catalog::{Catalog, CatalogError},
        id_allocator::{AllocationError, IdAllocator},
    },
};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::BoxStream;
use std::{io, sync::Arc};
use thiserror::Error;
use tracing::{error, info, warn};

/// How many freshly allocated ids may lose the insert race before upload
/// gives up.
const MAX_INSERT_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("payload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: u64 },
    #[error("upload body could not be read: {0}")]
    InvalidPayload(#[source] io::Error),
    #[error("catalog record `{0}` has no blob")]
    MissingBlob(String),
    #[error("pending record `{0}` vanished before commit")]
    LostPending(String),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Blob(#[from] BlobError),
}

pub type FileResult<T> = Result<T, FileError>;

#[derive(Clone)]
pub struct FileService {
    catalog: Catalog,
    blobs: Arc<dyn BlobStore>,
    allocator: IdAllocator,
}

impl FileService {
    pub fn new(catalog: Catalog, blobs: Arc<dyn BlobStore>, allocator: IdAllocator) -> Self {
        Self {
            catalog,
            blobs,
            allocator,
        }
    }

    /// Store `body` as a new file named `file_name` owned by `caller`.
    ///
    /// The body is staged before any catalog row exists, so a pending row
    /// only lives for the publish and commit steps however slow the client.
    pub async fn upload<'a>(
        &self,
        caller: &Caller,
        file_name: &str,
        body: BoxStream<'a, io::Result<Bytes>>,
    ) -> FileResult<FileRecord> {
        let staged = match self.blobs.stage(body).await {
            Ok(staged) => staged,
            Err(err) => {
                return Err(match err {
                    BlobError::Source(source) => {
                        warn!("upload by {} aborted: {}", caller.username, source);
                        FileError::InvalidPayload(source)
                    }
                    BlobError::TooLarge { limit } => {
                        warn!("upload by {} rejected: over {} bytes", caller.username, limit);
                        FileError::PayloadTooLarge { limit }
                    }
                    other => {
                        error!("staging upload by {} failed: {}", caller.username, other);
                        FileError::Blob(other)
                    }
                });
            }
        };

        let record = match self.reserve(caller, file_name).await {
            Ok(record) => record,
            Err(err) => {
                self.discard_staged(&staged).await;
                return Err(err);
            }
        };

        if let Err(err) = self.blobs.publish(&staged, &record.id).await {
            error!("publishing blob {} failed: {}", record.id, err);
            self.discard_staged(&staged).await;
            self.abandon_pending(&record.id).await;
            return Err(err.into());
        }

        let committed = match self.catalog.commit_file(&record.id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(FileError::LostPending(record.id.clone())),
            Err(err) => Err(FileError::Catalog(err)),
        };
        if let Err(err) = committed {
            error!("committing {} failed after its blob was written: {}", record.id, err);
            match self.blobs.delete(&record.id).await {
                Ok(()) | Err(BlobError::NotFound(_)) => {}
                Err(blob_err) => error!("orphan blob {} left behind: {}", record.id, blob_err),
            }
            self.abandon_pending(&record.id).await;
            return Err(err);
        }

        info!("File {} uploaded by {} ({} bytes)", record.id, caller.username, staged.size);
        Ok(record)
    }

    /// Allocate an id and insert the pending row, retrying if another insert
    /// claims the id between the check and the write.
    async fn reserve(&self, caller: &Caller, file_name: &str) -> FileResult<FileRecord> {
        let mut attempt = 1;
        loop {
            let record = FileRecord {
                id: self.allocator.allocate().await?,
                name: file_name.to_string(),
                uploaded_at: Utc::now(),
                creator: caller.username.clone(),
            };
            match self.catalog.insert_file(&record).await {
                Ok(()) => return Ok(record),
                Err(CatalogError::Duplicate(id)) if attempt < MAX_INSERT_ATTEMPTS => {
                    warn!("file id {} was claimed concurrently, reallocating", id);
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn discard_staged(&self, staged: &StagedBlob) {
        if let Err(err) = self.blobs.discard(staged).await {
            error!("staged payload {} left behind: {}", staged.key, err);
        }
    }

    async fn abandon_pending(&self, id: &str) {
        if let Err(err) = self.catalog.discard_pending(id).await {
            error!("dangling pending record {} left behind: {}", id, err);
        }
    }

    /// Open a file for download. No authentication: the id is the capability.
    pub async fn download(&self, id: &str) -> FileResult<(FileRecord, BlobReader)> {
        let record = self
            .catalog
            .find_file_by_id(id)
            .await?
            .ok_or_else(|| FileError::NotFound(id.to_string()))?;

        match self.blobs.read(id).await {
            Ok(reader) => Ok((record, reader)),
            Err(BlobError::NotFound(_)) => {
                error!("catalog record {} exists but its blob is missing", id);
                Err(FileError::MissingBlob(id.to_string()))
            }
            Err(err) => {
                error!("reading blob {} failed: {}", id, err);
                Err(err.into())
            }
        }
    }

    /// Records visible to `caller`: their own below `ReadWriteAll`, all
    /// otherwise.
    pub async fn list(&self, caller: &Caller) -> FileResult<Vec<FileRecord>> {
        let records = if caller.role.spans_all_files() {
            self.catalog.list_all_files().await?
        } else {
            self.catalog.list_files_by_creator(&caller.username).await?
        };
        Ok(records)
    }

    /// Delete a file on behalf of `caller`.
    ///
    /// The catalog row decides the outcome; failing to remove the blob
    /// afterwards is logged and does not fail the request.
    pub async fn delete(&self, caller: &Caller, id: &str) -> FileResult<FileRecord> {
        let record = self
            .catalog
            .find_file_by_id(id)
            .await?
            .ok_or_else(|| FileError::NotFound(id.to_string()))?;

        caller.ensure_can_modify(&record)?;

        if !self.catalog.delete_file_by_id(id).await? {
            return Err(FileError::NotFound(id.to_string()));
        }

        match self.blobs.delete(id).await {
            Ok(()) => {}
            Err(BlobError::NotFound(_)) => {
                error!("blob {} was already gone when its record was deleted", id)
            }
            Err(err) => error!("orphan blob {} left behind after delete: {}", id, err),
        }

        info!("File {} deleted by {}", id, caller.username);
        Ok(record)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        models::identity::Role,
        services::{
            blob_store::{
                BlobEntry, BlobResult, LocalBlobStore,
                tests::{body_of, read_all},
            },
            catalog::{FileFilter, tests::open_catalog},
        },
    };
    use async_trait::async_trait;
    use futures::{StreamExt, stream};
    use std::time::Duration;
    use tempfile::TempDir;

    pub(crate) fn caller(username: &str, role: Role) -> Caller {
        Caller {
            username: username.into(),
            role,
        }
    }

    /// Wraps a real store and fails selected operations.
    struct FlakyBlobStore {
        inner: LocalBlobStore,
        fail_writes: bool,
        fail_deletes: bool,
        /// Discards the pending row right after publishing, the way a
        /// concurrent sweep would.
        claim_on_publish: Option<Catalog>,
    }

    fn disk_full() -> BlobError {
        BlobError::StorageUnavailable(io::Error::other("disk full"))
    }

    #[async_trait]
    impl BlobStore for FlakyBlobStore {
        async fn stage<'a>(
            &self,
            body: BoxStream<'a, io::Result<Bytes>>,
        ) -> BlobResult<StagedBlob> {
            if self.fail_writes {
                return Err(disk_full());
            }
            self.inner.stage(body).await
        }

        async fn publish(&self, staged: &StagedBlob, id: &str) -> BlobResult<()> {
            self.inner.publish(staged, id).await?;
            if let Some(catalog) = &self.claim_on_publish {
                assert!(catalog.discard_pending(id).await.unwrap());
            }
            Ok(())
        }

        async fn discard(&self, staged: &StagedBlob) -> BlobResult<()> {
            self.inner.discard(staged).await
        }

        async fn read(&self, id: &str) -> BlobResult<BlobReader> {
            self.inner.read(id).await
        }

        async fn delete(&self, id: &str) -> BlobResult<()> {
            if self.fail_deletes {
                return Err(disk_full());
            }
            self.inner.delete(id).await
        }

        async fn exists(&self, id: &str) -> BlobResult<bool> {
            self.inner.exists(id).await
        }

        async fn list(&self) -> BlobResult<Vec<BlobEntry>> {
            self.inner.list().await
        }

        async fn purge_partial(&self, older_than: Duration) -> BlobResult<usize> {
            self.inner.purge_partial(older_than).await
        }

        async fn health_check(&self) -> BlobResult<()> {
            self.inner.health_check().await
        }
    }

    struct Fixture {
        _dir: TempDir,
        catalog: Catalog,
        blobs: Arc<dyn BlobStore>,
        service: FileService,
    }

    async fn fixture_with(fail_writes: bool, fail_deletes: bool) -> Fixture {
        build_fixture(fail_writes, fail_deletes, false).await
    }

    async fn build_fixture(fail_writes: bool, fail_deletes: bool, claim: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let catalog = open_catalog(&dir).await;
        let blobs: Arc<dyn BlobStore> = Arc::new(FlakyBlobStore {
            inner: LocalBlobStore::new(dir.path().join("blobs"), 64),
            fail_writes,
            fail_deletes,
            claim_on_publish: claim.then(|| catalog.clone()),
        });
        let service = FileService::new(
            catalog.clone(),
            blobs.clone(),
            IdAllocator::new(catalog.clone()),
        );
        Fixture {
            _dir: dir,
            catalog,
            blobs,
            service,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(false, false).await
    }

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let fx = fixture().await;
        let alice = caller("alice", Role::ReadWriteSelf);

        let record = fx
            .service
            .upload(&alice, "notes.txt", body_of(&[b"line one\n", b"line two\n"]))
            .await
            .unwrap();
        assert_eq!(record.id.len(), 8);
        assert_eq!(record.creator, "alice");

        let (found, reader) = fx.service.download(&record.id).await.unwrap();
        assert_eq!(found, record);
        assert_eq!(read_all(reader).await, b"line one\nline two\n");
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let fx = fixture().await;
        let admin = caller("Master", Role::Administrator);

        assert!(matches!(
            fx.service.download("nope1234").await,
            Err(FileError::NotFound(_))
        ));
        assert!(matches!(
            fx.service.delete(&admin, "nope1234").await,
            Err(FileError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn oversized_upload_leaves_no_trace() {
        let fx = fixture().await;
        let alice = caller("alice", Role::ReadWriteSelf);

        let big = vec![7u8; 65];
        let err = fx
            .service
            .upload(&alice, "big.bin", body_of(&[big.as_slice()]))
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::PayloadTooLarge { limit: 64 }));
        assert_eq!(fx.catalog.count_files(FileFilter::Creator("alice")).await.unwrap(), 0);
        assert!(fx.blobs.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_staging_leaves_no_record() {
        let fx = fixture_with(true, false).await;
        let alice = caller("alice", Role::ReadWriteSelf);

        let err = fx
            .service
            .upload(&alice, "a.txt", body_of(&[b"abc"]))
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::Blob(BlobError::StorageUnavailable(_))));
        assert_eq!(fx.catalog.count_files(FileFilter::Creator("alice")).await.unwrap(), 0);
        assert!(fx.service.list(&alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn body_failing_midway_leaves_no_trace() {
        let fx = fixture().await;
        let alice = caller("alice", Role::ReadWriteSelf);

        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"first half")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ])
        .boxed();
        let err = fx.service.upload(&alice, "a.txt", body).await.unwrap_err();

        assert!(matches!(err, FileError::InvalidPayload(_)));
        assert_eq!(fx.catalog.count_files(FileFilter::Creator("alice")).await.unwrap(), 0);
        assert!(fx.blobs.list().await.unwrap().is_empty());
        // No temp file either.
        assert_eq!(fx.blobs.purge_partial(Duration::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lost_pending_row_removes_the_published_blob() {
        let fx = build_fixture(false, false, true).await;
        let alice = caller("alice", Role::ReadWriteSelf);

        let err = fx
            .service
            .upload(&alice, "a.txt", body_of(&[b"abc"]))
            .await
            .unwrap_err();

        let FileError::LostPending(id) = err else {
            panic!("expected LostPending, got {:?}", err);
        };
        assert!(!fx.blobs.exists(&id).await.unwrap());
        assert_eq!(fx.catalog.count_files(FileFilter::Id(&id)).await.unwrap(), 0);
        assert!(fx.service.list(&alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_is_scoped_by_role() {
        let fx = fixture().await;
        let alice = caller("alice", Role::ReadWriteSelf);
        let bob = caller("bob", Role::ReadWriteSelf);

        let a = fx.service.upload(&alice, "a.txt", body_of(&[b"a"])).await.unwrap();
        let b = fx.service.upload(&bob, "b.txt", body_of(&[b"b"])).await.unwrap();

        let ids = |records: Vec<FileRecord>| records.into_iter().map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(ids(fx.service.list(&alice).await.unwrap()), vec![a.id.clone()]);
        assert_eq!(ids(fx.service.list(&bob).await.unwrap()), vec![b.id.clone()]);

        for role in [Role::ReadWriteAll, Role::Administrator] {
            let wide = caller("carol", role);
            assert_eq!(
                ids(fx.service.list(&wide).await.unwrap()),
                vec![a.id.clone(), b.id.clone()]
            );
        }
    }

    #[tokio::test]
    async fn strangers_cannot_delete_and_file_survives() {
        let fx = fixture().await;
        let alice = caller("alice", Role::ReadWriteSelf);
        let bob = caller("bob", Role::ReadWriteSelf);

        let record = fx.service.upload(&alice, "a.txt", body_of(&[b"mine"])).await.unwrap();
        let err = fx.service.delete(&bob, &record.id).await.unwrap_err();
        assert!(matches!(err, FileError::Access(AccessError::Unauthorized)));

        let (_, reader) = fx.service.download(&record.id).await.unwrap();
        assert_eq!(read_all(reader).await, b"mine");
    }

    #[tokio::test]
    async fn delete_removes_record_and_blob() {
        let fx = fixture().await;
        let alice = caller("alice", Role::ReadWriteSelf);
        let auditor = caller("auditor", Role::ReadWriteAll);

        let own = fx.service.upload(&alice, "a.txt", body_of(&[b"a"])).await.unwrap();
        let other = fx.service.upload(&alice, "b.txt", body_of(&[b"b"])).await.unwrap();

        fx.service.delete(&alice, &own.id).await.unwrap();
        fx.service.delete(&auditor, &other.id).await.unwrap();

        for id in [&own.id, &other.id] {
            assert!(fx.catalog.find_file_by_id(id).await.unwrap().is_none());
            assert!(matches!(fx.blobs.read(id).await, Err(BlobError::NotFound(_))));
        }
        assert!(matches!(
            fx.service.delete(&alice, &own.id).await,
            Err(FileError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn blob_delete_failure_still_deletes_the_record() {
        let fx = fixture_with(false, true).await;
        let alice = caller("alice", Role::ReadWriteSelf);

        let record = fx.service.upload(&alice, "a.txt", body_of(&[b"a"])).await.unwrap();
        fx.service.delete(&alice, &record.id).await.unwrap();

        assert!(fx.catalog.find_file_by_id(&record.id).await.unwrap().is_none());
        // The orphan stays on disk for the reconciler.
        assert!(fx.blobs.exists(&record.id).await.unwrap());
        assert!(matches!(
            fx.service.download(&record.id).await,
            Err(FileError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_of_a_record_without_blob_still_succeeds() {
        let fx = fixture().await;
        let alice = caller("alice", Role::ReadWriteSelf);

        let record = fx.service.upload(&alice, "a.txt", body_of(&[b"a"])).await.unwrap();
        fx.blobs.delete(&record.id).await.unwrap();

        let deleted = fx.service.delete(&alice, &record.id).await.unwrap();
        assert_eq!(deleted.id, record.id);
        assert!(fx.catalog.find_file_by_id(&record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_blob_is_an_internal_inconsistency() {
        let fx = fixture().await;
        let alice = caller("alice", Role::ReadWriteSelf);

        let record = fx.service.upload(&alice, "a.txt", body_of(&[b"a"])).await.unwrap();
        fx.blobs.delete(&record.id).await.unwrap();

        assert!(matches!(
            fx.service.download(&record.id).await,
            Err(FileError::MissingBlob(_))
        ));
    }
}
