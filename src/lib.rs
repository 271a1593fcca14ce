//! Permission-gated file storage service.
//!
//! Clients upload blobs, fetch them back by an opaque 8-character id, list
//! and delete them. File metadata and caller identities live in SQLite (the
//! [`services::catalog`]), payload bytes on disk (the
//! [`services::blob_store`]); [`services::file_service`] keeps the two in
//! step and [`services::reconciler`] repairs what interrupted operations
//! leave behind.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

use services::{
    access_guard::AccessGuard,
    blob_store::{BlobStore, LocalBlobStore},
    catalog::Catalog,
    file_service::FileService,
    id_allocator::IdAllocator,
};
use std::sync::Arc;

/// Wire the components around an open catalog.
pub fn build_state(catalog: Catalog, blobs: Arc<dyn BlobStore>) -> state::AppState {
    let allocator = IdAllocator::new(catalog.clone());
    state::AppState {
        guard: AccessGuard::new(catalog.clone()),
        files: FileService::new(catalog.clone(), blobs.clone(), allocator),
        catalog,
        blobs,
    }
}

/// Local blob store rooted at `storage_dir` with the configured cap.
pub fn local_blob_store(storage_dir: &str, max_upload_bytes: u64) -> Arc<dyn BlobStore> {
    Arc::new(LocalBlobStore::new(storage_dir, max_upload_bytes))
}
