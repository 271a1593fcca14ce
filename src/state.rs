//! Shared handler state.

use crate::services::{
    access_guard::AccessGuard, blob_store::BlobStore, catalog::Catalog, file_service::FileService,
};
use std::sync::Arc;

/// Components constructed once at startup and shared by every request.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Catalog,
    pub blobs: Arc<dyn BlobStore>,
    pub guard: AccessGuard,
    pub files: FileService,
}
