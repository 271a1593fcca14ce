//! Defines the HTTP surface of the file store.
//!
//! ## Structure
//! - `POST   /upload`     upload a file (multipart field `file`), auth required
//! - `GET    /list`       list the caller's files, or all files for wide roles
//! - `GET    /{file_id}`  download a file, no auth
//! - `DELETE /{file_id}`  delete a file, auth + ownership
//! - `GET    /healthz`, `GET /readyz` probes
//!
//! Everything else answers 404 `{"message": "Route not found"}`.

use crate::{
    handlers::{
        file_handlers::{delete_file, download_file, list_files, route_not_found, upload_file},
        health_handlers::{healthz, readyz},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. `body_limit` caps the total request body in bytes.
///
/// Static paths take precedence over `/{file_id}`; ids are always 8
/// characters so they never shadow the probes.
pub fn routes(body_limit: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/upload", post(upload_file))
        .route("/list", get(list_files))
        .route("/{file_id}", get(download_file).delete(delete_file))
        .fallback(route_not_found)
        .method_not_allowed_fallback(route_not_found)
        .layer(DefaultBodyLimit::max(body_limit))
}
