//! HTTP handlers for file operations.
//! Upload bodies are streamed straight into the blob store and downloads are
//! streamed back out, so payloads are never buffered whole in memory.

use crate::{
    errors::AppError,
    models::file_record::FileRecord,
    services::access_guard::Caller,
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State, multipart::MultipartRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Serialize;
use std::io;
use tokio_util::io::ReaderStream;
use tracing::warn;

/// Multipart field carrying the upload.
pub const FILE_FIELD: &str = "file";

const INVALID_FORM: &str = "Invalid multipart form data";
const MISSING_FILE: &str = "Missing file in request";

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: &'static str,
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub message: &'static str,
    pub files: Vec<FileRecord>,
}

/// `POST /upload`: store the multipart field `file`.
pub async fn upload_file(
    State(state): State<AppState>,
    caller: Caller,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<impl IntoResponse, AppError> {
    let mut multipart = multipart.map_err(|rejection| {
        warn!("Upload failed - malformed form data: {}", rejection);
        AppError::bad_request(INVALID_FORM)
    })?;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        warn!("Upload failed - malformed form data: {}", err);
        AppError::bad_request(INVALID_FORM)
    })? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let Some(file_name) = field
            .file_name()
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
        else {
            warn!("Upload failed - `{}` field carries no filename", FILE_FIELD);
            return Err(AppError::bad_request(MISSING_FILE));
        };

        let body = field
            .map(|chunk| chunk.map_err(io::Error::other))
            .boxed();
        let record = state.files.upload(&caller, &file_name, body).await?;

        return Ok((
            StatusCode::CREATED,
            Json(UploadResponse {
                message: "File uploaded successfully",
                id: record.id,
            }),
        ));
    }

    warn!("Upload failed - missing `{}` field", FILE_FIELD);
    Err(AppError::bad_request(MISSING_FILE))
}

/// `GET /list`: the caller's files, or every file for wide roles.
pub async fn list_files(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<ListResponse>, AppError> {
    let files = state.files.list(&caller).await?;
    Ok(Json(ListResponse {
        message: "Files fetched successfully",
        files,
    }))
}

/// `GET /{file_id}`: public download; the id is the capability.
pub async fn download_file(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<Response, AppError> {
    let (record, reader) = state.files.download(&file_id).await?;
    let body = Body::from_stream(ReaderStream::new(reader));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(&record.name));
    Ok(response)
}

/// `DELETE /{file_id}`
pub async fn delete_file(
    State(state): State<AppState>,
    caller: Caller,
    Path(file_id): Path<String>,
) -> Result<Json<MessageResponse>, AppError> {
    state.files.delete(&caller, &file_id).await?;
    Ok(Json(MessageResponse {
        message: "File deleted successfully",
    }))
}

/// Fallback for unmatched paths and methods.
pub async fn route_not_found() -> AppError {
    AppError::not_found("Route not found")
}

/// `attachment; filename="<name>"`, falling back to a bare `attachment`
/// when the name cannot be carried in a header.
fn content_disposition(file_name: &str) -> HeaderValue {
    let escaped = file_name.replace('\\', "\\\\").replace('"', "\\\"");
    HeaderValue::from_bytes(format!("attachment; filename=\"{}\"", escaped).as_bytes())
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_disposition_quotes_the_name() {
        assert_eq!(
            content_disposition("report.pdf"),
            "attachment; filename=\"report.pdf\""
        );
        assert_eq!(
            content_disposition("say \"hi\".txt"),
            "attachment; filename=\"say \\\"hi\\\".txt\""
        );
        assert_eq!(content_disposition("bad\nname"), "attachment");
    }
}
