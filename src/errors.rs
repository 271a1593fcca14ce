use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::services::{access_guard::AccessError, file_service::FileError};

/// Message returned for every failure whose detail stays server-side.
pub const INTERNAL_MESSAGE: &str = "An unexpected error occurred";

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error with the generic message.
    /// `detail` is logged, never sent.
    pub fn internal(detail: impl fmt::Display) -> Self {
        tracing::error!("{}", detail);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_MESSAGE)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "message": self.message }));
        (self.status, body).into_response()
    }
}

impl From<AccessError> for AppError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::Unauthenticated => AppError::unauthorized("Invalid API key"),
            AccessError::Unauthorized => AppError::unauthorized("Insufficient permissions"),
            AccessError::Catalog(err) => {
                AppError::internal(format_args!("Error resolving API key: {}", err))
            }
        }
    }
}

impl From<FileError> for AppError {
    fn from(err: FileError) -> Self {
        match err {
            FileError::NotFound(_) => AppError::not_found("File not found"),
            FileError::Access(err) => err.into(),
            FileError::PayloadTooLarge { limit } => AppError::bad_request(format!(
                "File exceeds the maximum upload size of {} bytes",
                limit
            )),
            FileError::InvalidPayload(_) => AppError::bad_request("Invalid multipart form data"),
            other => AppError::internal(other),
        }
    }
}
