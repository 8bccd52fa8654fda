use std::io;
use std::path::PathBuf;

use axum::{
    extract::multipart::{MultipartError, MultipartRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("Permission denied: {0}")]
    Forbidden(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid multipart request: {0}")]
    MultipartRejection(#[from] MultipartRejection),

    #[error("Failed to read multipart data: {0}")]
    Multipart(#[from] MultipartError),

    #[error("Invalid upload filename: {0:?}")]
    InvalidFileName(String),
}

impl ServeError {
    /// Classify the error returned by a `stat` of a resolved request path.
    pub fn from_stat(path: PathBuf, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => ServeError::NotFound(path),
            io::ErrorKind::PermissionDenied => ServeError::Forbidden(path),
            _ => ServeError::Io(err),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServeError::NotFound(_) => StatusCode::NOT_FOUND,
            ServeError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServeError::Io(_)
            | ServeError::MultipartRejection(_)
            | ServeError::Multipart(_)
            | ServeError::InvalidFileName(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        status_response(self.status())
    }
}

/// Plain-text response carrying only the canonical reason phrase.
pub fn status_response(status: StatusCode) -> Response {
    let body = status.canonical_reason().unwrap_or_default();
    (status, body).into_response()
}

/// Errors raised while assembling the server configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid route definition {definition:?}: {reason}")]
    InvalidRoute { definition: String, reason: String },

    #[error("Invalid listen address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}
