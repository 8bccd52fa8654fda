use std::path::Path;

use axum::{
    extract::{FromRequest, Multipart, Request},
    response::{IntoResponse, Redirect, Response},
};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::ServeError;

/// Multipart field carrying the uploaded file.
pub const UPLOAD_FIELD: &str = "file";

/// Final component of a client-supplied filename. Directory parts are
/// dropped; names with no usable final component are rejected.
fn base_name(raw: &str) -> Option<&str> {
    Path::new(raw).file_name().and_then(|name| name.to_str())
}

async fn create_truncated(path: &Path) -> std::io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}

/// Store the `file` field of a multipart POST into `target_dir`.
///
/// Answers 303 to the request URL whether or not a file was sent, so the
/// browser re-renders the listing.
pub async fn receive(target_dir: &Path, request: Request) -> Result<Response, ServeError> {
    let location = request.uri().to_string();
    let mut multipart = Multipart::from_request(request, &()).await?;

    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let Some(raw_name) = field
            .file_name()
            .filter(|name| !name.is_empty())
            .map(str::to_string)
        else {
            continue;
        };

        let file_name =
            base_name(&raw_name).ok_or_else(|| ServeError::InvalidFileName(raw_name.clone()))?;
        let dest_path = target_dir.join(file_name);

        let mut out = create_truncated(&dest_path).await?;
        let mut total_size = 0u64;
        while let Some(chunk) = field.chunk().await? {
            total_size = total_size.saturating_add(chunk.len() as u64);
            out.write_all(&chunk).await?;
        }
        out.flush().await?;

        info!(
            "Uploaded file: {} ({} bytes)",
            dest_path.display(),
            total_size
        );
        return Ok(Redirect::to(&location).into_response());
    }

    debug!("Upload to {} carried no file", target_dir.display());
    Ok(Redirect::to(&location).into_response())
}
