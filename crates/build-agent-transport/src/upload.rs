//! File upload endpoint: `PUT /servlet/upload/<absolute destination>`.

use std::{
    io,
    path::{Path, PathBuf},
};

use axum::{
    body::Body,
    extract::Path as UrlPath,
    http::{HeaderMap, StatusCode, header::CONTENT_LENGTH},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

/// Route of the upload endpoint.
pub const UPLOAD_ROUTE: &str = "/servlet/upload/{*path}";

/// Store the request body at the absolute path following the route prefix.
///
/// Answers 411 without a `Content-Length`, 500 when fewer bytes arrive than
/// announced or the file cannot be written, 200 otherwise.
pub async fn upload_handler(
    UrlPath(path): UrlPath<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let destination = if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        PathBuf::from(format!("/{path}"))
    };
    let Some(expected) = content_length(&headers) else {
        return (StatusCode::LENGTH_REQUIRED, "Content-Length required").into_response();
    };
    tracing::info!(destination = %destination.display(), expected, "Receiving upload");

    match store(&destination, body).await {
        Ok(received) if received == expected => {
            tracing::info!(destination = %destination.display(), "Upload completed");
            StatusCode::OK.into_response()
        }
        Ok(received) => {
            tracing::error!(
                destination = %destination.display(),
                expected,
                received,
                "Did not receive the complete file"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Did not receive the complete file",
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(destination = %destination.display(), "Upload failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Cannot store upload: {e}"),
            )
                .into_response()
        }
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

async fn store(destination: &Path, body: Body) -> io::Result<u64> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(destination).await?;
    let mut chunks = body.into_data_stream();
    let mut received = 0u64;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(io::Error::other)?;
        file.write_all(&chunk).await?;
        received += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(received)
}
