//! HTTP handlers for the acceptor host.

use std::path::Path as FsPath;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    Json,
};
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::error::Error;
use crate::file::{header_safe_name, is_plain_file_name};
use crate::protocol::{IdentityResponse, UploadResponse};
use crate::transfer::acceptor::{StoredFile, UploadTicket};
use crate::transfer::TransferId;
use crate::transport::http::HEADER_TRANSFER_ID;

use super::error::{ApiError, ApiResult};
use super::SharedState;

/// Minimum spacing between PROGRESS reports during an upload.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Response types
// ============================================================================

/// Health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"`
    status: &'static str,
    /// Server time (RFC 3339)
    timestamp: String,
    /// Device name
    device: String,
}

/// Query parameters of `POST /upload`.
#[derive(Debug, Deserialize)]
pub struct UploadParams {
    #[serde(rename = "transferId")]
    transfer_id: Option<String>,
}

// ============================================================================
// Identity
// ============================================================================

/// GET /api/identify - Identity answered to discovery probes.
pub async fn identify(State(state): State<SharedState>) -> Json<IdentityResponse> {
    Json(state.acceptor.identity())
}

/// GET /health - Liveness.
pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().to_rfc3339(),
        device: state.acceptor.device_name().to_string(),
    })
}

// ============================================================================
// Upload
// ============================================================================

/// POST /upload?transferId= - Stream the raw body of an accepted transfer to
/// disk.
pub async fn upload(
    State(state): State<SharedState>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Json<UploadResponse>> {
    let transfer_id = params
        .transfer_id
        .or_else(|| {
            headers
                .get(HEADER_TRANSFER_ID)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        })
        .filter(|id| !id.is_empty())
        .map(TransferId::from)
        .ok_or_else(|| {
            ApiError::bad_request("Missing transfer id")
                .with_details("pass ?transferId= or the X-Transfer-Id header")
        })?;

    let acceptor = &state.acceptor;
    let ticket = acceptor.begin_http_upload(&transfer_id).await?;
    let (saved_as, path) = acceptor.storage_path(&ticket.file_name);

    match receive_body(&state, &ticket, &path, body).await {
        Ok(size) => {
            let stored = StoredFile {
                saved_as,
                path: path.clone(),
                size,
            };
            if let Err(err) = acceptor.complete_inbound(&transfer_id, &stored).await {
                discard(&path).await;
                return Err(err.into());
            }
            Ok(Json(UploadResponse {
                ok: true,
                status: "success".to_string(),
                message: format!("Received {}", ticket.file_name),
                filename: ticket.file_name.clone(),
                size,
                download_url: stored.download_url(),
                saved_as: stored.saved_as,
            }))
        }
        Err(err) => {
            discard(&path).await;
            acceptor.fail_inbound(&transfer_id, &err).await;
            Err(err.into())
        }
    }
}

async fn discard(path: &FsPath) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::debug!("No partial file to remove at {}: {}", path.display(), e);
    }
}

async fn receive_body(
    state: &SharedState,
    ticket: &UploadTicket,
    path: &FsPath,
    body: Body,
) -> crate::Result<u64> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = File::create(path).await?;
    let mut stream = body.into_data_stream();
    let mut received: u64 = 0;
    let mut last_report = Instant::now();

    loop {
        let next = tokio::select! {
            () = ticket.cancel.cancelled() => return Err(Error::TransferCancelled),
            next = stream.next() => next,
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk
            .map_err(|e| Error::ConnectionLost(format!("upload body interrupted: {e}")))?;

        received += chunk.len() as u64;
        if received > ticket.size {
            return Err(Error::SizeMismatch {
                file: ticket.file_name.clone(),
                expected: ticket.size,
                actual: received,
            });
        }
        file.write_all(&chunk).await?;

        if last_report.elapsed() >= PROGRESS_INTERVAL {
            state
                .acceptor
                .report_progress(&ticket.transfer_id, received)
                .await;
            last_report = Instant::now();
        }
    }

    file.flush().await?;
    if received != ticket.size {
        return Err(Error::SizeMismatch {
            file: ticket.file_name.clone(),
            expected: ticket.size,
            actual: received,
        });
    }
    state
        .acceptor
        .report_progress(&ticket.transfer_id, received)
        .await;
    Ok(received)
}

// ============================================================================
// Download
// ============================================================================

/// GET /api/files/{name} - Download a received file.
pub async fn download(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    if !is_plain_file_name(&name) {
        return Err(ApiError::bad_request("Invalid file name"));
    }

    let path = state.acceptor.download_dir().join(&name);
    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::not_found(format!("File '{name}' not found")));
        }
        Err(e) => return Err(ApiError::internal(format!("Failed to open file: {e}"))),
    };
    let metadata = file
        .metadata()
        .await
        .map_err(|e| ApiError::internal(format!("Failed to read file metadata: {e}")))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found(format!("File '{name}' not found")));
    }

    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", header_safe_name(&name)),
        )
        .header(header::CONTENT_LENGTH, metadata.len())
        .body(body)
        .map_err(|e| ApiError::internal(format!("Failed to build response: {e}")))
}
