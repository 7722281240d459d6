//! Raw HTTP upload data plane.
//!
//! After acceptance the initiator streams the file as the body of
//! `POST http://{host}:{port}/upload?transferId={id}`, with the metadata in
//! `X-Transfer-Id`, `X-File-Name` and `X-Sender-Device-Id` headers. The file
//! is never buffered whole; progress counts bytes handed to the socket.

use std::net::SocketAddr;
use std::path::PathBuf;

use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, StatusCode};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use super::ProgressHandle;
use crate::error::{Error, Result};
use crate::file::header_safe_name;
use crate::protocol::{ErrorBody, UploadResponse};
use crate::transfer::TransferId;

/// Header carrying the transfer identifier.
pub const HEADER_TRANSFER_ID: &str = "X-Transfer-Id";
/// Header carrying the original file name.
pub const HEADER_FILE_NAME: &str = "X-File-Name";
/// Header carrying the initiator's device id.
pub const HEADER_SENDER_ID: &str = "X-Sender-Device-Id";

const READ_BUFFER: usize = 64 * 1024;

/// HTTP client for LAN peers.
///
/// System proxies are ignored: every peer is on the local network.
#[must_use]
pub fn lan_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .unwrap_or_default()
}

/// One file to upload.
#[derive(Debug, Clone)]
pub struct HttpUpload {
    /// Acceptor address
    pub address: SocketAddr,
    /// Transfer identifier
    pub transfer_id: TransferId,
    /// Announced file name
    pub file_name: String,
    /// Initiator device id
    pub sender_id: String,
    /// File to read
    pub path: PathBuf,
}

/// What the acceptor reported after a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Bytes sent
    pub size: u64,
    /// Name the acceptor stored the file under, when it said so
    pub saved_as: Option<String>,
    /// Download path on the acceptor host, when it said so
    pub download_url: Option<String>,
}

/// Stream a file to the acceptor's upload endpoint.
pub async fn upload(
    client: &reqwest::Client,
    upload: &HttpUpload,
    progress: &ProgressHandle,
    cancel: &CancellationToken,
) -> Result<UploadReceipt> {
    let file = tokio::fs::File::open(&upload.path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::FileNotFound(upload.path.display().to_string())
        } else {
            Error::Io(e)
        }
    })?;
    let size = file.metadata().await?.len();

    let counter = progress.clone();
    let mut sent = 0u64;
    let body = ReaderStream::with_capacity(file, READ_BUFFER).map(move |chunk| {
        if let Ok(bytes) = &chunk {
            sent += bytes.len() as u64;
            counter.set(sent);
        }
        chunk
    });

    let url = format!("http://{}/upload", upload.address);
    let request = client
        .post(&url)
        .query(&[("transferId", upload.transfer_id.as_str())])
        .header(HEADER_TRANSFER_ID, upload.transfer_id.as_str())
        .header(HEADER_FILE_NAME, header_safe_name(&upload.file_name))
        .header(HEADER_SENDER_ID, upload.sender_id.as_str())
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(CONTENT_LENGTH, size)
        .body(Body::wrap_stream(body));

    tracing::debug!(
        "transfer {}: uploading {} bytes to {}",
        upload.transfer_id,
        size,
        url
    );

    let response = tokio::select! {
        () = cancel.cancelled() => return Err(Error::TransferCancelled),
        result = request.send() => result.map_err(|e| {
            Error::UploadFailed(format!("Network error during upload: {e}"))
        })?,
    };

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(Error::UploadFailed(error_message(status, &text)));
    }

    progress.set(size);
    let body = response.json::<UploadResponse>().await.ok();
    Ok(UploadReceipt {
        size,
        saved_as: body.as_ref().map(|b| b.saved_as.clone()),
        download_url: body.map(|b| b.download_url),
    })
}

/// Failure text for a non-2xx upload response.
///
/// Prefers the body's `error` field, then `message`, then the status reason.
#[must_use]
pub fn error_message(status: StatusCode, body: &str) -> String {
    let parsed = serde_json::from_str::<ErrorBody>(body).ok();
    parsed
        .and_then(|b| {
            b.error
                .filter(|s| !s.is_empty())
                .or_else(|| b.message.filter(|s| !s.is_empty()))
        })
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .map_or_else(|| status.as_str().to_string(), str::to_string)
        })
}
