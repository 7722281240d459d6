//! Chunked-over-signaling data plane.
//!
//! The sender slices the file into fixed-size chunks and writes each one as a
//! binary frame on the signaling socket, then closes with
//! `TRANSFER_FINISH`. Frames carry no transfer tag: the receiver attributes
//! them to the single transfer its connection is currently receiving, and
//! collects them in a [`ChunkAccumulator`] until the finish message arrives.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::{Outbound, OutboundSender, ProgressHandle};
use crate::error::{Error, Result};
use crate::file::ChunkReader;
use crate::protocol::SignalingMessage;
use crate::transfer::TransferId;

/// Parameters of one chunked send.
#[derive(Debug, Clone)]
pub struct ChunkedUpload {
    /// Transfer identifier
    pub transfer_id: TransferId,
    /// Receiving device id, echoed in `TRANSFER_FINISH` for the registry dialect
    pub target_id: Option<String>,
    /// File to send
    pub path: PathBuf,
    /// Bytes per frame
    pub chunk_size: usize,
    /// Pause after each frame; zero only yields to the scheduler
    pub chunk_delay: Duration,
}

/// Send a file as binary frames followed by `TRANSFER_FINISH`.
///
/// Returns the number of bytes sent. Stops with
/// [`Error::TransferCancelled`] as soon as `cancel` fires.
pub async fn send_file(
    outbound: &OutboundSender,
    upload: &ChunkedUpload,
    progress: &ProgressHandle,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut reader = ChunkReader::open(&upload.path, upload.chunk_size).await?;
    let mut frames = 0usize;

    while let Some(chunk) = reader.next_chunk().await? {
        if cancel.is_cancelled() {
            return Err(Error::TransferCancelled);
        }

        outbound
            .send(Outbound::Binary(chunk))
            .await
            .map_err(|_| closed())?;
        frames += 1;
        progress.set(reader.offset());

        pause(upload.chunk_delay, cancel).await?;
    }

    outbound
        .send(Outbound::Message(SignalingMessage::TransferFinish {
            target_id: upload.target_id.clone(),
            transfer_id: upload.transfer_id.clone(),
        }))
        .await
        .map_err(|_| closed())?;

    tracing::debug!(
        "transfer {}: sent {} bytes in {} frame(s)",
        upload.transfer_id,
        reader.offset(),
        frames
    );
    Ok(reader.offset())
}

async fn pause(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    if delay.is_zero() {
        tokio::task::yield_now().await;
        return Ok(());
    }
    tokio::select! {
        () = tokio::time::sleep(delay) => Ok(()),
        () = cancel.cancelled() => Err(Error::TransferCancelled),
    }
}

fn closed() -> Error {
    Error::ConnectionLost("signaling channel closed".into())
}

/// Collects the frames of one inbound chunked transfer in memory.
#[derive(Debug)]
pub struct ChunkAccumulator {
    transfer_id: TransferId,
    file_name: String,
    expected: u64,
    received: u64,
    chunks: Vec<Bytes>,
}

impl ChunkAccumulator {
    /// Start collecting `expected` bytes for `transfer_id`.
    #[must_use]
    pub fn new(transfer_id: TransferId, file_name: impl Into<String>, expected: u64) -> Self {
        Self {
            transfer_id,
            file_name: file_name.into(),
            expected,
            received: 0,
            chunks: Vec::new(),
        }
    }

    /// Transfer this accumulator belongs to.
    pub const fn transfer_id(&self) -> &TransferId {
        &self.transfer_id
    }

    /// Bytes collected so far.
    pub const fn received(&self) -> u64 {
        self.received
    }

    /// Announced size.
    pub const fn expected(&self) -> u64 {
        self.expected
    }

    /// Append one frame; returns the new total.
    ///
    /// A frame that would exceed the announced size is refused.
    pub fn push(&mut self, frame: Bytes) -> Result<u64> {
        let total = self.received + frame.len() as u64;
        if total > self.expected {
            return Err(Error::SizeMismatch {
                file: self.file_name.clone(),
                expected: self.expected,
                actual: total,
            });
        }
        self.received = total;
        self.chunks.push(frame);
        Ok(total)
    }

    /// Write the collected bytes to `path`; the size must match exactly.
    pub async fn write_to(self, path: &Path) -> Result<u64> {
        if self.received != self.expected {
            return Err(Error::SizeMismatch {
                file: self.file_name,
                expected: self.expected,
                actual: self.received,
            });
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(path).await?;
        for chunk in &self.chunks {
            file.write_all(chunk).await?;
        }
        file.flush().await?;
        Ok(self.received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn write_file(dir: &TempDir, len: usize) -> PathBuf {
        let path = dir.path().join("payload.bin");
        let content: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
        std::fs::write(&path, content).unwrap();
        path
    }

    fn upload_for(path: PathBuf) -> ChunkedUpload {
        ChunkedUpload {
            transfer_id: TransferId::from("t1"),
            target_id: None,
            path,
            chunk_size: 64 * 1024,
            chunk_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_150k_file_sends_three_frames() {
        let dir = TempDir::new().unwrap();
        let upload = upload_for(write_file(&dir, 150 * 1024));
        let (tx, mut rx) = mpsc::channel(16);
        let (progress, _progress_rx) = ProgressHandle::channel();

        let sent = send_file(&tx, &upload, &progress, &CancellationToken::new())
            .await
            .expect("send");
        drop(tx);

        let mut frames = Vec::new();
        let mut finish = None;
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Binary(bytes) => frames.push(bytes.len()),
                Outbound::Message(msg) => finish = Some(msg),
                Outbound::Close => panic!("unexpected close"),
            }
        }

        assert_eq!(sent, 150 * 1024);
        assert_eq!(frames, vec![64 * 1024, 64 * 1024, 22 * 1024]);
        assert_eq!(
            finish,
            Some(SignalingMessage::TransferFinish {
                target_id: None,
                transfer_id: TransferId::from("t1"),
            })
        );
        assert_eq!(progress.get(), 150 * 1024);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let mut upload = upload_for(write_file(&dir, 10 * 1024));
        upload.chunk_size = 1024;
        let (tx, mut rx) = mpsc::channel(64);
        let (progress, mut progress_rx) = ProgressHandle::channel();

        let watcher = tokio::spawn(async move {
            let mut seen = Vec::new();
            while progress_rx.changed().await.is_ok() {
                seen.push(*progress_rx.borrow_and_update());
            }
            seen
        });

        send_file(&tx, &upload, &progress, &CancellationToken::new())
            .await
            .expect("send");
        drop(progress);
        drop(tx);
        while rx.recv().await.is_some() {}

        let seen = watcher.await.unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last().copied(), Some(10 * 1024));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_frame() {
        let dir = TempDir::new().unwrap();
        let upload = upload_for(write_file(&dir, 4096));
        let (tx, mut rx) = mpsc::channel(16);
        let (progress, _rx) = ProgressHandle::channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = send_file(&tx, &upload, &progress, &cancel).await.unwrap_err();
        drop(tx);

        assert!(matches!(err, Error::TransferCancelled));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_channel_is_connection_loss() {
        let dir = TempDir::new().unwrap();
        let upload = upload_for(write_file(&dir, 4096));
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let (progress, _rx) = ProgressHandle::channel();

        let err = send_file(&tx, &upload, &progress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_accumulator_writes_exact_bytes() {
        let dir = TempDir::new().unwrap();
        let mut acc = ChunkAccumulator::new(TransferId::from("t1"), "a.txt", 10);

        assert_eq!(acc.push(Bytes::from_static(b"hello")).unwrap(), 5);
        assert_eq!(acc.push(Bytes::from_static(b"world")).unwrap(), 10);

        let out = dir.path().join("nested").join("a.txt");
        assert_eq!(acc.write_to(&out).await.unwrap(), 10);
        assert_eq!(std::fs::read(&out).unwrap(), b"helloworld");
    }

    #[tokio::test]
    async fn test_accumulator_rejects_overflow_and_short_files() {
        let dir = TempDir::new().unwrap();
        let mut acc = ChunkAccumulator::new(TransferId::from("t1"), "a.txt", 4);
        assert!(matches!(
            acc.push(Bytes::from_static(b"too long")),
            Err(Error::SizeMismatch { .. })
        ));

        acc.push(Bytes::from_static(b"ab")).unwrap();
        let err = acc.write_to(&dir.path().join("a.txt")).await.unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { actual: 2, .. }));
    }
}
