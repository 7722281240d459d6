//! File operations for transfers.
//!
//! Naming rules for stored files, a sequential chunk reader for the
//! chunked data plane, and size formatting for display.

use std::path::Path;

use bytes::Bytes;
use tokio::io::AsyncReadExt;

use crate::error::{Error, Result};

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
///
/// Leading dots are replaced too so a stored file is never hidden or
/// mistaken for `.`/`..`.
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let mut cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let leading_dots = cleaned.chars().take_while(|c| *c == '.').count();
    if leading_dots > 0 {
        cleaned.replace_range(..leading_dots, &"_".repeat(leading_dots));
    }
    if cleaned.is_empty() {
        cleaned.push_str("file");
    }
    cleaned
}

/// Name a received file is stored under: `{millis}-{sanitized name}`.
#[must_use]
pub fn stored_file_name(original: &str, timestamp_millis: i64) -> String {
    format!("{timestamp_millis}-{}", sanitize_file_name(original))
}

/// Whether `name` is a plain file name that cannot escape a directory.
#[must_use]
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
        && !name.contains("..")
}

/// Render a file name for an HTTP header, replacing bytes a header cannot
/// carry.
#[must_use]
pub fn header_safe_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .collect()
}

/// The base name of `path`, as UTF-8.
pub fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::InvalidPath(path.display().to_string()))
}

/// Format a file size for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Reads a file front to back in fixed-size chunks.
///
/// Only one chunk is held in memory at a time; the last chunk may be short.
#[derive(Debug)]
pub struct ChunkReader {
    file: tokio::fs::File,
    chunk_size: usize,
    file_size: u64,
    offset: u64,
}

impl ChunkReader {
    /// Open `path` for chunked reading.
    pub async fn open(path: &Path, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidConfig {
                key: "transfer.chunk_size".into(),
                reason: "must be greater than zero".into(),
            });
        }

        let file = tokio::fs::File::open(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::FileNotFound(path.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;
        let file_size = file.metadata().await?.len();

        Ok(Self {
            file,
            chunk_size,
            file_size,
            offset: 0,
        })
    }

    /// Size of the file when it was opened.
    pub const fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Bytes handed out so far.
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next chunk, or `None` at end of file.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut filled = 0;

        while filled < self.chunk_size {
            let n = self.file.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }

        buffer.truncate(filled);
        self.offset += filled as u64;
        Ok(Some(Bytes::from(buffer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("my file (1).txt"), "my_file__1_.txt");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\temp\\x.bin"), "x.bin");
        assert_eq!(sanitize_file_name(".hidden"), "_hidden");
        assert_eq!(sanitize_file_name("фото.jpg"), "____.jpg");
        assert_eq!(sanitize_file_name(""), "file");
    }

    #[test]
    fn test_stored_file_name() {
        assert_eq!(
            stored_file_name("a b.txt", 1_700_000_000_000),
            "1700000000000-a_b.txt"
        );
    }

    #[test]
    fn test_plain_file_name() {
        assert!(is_plain_file_name("1700-a.txt"));
        assert!(!is_plain_file_name("../secret"));
        assert!(!is_plain_file_name("dir/file"));
        assert!(!is_plain_file_name(".."));
        assert!(!is_plain_file_name(""));
    }

    #[test]
    fn test_header_safe_name() {
        assert_eq!(header_safe_name("résumé v2.pdf"), "r_sum_ v2.pdf");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(150 * 1024), "150.0 KB");
        assert_eq!(format_size(1024 * 1024 * 1024), "1.0 GB");
    }

    #[tokio::test]
    async fn test_chunk_reader_splits_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let content: Vec<u8> = (0..150 * 1024).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let mut reader = ChunkReader::open(&path, 64 * 1024).await.expect("open");
        assert_eq!(reader.file_size(), 150 * 1024);

        let mut sizes = Vec::new();
        let mut joined = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.expect("read") {
            sizes.push(chunk.len());
            joined.extend_from_slice(&chunk);
        }

        assert_eq!(sizes, vec![64 * 1024, 64 * 1024, 22 * 1024]);
        assert_eq!(joined, content);
        assert_eq!(reader.offset(), 150 * 1024);
    }

    #[tokio::test]
    async fn test_chunk_reader_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        let mut reader = ChunkReader::open(&path, 1024).await.expect("open");
        assert!(reader.next_chunk().await.expect("read").is_none());
    }

    #[tokio::test]
    async fn test_chunk_reader_missing_file() {
        let err = ChunkReader::open(Path::new("/definitely/not/here.bin"), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }
}
