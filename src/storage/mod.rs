pub mod local;
pub mod memory;
pub mod s3;

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use local::LocalFileStorage;
pub use memory::{MemoryFileStorage, MemoryObjectStorage};
pub use s3::S3ObjectStorage;

// ============ Shared constants ============

/// Non-IO operation timeout (seconds): stat, delete, list pages
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO operation timeout (seconds): read, write
pub const IO_TIMEOUT_SECS: u64 = 300;
/// Capacity of the channels returned by `list`
pub const LIST_CHANNEL_CAPACITY: usize = 64;
/// Chunk size used when streaming between readers and backends
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Streaming byte source handed between storages, the UI and the executor.
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Sink for errors raised by background listings.
pub type ErrorSender = mpsc::UnboundedSender<SyncError>;

/// A regular file in the local source tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    /// Relative to the source root, `/`-separated
    pub path: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

/// An object beneath the configured remote prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStorageObject {
    /// Relative to the remote prefix
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub content_type: String,
    pub size: u64,
}

/// Local side of a synchronization.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Streams every regular file under the root; walk errors go to `errors`.
    fn list(&self, errors: ErrorSender) -> mpsc::Receiver<File>;

    /// Stats one entry. A leading `/` is ignored.
    async fn get(&self, path: &str) -> Result<File>;

    /// Forces access and modification times.
    async fn set_modified(&self, path: &str, time: DateTime<Utc>) -> Result<()>;

    /// Opens the entry for streaming. Reads fail once `cancel` fires.
    async fn read(&self, cancel: &CancellationToken, path: &str) -> Result<BoxedReader>;

    /// Replaces or creates the entry with the full contents of `reader`.
    async fn write(&self, cancel: &CancellationToken, path: &str, reader: BoxedReader)
        -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Name used in logs
    fn name(&self) -> &str;
}

/// Remote side of a synchronization, rooted at a bucket and prefix.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Streams every object beneath the prefix with the prefix stripped.
    fn list(&self, errors: ErrorSender) -> mpsc::Receiver<ObjectStorageObject>;

    /// Stores exactly `size` bytes of `reader` at `key`.
    async fn upload(
        &self,
        cancel: &CancellationToken,
        key: &str,
        reader: BoxedReader,
        size: u64,
        content_type: &str,
    ) -> Result<()>;

    async fn download(
        &self,
        cancel: &CancellationToken,
        key: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Name used in logs
    fn name(&self) -> &str;
}

/// Strips leading separators so `/a/b` and `a/b` address the same entry.
pub fn normalize_key(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

/// Reader that fails every poll once its token is cancelled.
pub struct CancellableReader<R> {
    inner: R,
    cancel: CancellationToken,
}

impl<R> CancellableReader<R> {
    pub fn new(inner: R, cancel: CancellationToken) -> Self {
        Self { inner, cancel }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CancellableReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "read cancelled",
            )));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Reads `reader` to the end, failing on cancellation.
pub(crate) async fn drain(
    cancel: &CancellationToken,
    path: &str,
    mut reader: BoxedReader,
) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;

    let mut data = Vec::new();
    let outcome = tokio::select! {
        _ = cancel.cancelled() => None,
        res = reader.read_to_end(&mut data) => Some(res),
    };
    match outcome {
        None => Err(SyncError::Cancelled),
        Some(Ok(_)) => Ok(data),
        Some(Err(e)) => Err(SyncError::transfer(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("/a/b.txt"), "a/b.txt");
        assert_eq!(normalize_key("a\\b.txt"), "a/b.txt");
        assert_eq!(normalize_key("plain"), "plain");
    }

    #[tokio::test]
    async fn test_cancellable_reader_stops_after_cancel() {
        let cancel = CancellationToken::new();
        let mut reader =
            CancellableReader::new(std::io::Cursor::new(b"hello".to_vec()), cancel.clone());

        let mut first = [0u8; 2];
        reader.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"he");

        cancel.cancel();
        let err = reader.read_u8().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }
}
