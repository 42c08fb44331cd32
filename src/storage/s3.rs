use super::{
    drain, normalize_key, BoxedReader, ErrorSender, ObjectStorage, ObjectStorageObject,
    IO_TIMEOUT_SECS, LIST_CHANNEL_CAPACITY, OP_TIMEOUT_SECS, STREAM_CHUNK_SIZE,
};
use crate::config::RemoteConfig;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use opendal::{layers::TimeoutLayer, Metakey, Operator};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Range size for streamed downloads
const DOWNLOAD_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// S3-compatible bucket, rooted at the configured prefix.
///
/// The prefix is the operator root, so keys come back from listings already
/// stripped and every operation re-prepends it.
pub struct S3ObjectStorage {
    operator: Operator,
    dry_run: bool,
    name: String,
}

impl S3ObjectStorage {
    pub fn new(config: &RemoteConfig, dry_run: bool) -> Result<Self> {
        use opendal::services::S3;

        let mut builder = S3::default().bucket(&config.bucket).region(&config.region);

        if let Some(ref key) = config.access_key {
            builder = builder.access_key_id(key);
        }
        if let Some(ref secret) = config.secret_key {
            builder = builder.secret_access_key(secret);
        }
        if let Some(ref ep) = config.endpoint {
            builder = builder.endpoint(ep);
        }

        let prefix = config.normalized_prefix();
        if !prefix.is_empty() {
            builder = builder.root(&format!("/{}/", prefix));
        }

        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        let name = if prefix.is_empty() {
            format!("s3://{}", config.bucket)
        } else {
            format!("s3://{}/{}", config.bucket, prefix)
        };
        info!("initialized object storage {}", name);

        Ok(Self::with_operator(operator, dry_run, name))
    }

    /// Wraps an already configured operator whose root is the prefix
    pub(crate) fn with_operator(operator: Operator, dry_run: bool, name: String) -> Self {
        Self {
            operator,
            dry_run,
            name,
        }
    }

    async fn list_into(
        operator: Operator,
        tx: mpsc::Sender<ObjectStorageObject>,
    ) -> std::result::Result<(), opendal::Error> {
        let mut lister = operator
            .lister_with("")
            .recursive(true)
            .metakey(
                Metakey::ContentLength
                    | Metakey::LastModified
                    | Metakey::ContentType
                    | Metakey::Mode,
            )
            .await?;

        while let Some(entry) = lister.try_next().await? {
            let key = entry.path().trim_start_matches('/').to_string();
            let meta = entry.metadata();

            // Skip the root and directory markers
            if key.is_empty() || key.ends_with('/') || meta.is_dir() {
                continue;
            }

            let object = ObjectStorageObject {
                key,
                last_modified: meta
                    .last_modified()
                    .unwrap_or_else(|| DateTime::<Utc>::from(std::time::SystemTime::UNIX_EPOCH)),
                content_type: meta.content_type().unwrap_or_default().to_string(),
                size: meta.content_length(),
            };

            if tx.send(object).await.is_err() {
                break;
            }
        }

        Ok(())
    }

    /// Streams `reader` into a writer, aborting it on any failure including
    /// cancellation so no partial multipart upload is left behind.
    async fn stream_upload(
        &self,
        cancel: &CancellationToken,
        key: &str,
        mut reader: BoxedReader,
        size: u64,
        content_type: &str,
    ) -> Result<()> {
        let mut pending = self.operator.writer_with(key);
        if self.operator.info().full_capability().write_with_content_type {
            pending = pending.content_type(content_type);
        }
        let mut writer = pending.await?;

        let mut buffer = vec![0u8; STREAM_CHUNK_SIZE];
        let mut sent: u64 = 0;

        let outcome: Result<()> = async {
            loop {
                let n = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    n = reader.read(&mut buffer) => n.map_err(|e| SyncError::transfer(key, e))?,
                };
                if n == 0 {
                    break;
                }
                sent += n as u64;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    res = writer.write(buffer[..n].to_vec()) => res?,
                }
            }

            if sent != size {
                return Err(SyncError::transfer(
                    key,
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("expected {} bytes, read {}", size, sent),
                    ),
                ));
            }
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                writer.close().await?;
                Ok(())
            }
            Err(e) => {
                let _ = writer.abort().await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ObjectStorage for S3ObjectStorage {
    fn list(&self, errors: ErrorSender) -> mpsc::Receiver<ObjectStorageObject> {
        let (tx, rx) = mpsc::channel(LIST_CHANNEL_CAPACITY);
        let operator = self.operator.clone();

        tokio::spawn(async move {
            if let Err(e) = Self::list_into(operator, tx).await {
                let _ = errors.send(SyncError::walk("remote objects", e));
            }
        });

        rx
    }

    async fn upload(
        &self,
        cancel: &CancellationToken,
        key: &str,
        reader: BoxedReader,
        size: u64,
        content_type: &str,
    ) -> Result<()> {
        let key = normalize_key(key);

        if self.dry_run {
            debug!("dry run, draining upload of {}", key);
            drain(cancel, &key, reader).await?;
            return Ok(());
        }

        self.stream_upload(cancel, &key, reader, size, content_type)
            .await
    }

    async fn download(
        &self,
        cancel: &CancellationToken,
        key: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let key = normalize_key(key);
        let meta = self.operator.stat(&key).await.map_err(|e| match e.kind() {
            opendal::ErrorKind::NotFound => SyncError::NotFound(key.clone()),
            _ => SyncError::Backend(e),
        })?;
        let total = meta.content_length();

        let mut offset = 0u64;
        while offset < total {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let end = (offset + DOWNLOAD_CHUNK_SIZE).min(total);
            let chunk = self.operator.read_with(&key).range(offset..end).await?;
            writer
                .write_all(&chunk.to_vec())
                .await
                .map_err(|e| SyncError::transfer(&key, e))?;
            offset = end;
        }

        writer.flush().await.map_err(|e| SyncError::transfer(key, e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        let key = normalize_key(key);
        // Deleting a missing object is not an error on S3
        self.operator
            .delete(&key)
            .await
            .map_err(|e| SyncError::delete(key, e))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
