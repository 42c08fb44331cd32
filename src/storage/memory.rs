//! In-memory storages used to exercise the engine without a network or disk.

use super::{
    drain, normalize_key, BoxedReader, CancellableReader, ErrorSender, File, FileStorage,
    ObjectStorage, ObjectStorageObject,
};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Snapshot a collection into an already-filled receiver.
fn preloaded<T>(items: Vec<T>) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(items.len().max(1));
    for item in items {
        // Capacity covers every item
        let _ = tx.try_send(item);
    }
    rx
}

fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking test must not poison every other assertion
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Vec<u8>,
    last_modified: DateTime<Utc>,
}

/// Local-side storage held in a map.
#[derive(Clone, Default)]
pub struct MemoryFileStorage {
    files: Arc<Mutex<BTreeMap<String, MemoryFile>>>,
    /// Walk error reported by every `list`
    list_failure: Arc<Mutex<Option<String>>>,
    dry_run: bool,
}

impl MemoryFileStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dry_run(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    /// Seed a file directly, bypassing dry-run
    pub fn insert(&self, path: &str, data: Vec<u8>, last_modified: DateTime<Utc>) {
        lock(&self.files).insert(
            normalize_key(path),
            MemoryFile {
                data,
                last_modified,
            },
        );
    }

    /// Make every `list` report a walk error; the seeded files are still listed
    pub fn fail_list_with(&self, message: impl Into<String>) {
        *lock(&self.list_failure) = Some(message.into());
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.files)
            .get(&normalize_key(path))
            .map(|f| f.data.clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.files).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FileStorage for MemoryFileStorage {
    fn list(&self, errors: ErrorSender) -> mpsc::Receiver<File> {
        if let Some(message) = lock(&self.list_failure).clone() {
            let _ = errors.send(SyncError::walk("local files", message));
        }
        let files = lock(&self.files)
            .iter()
            .map(|(path, f)| File {
                path: path.clone(),
                last_modified: f.last_modified,
                size: f.data.len() as u64,
            })
            .collect();
        preloaded(files)
    }

    async fn get(&self, path: &str) -> Result<File> {
        let key = normalize_key(path);
        let files = lock(&self.files);
        let f = files
            .get(&key)
            .ok_or_else(|| SyncError::NotFound(key.clone()))?;
        Ok(File {
            path: key.clone(),
            last_modified: f.last_modified,
            size: f.data.len() as u64,
        })
    }

    async fn set_modified(&self, path: &str, time: DateTime<Utc>) -> Result<()> {
        let key = normalize_key(path);
        let mut files = lock(&self.files);
        let f = files
            .get_mut(&key)
            .ok_or_else(|| SyncError::NotFound(key.clone()))?;
        f.last_modified = time;
        Ok(())
    }

    async fn read(&self, cancel: &CancellationToken, path: &str) -> Result<BoxedReader> {
        let key = normalize_key(path);
        let data = lock(&self.files)
            .get(&key)
            .map(|f| f.data.clone())
            .ok_or(SyncError::NotFound(key))?;
        Ok(Box::pin(CancellableReader::new(
            std::io::Cursor::new(data),
            cancel.clone(),
        )))
    }

    async fn write(&self, cancel: &CancellationToken, path: &str, reader: BoxedReader) -> Result<()> {
        let key = normalize_key(path);
        let data = drain(cancel, &key, reader).await?;
        if self.dry_run {
            return Ok(());
        }
        lock(&self.files).insert(
            key,
            MemoryFile {
                data,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        let key = normalize_key(path);
        lock(&self.files)
            .remove(&key)
            .map(|_| ())
            .ok_or(SyncError::NotFound(key))
    }

    fn name(&self) -> &str {
        "memory:files"
    }
}

#[derive(Debug, Clone)]
struct MemoryObject {
    data: Vec<u8>,
    content_type: String,
    last_modified: DateTime<Utc>,
}

#[derive(Default)]
struct ObjectState {
    objects: BTreeMap<String, MemoryObject>,
    /// Keys that should fail on upload
    fail_upload_keys: HashSet<String>,
    /// Keys that should fail on deletion
    fail_delete_keys: HashSet<String>,
    /// Walk error reported by every `list`
    list_failure: Option<String>,
}

/// Remote-side storage held in a map.
///
/// Besides the `ObjectStorage` contract it can inject failures and be
/// inspected after a run.
#[derive(Clone, Default)]
pub struct MemoryObjectStorage {
    state: Arc<Mutex<ObjectState>>,
    dry_run: bool,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dry_run(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    /// Seed an object directly, bypassing dry-run
    pub fn insert(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
        last_modified: DateTime<Utc>,
    ) {
        lock(&self.state).objects.insert(
            normalize_key(key),
            MemoryObject {
                data,
                content_type: content_type.to_string(),
                last_modified,
            },
        );
    }

    /// Make upload fail for a specific key
    pub fn fail_upload_for(&self, key: impl Into<String>) {
        lock(&self.state).fail_upload_keys.insert(key.into());
    }

    /// Make every `list` report a walk error; the seeded objects are still listed
    pub fn fail_list_with(&self, message: impl Into<String>) {
        lock(&self.state).list_failure = Some(message.into());
    }

    /// Make deletion fail for a specific key
    pub fn fail_delete_for(&self, key: impl Into<String>) {
        lock(&self.state).fail_delete_keys.insert(key.into());
    }

    pub fn contents(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.state).objects.get(key).map(|o| o.data.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        lock(&self.state)
            .objects
            .get(key)
            .map(|o| o.content_type.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.state).objects.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    fn list(&self, errors: ErrorSender) -> mpsc::Receiver<ObjectStorageObject> {
        let state = lock(&self.state);
        if let Some(ref message) = state.list_failure {
            let _ = errors.send(SyncError::walk("remote objects", message));
        }
        let objects = state
            .objects
            .iter()
            .map(|(key, o)| ObjectStorageObject {
                key: key.clone(),
                last_modified: o.last_modified,
                content_type: o.content_type.clone(),
                size: o.data.len() as u64,
            })
            .collect();
        preloaded(objects)
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
        let data = drain(cancel, &key, reader).await?;

        if lock(&self.state).fail_upload_keys.contains(&key) {
            return Err(SyncError::transfer(
                key,
                std::io::Error::other("injected upload failure"),
            ));
        }

        if data.len() as u64 != size {
            return Err(SyncError::transfer(
                key,
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("expected {} bytes, got {}", size, data.len()),
                ),
            ));
        }

        if self.dry_run {
            return Ok(());
        }

        lock(&self.state).objects.insert(
            key,
            MemoryObject {
                data,
                content_type: content_type.to_string(),
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn download(
        &self,
        cancel: &CancellationToken,
        key: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let key = normalize_key(key);
        let data = lock(&self.state)
            .objects
            .get(&key)
            .map(|o| o.data.clone())
            .ok_or_else(|| SyncError::NotFound(key.clone()))?;

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        writer
            .write_all(&data)
            .await
            .map_err(|e| SyncError::transfer(&key, e))?;
        writer.flush().await.map_err(|e| SyncError::transfer(key, e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = normalize_key(key);
        let mut state = lock(&self.state);

        if state.fail_delete_keys.contains(&key) {
            return Err(SyncError::delete(key, "injected delete failure"));
        }
        if self.dry_run {
            return Ok(());
        }
        state.objects.remove(&key);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory:objects"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tokio::io::AsyncReadExt;

    fn reader(data: &[u8]) -> BoxedReader {
        Box::pin(std::io::Cursor::new(data.to_vec()))
    }

    async fn collect<T>(mut rx: mpsc::Receiver<T>) -> Vec<T> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_file_storage_write_get_read() {
        let storage = MemoryFileStorage::new();
        let cancel = CancellationToken::new();

        storage.write(&cancel, "/a/b.txt", reader(b"abc")).await.unwrap();

        let file = storage.get("a/b.txt").await.unwrap();
        assert_eq!(file.size, 3);

        let mut data = Vec::new();
        storage
            .read(&cancel, "a/b.txt")
            .await
            .unwrap()
            .read_to_end(&mut data)
            .await
            .unwrap();
        assert_eq!(data, b"abc");
    }

    #[tokio::test]
    async fn test_file_storage_set_modified_missing() {
        let storage = MemoryFileStorage::new();
        let err = storage.set_modified("x", Utc::now()).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_file_storage_dry_run() {
        let storage = MemoryFileStorage::with_dry_run(true);
        let cancel = CancellationToken::new();
        storage.insert("keep.txt", vec![1], Utc::now());

        storage.write(&cancel, "new.txt", reader(b"abc")).await.unwrap();
        storage.delete("keep.txt").await.unwrap();

        assert!(storage.contents("new.txt").is_none());
        assert!(storage.contents("keep.txt").is_some());
    }

    #[tokio::test]
    async fn test_object_storage_upload_keeps_content_type() {
        let storage = MemoryObjectStorage::new();
        let cancel = CancellationToken::new();

        storage
            .upload(&cancel, "doc.html", reader(b"<html>"), 6, "text/html; charset=utf-8")
            .await
            .unwrap();

        let objects = collect(storage.list(mpsc::unbounded_channel().0)).await;
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].content_type, "text/html; charset=utf-8");
        assert_eq!(objects[0].size, 6);
    }

    #[tokio::test]
    async fn test_object_storage_rejects_size_mismatch() {
        let storage = MemoryObjectStorage::new();
        let cancel = CancellationToken::new();

        let err = storage
            .upload(&cancel, "a", reader(b"abc"), 5, "text/plain")
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Transfer { .. }));
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_object_storage_injected_failures() {
        let storage = MemoryObjectStorage::new();
        let cancel = CancellationToken::new();
        storage.insert("old", vec![], "", Utc::now() - Duration::days(1));
        storage.fail_upload_for("new");
        storage.fail_delete_for("old");

        assert!(storage.upload(&cancel, "new", reader(b""), 0, "").await.is_err());
        assert!(storage.delete("old").await.is_err());
        assert_eq!(storage.keys(), vec!["old".to_string()]);
    }

    #[tokio::test]
    async fn test_list_failure_still_yields_entries() {
        let files = MemoryFileStorage::new();
        let objects = MemoryObjectStorage::new();
        files.insert("a.txt", vec![1], Utc::now());
        objects.insert("b.txt", vec![2], "", Utc::now());
        files.fail_list_with("permission denied");
        objects.fail_list_with("throttled");

        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        assert_eq!(collect(files.list(err_tx.clone())).await.len(), 1);
        assert_eq!(collect(objects.list(err_tx)).await.len(), 1);

        let mut errors = Vec::new();
        while let Ok(e) = err_rx.try_recv() {
            errors.push(e);
        }
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| matches!(e, SyncError::Walk { .. })));
    }

    #[tokio::test]
    async fn test_object_storage_download() {
        let storage = MemoryObjectStorage::new();
        let cancel = CancellationToken::new();
        storage.insert("k", b"payload".to_vec(), "text/plain", Utc::now());

        let mut out = Vec::new();
        storage.download(&cancel, "k", &mut out).await.unwrap();
        assert_eq!(out, b"payload");

        let err = storage.download(&cancel, "missing", &mut out).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_object_storage_dry_run_drains_without_storing() {
        let storage = MemoryObjectStorage::with_dry_run(true);
        let cancel = CancellationToken::new();
        storage.insert("old", vec![], "", Utc::now());

        storage.upload(&cancel, "new", reader(b"abc"), 3, "").await.unwrap();
        storage.delete("old").await.unwrap();

        assert_eq!(storage.keys(), vec!["old".to_string()]);
    }
}
