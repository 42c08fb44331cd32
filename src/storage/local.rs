use super::{
    drain, normalize_key, BoxedReader, CancellableReader, ErrorSender, File, FileStorage,
    LIST_CHANNEL_CAPACITY,
};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

/// Source tree on the local filesystem.
///
/// Symbolic links are not followed: a link is neither reported as a file nor
/// descended into.
pub struct LocalFileStorage {
    base_path: PathBuf,
    dry_run: bool,
    name: String,
}

impl LocalFileStorage {
    pub fn new(path: impl AsRef<Path>, dry_run: bool) -> Self {
        let base_path = path.as_ref().to_path_buf();
        let name = format!("local:{}", base_path.display());
        Self {
            base_path,
            dry_run,
            name,
        }
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = normalize_key(path);
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }

    /// Normalize path separators to `/`
    fn normalize_path(path: &str) -> String {
        path.replace('\\', "/")
    }

    fn not_found_or(path: &str, err: std::io::Error) -> SyncError {
        if err.kind() == ErrorKind::NotFound {
            SyncError::NotFound(path.to_string())
        } else {
            SyncError::Io(err)
        }
    }

    fn walk(base_path: PathBuf, tx: mpsc::Sender<File>, errors: ErrorSender) {
        for entry in WalkDir::new(&base_path).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let _ = errors.send(SyncError::walk("local files", e));
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    let _ = errors.send(SyncError::walk("local files", e));
                    continue;
                }
            };

            let Some(relative_path) = entry
                .path()
                .strip_prefix(&base_path)
                .ok()
                .and_then(|p| p.to_str())
            else {
                let _ = errors.send(SyncError::walk(
                    "local files",
                    format!("unsupported path {}", entry.path().display()),
                ));
                continue;
            };

            let last_modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| DateTime::<Utc>::from(SystemTime::UNIX_EPOCH));

            let file = File {
                path: Self::normalize_path(relative_path),
                last_modified,
                size: metadata.len(),
            };

            // Receiver dropped: the consumer stopped listening.
            if tx.blocking_send(file).is_err() {
                break;
            }
        }
    }

    fn temp_path(full_path: &Path) -> PathBuf {
        let file_name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        full_path.with_file_name(format!(".{}.bucketsync-tmp", file_name))
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    fn list(&self, errors: ErrorSender) -> mpsc::Receiver<File> {
        let (tx, rx) = mpsc::channel(LIST_CHANNEL_CAPACITY);
        let base_path = self.base_path.clone();

        // walkdir blocks; keep it off the async workers
        tokio::task::spawn_blocking(move || Self::walk(base_path, tx, errors));

        rx
    }

    async fn get(&self, path: &str) -> Result<File> {
        let trimmed = normalize_key(path);
        // Same policy as the walk: links and directories are not files
        let metadata = fs::symlink_metadata(self.resolve_path(&trimmed))
            .await
            .map_err(|e| Self::not_found_or(&trimmed, e))?;

        if !metadata.file_type().is_file() {
            return Err(SyncError::NotFound(trimmed));
        }

        Ok(File {
            path: trimmed,
            last_modified: DateTime::<Utc>::from(metadata.modified()?),
            size: metadata.len(),
        })
    }

    async fn set_modified(&self, path: &str, time: DateTime<Utc>) -> Result<()> {
        let full_path = self.resolve_path(path);
        let display = normalize_key(path);

        tokio::task::spawn_blocking(move || -> Result<()> {
            // Changing times needs no write access, so read-only files work
            let mut options = std::fs::OpenOptions::new();
            options.read(true);
            #[cfg(windows)]
            {
                use std::os::windows::fs::OpenOptionsExt;
                // FILE_WRITE_ATTRIBUTES
                options.access_mode(0x100);
            }
            let file = options
                .open(&full_path)
                .map_err(|e| Self::not_found_or(&display, e))?;
            let when = SystemTime::from(time);
            file.set_times(
                std::fs::FileTimes::new()
                    .set_accessed(when)
                    .set_modified(when),
            )?;
            Ok(())
        })
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(e)))?
    }

    async fn read(&self, cancel: &CancellationToken, path: &str) -> Result<BoxedReader> {
        let file = self.get(path).await?;
        let handle = fs::File::open(self.resolve_path(&file.path))
            .await
            .map_err(|e| Self::not_found_or(&file.path, e))?;

        Ok(Box::pin(CancellableReader::new(handle, cancel.clone())))
    }

    async fn write(
        &self,
        cancel: &CancellationToken,
        path: &str,
        mut reader: BoxedReader,
    ) -> Result<()> {
        let key = normalize_key(path);

        if self.dry_run {
            debug!("dry run, discarding write to {}", key);
            drain(cancel, &key, reader).await?;
            return Ok(());
        }

        let full_path = self.resolve_path(&key);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to a sibling temp file, then rename over the target
        let temp_path = Self::temp_path(&full_path);
        let mut out = fs::File::create(&temp_path).await?;

        let copied = tokio::select! {
            _ = cancel.cancelled() => None,
            res = async {
                let n = tokio::io::copy(&mut reader, &mut out).await?;
                out.flush().await?;
                Ok::<_, std::io::Error>(n)
            } => Some(res),
        };
        drop(out);

        match copied {
            Some(Ok(_)) => {
                fs::rename(&temp_path, &full_path).await?;
                Ok(())
            }
            Some(Err(e)) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(SyncError::transfer(key, e))
            }
            None => {
                let _ = fs::remove_file(&temp_path).await;
                Err(SyncError::Cancelled)
            }
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }

        let key = normalize_key(path);
        fs::remove_file(self.resolve_path(&key))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => SyncError::NotFound(key.clone()),
                _ => SyncError::delete(&key, e),
            })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio::io::AsyncReadExt;

    async fn collect(storage: &LocalFileStorage) -> (Vec<File>, Vec<SyncError>) {
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        let mut rx = storage.list(err_tx);
        let mut files = Vec::new();
        while let Some(file) = rx.recv().await {
            files.push(file);
        }
        let mut errors = Vec::new();
        while let Ok(e) = err_rx.try_recv() {
            errors.push(e);
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        (files, errors)
    }

    fn reader(data: &[u8]) -> BoxedReader {
        Box::pin(std::io::Cursor::new(data.to_vec()))
    }

    #[tokio::test]
    async fn test_list_reports_relative_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested/deeper")).unwrap();
        std::fs::write(dir.path().join("top.txt"), b"top").unwrap();
        std::fs::write(dir.path().join("nested/deeper/leaf.bin"), b"leaf!").unwrap();

        let storage = LocalFileStorage::new(dir.path(), false);
        let (files, errors) = collect(&storage).await;

        assert!(errors.is_empty());
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["nested/deeper/leaf.bin", "top.txt"]);
        assert_eq!(files[0].size, 5);
    }

    #[tokio::test]
    async fn test_list_missing_root_reports_walk_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFileStorage::new(dir.path().join("missing"), false);

        let (files, errors) = collect(&storage).await;

        assert!(files.is_empty());
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], SyncError::Walk { .. }));
    }

    #[tokio::test]
    async fn test_get_strips_leading_slash_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
        let storage = LocalFileStorage::new(dir.path(), false);

        let file = storage.get("/a.txt").await.unwrap();
        assert_eq!(file.path, "a.txt");
        assert_eq!(file.size, 3);

        let err = storage.get("b.txt").await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(ref p) if p == "b.txt"));
    }

    #[tokio::test]
    async fn test_set_modified_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
        let storage = LocalFileStorage::new(dir.path(), false);
        let when = Utc.with_ymd_and_hms(2020, 5, 17, 12, 30, 0).unwrap();

        storage.set_modified("a.txt", when).await.unwrap();

        assert_eq!(storage.get("a.txt").await.unwrap().last_modified, when);
        assert!(storage.set_modified("nope.txt", when).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_set_modified_on_read_only_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.txt");
        std::fs::write(&path, b"abc").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&path, perms).unwrap();

        let storage = LocalFileStorage::new(dir.path(), false);
        let when = Utc.with_ymd_and_hms(2021, 1, 2, 3, 4, 5).unwrap();
        storage.set_modified("locked.txt", when).await.unwrap();

        assert_eq!(storage.get("locked.txt").await.unwrap().last_modified, when);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_is_not_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("target.txt"), b"abc").unwrap();
        std::os::unix::fs::symlink(outside.path().join("target.txt"), dir.path().join("link.txt"))
            .unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let storage = LocalFileStorage::new(dir.path(), false);

        let (files, _) = collect(&storage).await;
        assert!(files.is_empty());
        assert!(matches!(
            storage.get("link.txt").await,
            Err(SyncError::NotFound(ref p)) if p == "link.txt"
        ));
        assert!(matches!(storage.get("sub").await, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFileStorage::new(dir.path(), false);
        let cancel = CancellationToken::new();

        storage
            .write(&cancel, "sub/hello.txt", reader(b"Hello world!"))
            .await
            .unwrap();

        let mut data = Vec::new();
        storage
            .read(&cancel, "sub/hello.txt")
            .await
            .unwrap()
            .read_to_end(&mut data)
            .await
            .unwrap();
        assert_eq!(data, b"Hello world!");

        let (files, _) = collect(&storage).await;
        assert_eq!(files.len(), 1, "temp file must not survive the rename");
    }

    #[tokio::test]
    async fn test_dry_run_does_not_persist() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"x").unwrap();
        let storage = LocalFileStorage::new(dir.path(), true);
        let cancel = CancellationToken::new();

        storage.write(&cancel, "new.txt", reader(b"data")).await.unwrap();
        storage.delete("keep.txt").await.unwrap();

        assert!(!dir.path().join("new.txt").exists());
        assert!(dir.path().join("keep.txt").exists());
    }

    #[tokio::test]
    async fn test_delete_removes_file_under_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gone.txt"), b"x").unwrap();
        let storage = LocalFileStorage::new(dir.path(), false);

        storage.delete("/gone.txt").await.unwrap();

        assert!(!dir.path().join("gone.txt").exists());
        assert!(matches!(
            storage.delete("gone.txt").await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_read_fails_after_cancel() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
        let storage = LocalFileStorage::new(dir.path(), false);
        let cancel = CancellationToken::new();

        let mut r = storage.read(&cancel, "a.txt").await.unwrap();
        cancel.cancel();

        let mut buf = Vec::new();
        assert!(r.read_to_end(&mut buf).await.is_err());
    }
}
