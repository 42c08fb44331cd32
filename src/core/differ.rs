use crate::core::task::Task;
use crate::storage::{ErrorSender, FileStorage, ObjectStorage, ObjectStorageObject};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Tasks are handed over one at a time so the differ never runs far ahead
/// of the workers.
pub const TASK_CHANNEL_CAPACITY: usize = 1;

/// Decides which uploads and deletes bring the remote side up to date.
///
/// Runs in two phases on a single producer: the remote listing is fully
/// consumed before any local file is compared, so a path is never both
/// deleted and uploaded in one run.
#[derive(Clone)]
pub struct Differ {
    file_storage: Arc<dyn FileStorage>,
    object_storage: Arc<dyn ObjectStorage>,
}

impl Differ {
    pub fn new(file_storage: Arc<dyn FileStorage>, object_storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            file_storage,
            object_storage,
        }
    }

    /// Starts the differ in the background. The returned channel closes once
    /// every task has been emitted, on cancellation, or when the receiver is
    /// dropped.
    pub fn spawn(
        self,
        cancel: CancellationToken,
        remove_deleted: bool,
        errors: ErrorSender,
    ) -> (mpsc::Receiver<Task>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(TASK_CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move {
            self.run(&cancel, remove_deleted, tx, errors).await;
        });
        (rx, handle)
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        remove_deleted: bool,
        tasks: mpsc::Sender<Task>,
        errors: ErrorSender,
    ) {
        let Some((remote, deleted)) = self
            .scan_remote(cancel, remove_deleted, &tasks, errors.clone())
            .await
        else {
            return;
        };
        debug!(
            "remote scan done: {} objects, {} to delete",
            remote.len(),
            deleted.len()
        );

        self.scan_local(cancel, &remote, &deleted, &tasks, errors).await;
    }

    /// Phase one. Returns `None` when the run was abandoned.
    async fn scan_remote(
        &self,
        cancel: &CancellationToken,
        remove_deleted: bool,
        tasks: &mpsc::Sender<Task>,
        errors: ErrorSender,
    ) -> Option<(HashMap<String, ObjectStorageObject>, HashSet<String>)> {
        let mut remote = HashMap::new();
        let mut deleted = HashSet::new();
        let mut objects = self.object_storage.list(errors);

        while let Some(object) = next(cancel, &mut objects).await? {
            // Any failure to stat the local entry counts as "gone"
            if remove_deleted && self.file_storage.get(&object.key).await.is_err() {
                deleted.insert(object.key.clone());
                emit(cancel, tasks, Task::delete(object.key.clone())).await?;
            }
            remote.insert(object.key.clone(), object);
        }

        Some((remote, deleted))
    }

    /// Phase two.
    async fn scan_local(
        &self,
        cancel: &CancellationToken,
        remote: &HashMap<String, ObjectStorageObject>,
        deleted: &HashSet<String>,
        tasks: &mpsc::Sender<Task>,
        errors: ErrorSender,
    ) -> Option<()> {
        let mut files = self.file_storage.list(errors);

        while let Some(file) = next(cancel, &mut files).await? {
            if deleted.contains(&file.path) {
                continue;
            }

            let changed = match remote.get(&file.path) {
                None => true,
                // Remote stores whole seconds
                Some(object) => {
                    object.last_modified.timestamp() < file.last_modified.timestamp()
                        || object.size != file.size
                }
            };

            if changed {
                emit(cancel, tasks, Task::upload(file.path, file.size)).await?;
            }
        }

        Some(())
    }
}

/// Next listing entry; the outer `None` means cancelled.
async fn next<T>(cancel: &CancellationToken, rx: &mut mpsc::Receiver<T>) -> Option<Option<T>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        item = rx.recv() => Some(item),
    }
}

/// Hands a task to the executor; `None` when nobody is listening anymore.
async fn emit(cancel: &CancellationToken, tasks: &mpsc::Sender<Task>, task: Task) -> Option<()> {
    debug!("scheduling {}", task);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        sent = tasks.send(task) => sent.ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::Action;
    use crate::storage::{MemoryFileStorage, MemoryObjectStorage};
    use chrono::{Duration, TimeZone, Utc};

    async fn collect(
        local: MemoryFileStorage,
        remote: MemoryObjectStorage,
        remove_deleted: bool,
    ) -> Vec<Task> {
        let (err_tx, _err_rx) = mpsc::unbounded_channel();
        let differ = Differ::new(Arc::new(local), Arc::new(remote));
        let (mut rx, handle) = differ.spawn(CancellationToken::new(), remove_deleted, err_tx);

        let mut tasks = Vec::new();
        while let Some(task) = rx.recv().await {
            tasks.push(task);
        }
        handle.await.unwrap();
        tasks.sort_by(|a, b| a.file.cmp(&b.file));
        tasks
    }

    #[tokio::test]
    async fn test_mixed_tree() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let local = MemoryFileStorage::new();
        let remote = MemoryObjectStorage::new();

        local.insert("same.txt", b"abc".to_vec(), t);
        remote.insert("same.txt", b"abc".to_vec(), "text/plain", t);
        local.insert("newer.txt", b"abc".to_vec(), t + Duration::seconds(5));
        remote.insert("newer.txt", b"abc".to_vec(), "text/plain", t);
        local.insert("resized.txt", b"abcd".to_vec(), t);
        remote.insert("resized.txt", b"abc".to_vec(), "text/plain", t);
        local.insert("dir/added.txt", b"x".to_vec(), t);
        remote.insert("gone.txt", b"x".to_vec(), "text/plain", t);

        let tasks = collect(local, remote, true).await;
        assert_eq!(
            tasks,
            vec![
                Task::upload("dir/added.txt", 1),
                Task::delete("gone.txt"),
                Task::upload("newer.txt", 3),
                Task::upload("resized.txt", 4),
            ]
        );
    }

    #[tokio::test]
    async fn test_sub_second_difference_is_ignored() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let local = MemoryFileStorage::new();
        let remote = MemoryObjectStorage::new();

        local.insert("a.txt", b"abc".to_vec(), t + Duration::milliseconds(700));
        remote.insert("a.txt", b"abc".to_vec(), "text/plain", t);

        assert!(collect(local, remote, false).await.is_empty());
    }

    #[tokio::test]
    async fn test_without_mirror_nothing_is_deleted() {
        let remote = MemoryObjectStorage::new();
        remote.insert("a.txt", Vec::new(), "", Utc::now());
        remote.insert("b.txt", Vec::new(), "", Utc::now());

        let tasks = collect(MemoryFileStorage::new(), remote, false).await;
        assert!(tasks.iter().all(|t| t.action != Action::Delete));
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_stops_when_cancelled() {
        let local = MemoryFileStorage::new();
        for i in 0..10 {
            local.insert(&format!("{i}.txt"), Vec::new(), Utc::now());
        }
        let (err_tx, _err_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let differ = Differ::new(Arc::new(local), Arc::new(MemoryObjectStorage::new()));
        let (mut rx, handle) = differ.spawn(cancel.clone(), false, err_tx);

        assert!(rx.recv().await.is_some());
        cancel.cancel();
        handle.await.unwrap();

        // At most the task already buffered in the channel remains
        let mut rest = 0;
        while rx.recv().await.is_some() {
            rest += 1;
        }
        assert!(rest <= TASK_CHANNEL_CAPACITY);
    }
}
