use crate::core::sniff::{detect_content_type, SNIFF_LEN};
use crate::core::task::{Action, Task};
use crate::error::{Result, SyncError};
use crate::storage::{BoxedReader, ErrorSender, FileStorage, ObjectStorage};
use crate::ui::{FileUi, Ui};
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Runs tasks with at most `concurrency` of them touching storage at once.
pub struct Executor {
    file_storage: Arc<dyn FileStorage>,
    object_storage: Arc<dyn ObjectStorage>,
    semaphore: Arc<Semaphore>,
}

impl Executor {
    pub fn new(
        file_storage: Arc<dyn FileStorage>,
        object_storage: Arc<dyn ObjectStorage>,
        concurrency: usize,
    ) -> Self {
        Self {
            file_storage,
            object_storage,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Drains `tasks`, spawning one worker per task on `tracker`.
    ///
    /// Returns the number of tasks dispatched once the channel is closed or
    /// the run is cancelled. Workers may still be running; wait on the
    /// tracker for quiescence.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        mut tasks: mpsc::Receiver<Task>,
        ui: &dyn Ui,
        tracker: &TaskTracker,
        errors: ErrorSender,
    ) -> usize {
        let mut dispatched = 0;

        loop {
            let task = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                task = tasks.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            // The permit is taken before the worker exists and released when
            // it finishes, so it also bounds the number of live workers.
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let file_ui = ui.add_task(&task);
            let worker = Worker {
                file_storage: self.file_storage.clone(),
                object_storage: self.object_storage.clone(),
                cancel: cancel.clone(),
                errors: errors.clone(),
            };
            tracker.spawn(worker.process(task, file_ui, permit));
            dispatched += 1;
        }

        dispatched
    }
}

struct Worker {
    file_storage: Arc<dyn FileStorage>,
    object_storage: Arc<dyn ObjectStorage>,
    cancel: CancellationToken,
    errors: ErrorSender,
}

impl Worker {
    async fn process(self, task: Task, file_ui: Box<dyn FileUi>, _permit: OwnedSemaphorePermit) {
        let result = match task.action {
            Action::Delete => self.delete(&task.file).await,
            Action::Upload => self.upload(&task.file, file_ui.as_ref()).await,
        };

        match result {
            Ok(()) => {
                debug!("{} done", task);
                file_ui.on_complete();
            }
            Err(e) => {
                if !e.is_cancelled() {
                    warn!("{} failed: {}", task, e);
                }
                file_ui.on_error();
                let _ = self.errors.send(e);
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            res = self.object_storage.delete(key) => res,
        }
    }

    async fn upload(&self, path: &str, file_ui: &dyn FileUi) -> Result<()> {
        let file = self.file_storage.get(path).await?;
        let mut reader = self.file_storage.read(&self.cancel, path).await?;

        // Sniff from the same stream and put the bytes back in front of it
        let sniff_len = file.size.min(SNIFF_LEN as u64);
        let mut head = Vec::with_capacity(sniff_len as usize);
        (&mut reader)
            .take(sniff_len)
            .read_to_end(&mut head)
            .await
            .map_err(|e| SyncError::transfer(path, e))?;
        let content_type = detect_content_type(&head);
        debug!("uploading {} ({} bytes, {})", path, file.size, content_type);

        let reader: BoxedReader = Box::pin(Cursor::new(head).chain(reader));
        let reader = file_ui.get_reader(reader);

        tokio::select! {
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            res = self.object_storage.upload(&self.cancel, path, reader, file.size, content_type) => res,
        }
    }
}
