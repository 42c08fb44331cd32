use crate::core::differ::Differ;
use crate::core::executor::Executor;
use crate::error::{Result, SyncError};
use crate::storage::{FileStorage, ObjectStorage};
use crate::ui::UiFactory;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

/// Synchronizes a file storage into an object storage.
pub struct SyncEngine {
    ui_factory: Arc<dyn UiFactory>,
    object_storage: Arc<dyn ObjectStorage>,
    file_storage: Arc<dyn FileStorage>,
    concurrency: usize,
}

impl SyncEngine {
    /// `concurrency` below 1 is treated as 1.
    pub fn new(
        ui_factory: Arc<dyn UiFactory>,
        object_storage: Arc<dyn ObjectStorage>,
        file_storage: Arc<dyn FileStorage>,
        concurrency: usize,
    ) -> Self {
        Self {
            ui_factory,
            object_storage,
            file_storage,
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Brings the object storage up to date with the file storage.
    ///
    /// Uploads new and changed files and, with `remove_deleted`, deletes
    /// objects that no longer exist locally. Every scheduled task is
    /// attempted even when others fail; per-task errors are logged and
    /// returned together as [`SyncError::Aggregate`]. Cancelling the token
    /// stops scheduling, aborts in-flight transfers and returns
    /// [`SyncError::Cancelled`] once all workers have unwound.
    pub async fn synchronize(&self, cancel: &CancellationToken, remove_deleted: bool) -> Result<()> {
        let started = Instant::now();
        info!(
            "synchronizing {} -> {} (concurrency {}, remove deleted: {})",
            self.file_storage.name(),
            self.object_storage.name(),
            self.concurrency,
            remove_deleted
        );

        let tracker = TaskTracker::new();
        let ui = self.ui_factory.make(tracker.clone(), cancel.clone());
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();

        let differ = Differ::new(self.file_storage.clone(), self.object_storage.clone());
        let (tasks, differ_handle) = differ.spawn(cancel.clone(), remove_deleted, err_tx.clone());

        let executor = Executor::new(
            self.file_storage.clone(),
            self.object_storage.clone(),
            self.concurrency,
        );
        let dispatched = executor
            .run(cancel, tasks, ui.as_ref(), &tracker, err_tx.clone())
            .await;

        // The task receiver is gone, so the differ can only be finishing
        if let Err(e) = differ_handle.await {
            error!("differ task failed: {}", e);
            let _ = err_tx.send(SyncError::walk("sync plan", e));
        }

        tracker.close();
        tracker.wait().await;
        drop(err_tx);

        let mut errors = Vec::new();
        while let Ok(e) = err_rx.try_recv() {
            if !e.is_cancelled() {
                error!("{}", e);
            }
            errors.push(e);
        }

        info!(
            "sync finished in {:.2?}: {} tasks, {} errors",
            started.elapsed(),
            dispatched,
            errors.len()
        );

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Aggregate(errors))
        }
    }
}
