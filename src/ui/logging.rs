use super::{FileUi, TaskLogger, Ui, UiFactory};
use crate::core::task::Task;
use crate::storage::BoxedReader;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// UI without output that hands every task to a [`TaskLogger`].
#[derive(Clone)]
pub struct LoggingUiFactory {
    logger: Arc<dyn TaskLogger>,
}

impl LoggingUiFactory {
    pub fn new(logger: Arc<dyn TaskLogger>) -> Self {
        Self { logger }
    }
}

impl UiFactory for LoggingUiFactory {
    fn make(&self, _tasks: TaskTracker, _cancel: CancellationToken) -> Arc<dyn Ui> {
        Arc::new(LoggingUi {
            logger: self.logger.clone(),
        })
    }
}

pub struct LoggingUi {
    logger: Arc<dyn TaskLogger>,
}

impl Ui for LoggingUi {
    fn add_task(&self, task: &Task) -> Box<dyn FileUi> {
        self.logger.log(task);
        Box::new(PassThrough)
    }
}

struct PassThrough;

impl FileUi for PassThrough {
    fn get_reader(&self, reader: BoxedReader) -> BoxedReader {
        reader
    }

    fn on_complete(&self) {}

    fn on_error(&self) {}
}

/// Keeps every logged task in memory, in arrival order.
#[derive(Clone, Default)]
pub struct MemoryTaskLogger {
    tasks: Arc<Mutex<Vec<Task>>>,
}

impl MemoryTaskLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks
            .lock()
            .map(|tasks| tasks.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl TaskLogger for MemoryTaskLogger {
    fn log(&self, task: &Task) {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task.clone());
    }
}

/// Emits one `info` event per task.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTaskLogger;

impl TaskLogger for TracingTaskLogger {
    fn log(&self, task: &Task) {
        tracing::info!(action = %task.action, file = %task.file, size = task.size, "task scheduled");
    }
}
