//! Progress reporting seams between the engine and whatever renders it

pub mod logging;
pub mod progress;

use crate::core::task::Task;
use crate::storage::BoxedReader;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub use logging::{LoggingUi, LoggingUiFactory, MemoryTaskLogger, TracingTaskLogger};
pub use progress::{ProgressUi, ProgressUiFactory};

/// Creates one [`Ui`] per `synchronize` call.
pub trait UiFactory: Send + Sync {
    /// `tasks` tracks every worker of the run and is closed once no more
    /// will be spawned; `cancel` is the run's token.
    fn make(&self, tasks: TaskTracker, cancel: CancellationToken) -> Arc<dyn Ui>;
}

pub trait Ui: Send + Sync {
    /// Registers a task that is about to run.
    fn add_task(&self, task: &Task) -> Box<dyn FileUi>;
}

/// Per-task progress handle.
pub trait FileUi: Send + Sync {
    /// Wraps the upload stream so bytes read are counted.
    fn get_reader(&self, reader: BoxedReader) -> BoxedReader;

    fn on_complete(&self);

    fn on_error(&self);
}

/// Records scheduled tasks.
pub trait TaskLogger: Send + Sync {
    fn log(&self, task: &Task);
}
