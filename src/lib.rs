//! One-way synchronization of a local directory into an object store.
//!
//! A [`SyncEngine`] compares a [`FileStorage`] against an [`ObjectStorage`],
//! uploads what is new or changed, optionally deletes what vanished locally,
//! and reports each task through a [`ui::Ui`].

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;
pub mod ui;

pub use config::{RemoteConfig, SyncConfig};
pub use core::{detect_content_type, Action, SyncEngine, Task};
pub use error::{Result, SyncError};
pub use storage::{
    File, FileStorage, LocalFileStorage, MemoryFileStorage, MemoryObjectStorage, ObjectStorage,
    ObjectStorageObject, S3ObjectStorage,
};
pub use ui::{
    FileUi, LoggingUiFactory, MemoryTaskLogger, ProgressUiFactory, TaskLogger, TracingTaskLogger,
    Ui, UiFactory,
};
