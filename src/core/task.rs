use serde::{Deserialize, Serialize};
use std::fmt;

/// What a task does to its path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Upload,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Upload => f.write_str("UPLOAD"),
            Action::Delete => f.write_str("DELETE"),
        }
    }
}

/// One unit of work produced by the differ and consumed by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Task {
    /// Path relative to the source root, identical to the remote key
    pub file: String,
    pub action: Action,
    /// Byte count shown by the UI; zero for deletes
    pub size: u64,
}

impl Task {
    pub fn upload(file: impl Into<String>, size: u64) -> Self {
        Self {
            file: file.into(),
            action: Action::Upload,
            size,
        }
    }

    pub fn delete(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            action: Action::Delete,
            size: 0,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.file)
    }
}
