//! Error types shared by the storages and the sync engine

use std::io;

/// Errors produced while listing, transferring or deleting entries.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Enumeration of one side failed; the listing may be incomplete.
    #[error("failed to list {side}: {message}")]
    Walk { side: &'static str, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transfer of {path} failed: {source}")]
    Transfer {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("delete of {path} failed: {message}")]
    Delete { path: String, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("storage backend error: {0}")]
    Backend(#[from] opendal::Error),

    #[error("one or more errors happened while processing your sync ({} errors)", .0.len())]
    Aggregate(Vec<SyncError>),
}

impl SyncError {
    pub fn walk(side: &'static str, err: impl std::fmt::Display) -> Self {
        SyncError::Walk {
            side,
            message: err.to_string(),
        }
    }

    pub fn transfer(path: impl Into<String>, source: io::Error) -> Self {
        // A reader aborted by the cancellation token surfaces as Cancelled,
        // not as a transfer failure.
        if source.kind() == io::ErrorKind::Interrupted {
            return SyncError::Cancelled;
        }
        SyncError::Transfer {
            path: path.into(),
            source,
        }
    }

    pub fn delete(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        SyncError::Delete {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// Individual errors of an aggregated failure; a single error otherwise.
    pub fn errors(&self) -> &[SyncError] {
        match self {
            SyncError::Aggregate(errors) => errors,
            other => std::slice::from_ref(other),
        }
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_message_counts_errors() {
        let err = SyncError::Aggregate(vec![
            SyncError::NotFound("a.txt".into()),
            SyncError::delete("b.txt", "denied"),
        ]);

        assert_eq!(
            err.to_string(),
            "one or more errors happened while processing your sync (2 errors)"
        );
        assert_eq!(err.errors().len(), 2);
    }

    #[test]
    fn test_interrupted_transfer_is_cancellation() {
        let err = SyncError::transfer("a.txt", io::Error::new(io::ErrorKind::Interrupted, "x"));
        assert!(err.is_cancelled());

        let err = SyncError::transfer("a.txt", io::Error::new(io::ErrorKind::BrokenPipe, "x"));
        assert!(matches!(err, SyncError::Transfer { .. }));
    }
}
