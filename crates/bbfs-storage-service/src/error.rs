use bbfs_types::errno_of;
use thiserror::Error;

/// Failure of a chunk-store operation, carrying the errno that the handler
/// reports in the RPC response's `err` field.
#[derive(Debug, Clone, Error)]
#[error("{message} (errno {errno})")]
pub struct StorageError {
    pub errno: i32,
    pub message: String,
}

impl StorageError {
    pub fn new(errno: i32, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }

    /// Wrap an I/O error, keeping its OS errno.
    pub fn from_io(context: impl Into<String>, err: &std::io::Error) -> Self {
        Self {
            errno: errno_of(err),
            message: format!("{}: {}", context.into(), err),
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
