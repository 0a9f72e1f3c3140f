//! Storage error types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by credential backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file io error at {path}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{backend} did not answer within {after:?}")]
    Timeout { backend: String, after: Duration },

    #[error("invalid instance id: {0:?}")]
    InvalidInstanceId(String),

    #[error("corrupt record for {instance_id}: {reason}")]
    Corrupt { instance_id: String, reason: String },

    #[error("every storage tier failed")]
    AllTiersFailed,
}

impl StorageError {
    pub fn file_io(path: &Path, source: std::io::Error) -> Self {
        Self::FileIo {
            path: path.to_path_buf(),
            source,
        }
    }
}
