// objectbackup/src/errors.rs
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Fatal: the candidate set could not be built, so nothing is uploaded.
#[derive(Error, Debug)]
pub enum EnumerationError {
    #[error("Source directory does not exist: {0}")]
    SourceMissing(PathBuf),

    #[error("Source path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid file pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Error reported by an `ObjectStoreClient`, already classified by the client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Retriable store error: {0}")]
    Retriable(String),

    #[error("Permanent store error: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Retriable(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("Digest mismatch: local {local}, remote {remote}")]
    DigestMismatch { local: String, remote: String },

    #[error("Size mismatch: local {local} bytes, remote {remote} bytes")]
    SizeMismatch { local: u64, remote: u64 },

    #[error("Object not found in store after upload")]
    MissingObject,

    #[error("Failed to digest local file: {0}")]
    LocalDigest(String),
}

/// Per-file upload failure. Recorded in the outcome, never propagated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Local file unavailable: {0}")]
    LocalFile(String),

    #[error("Integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Interrupted before the next retry")]
    Interrupted,

    #[error("Upload task failed: {0}")]
    TaskFailed(String),
}

impl UploadError {
    /// Whether another attempt may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            UploadError::Store(e) => e.is_retriable(),
            UploadError::Timeout(_) => true,
            UploadError::Integrity(_) => true,
            UploadError::LocalFile(_) | UploadError::Interrupted | UploadError::TaskFailed(_) => {
                false
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeletionError {
    #[error("Failed to resolve {path}: {message}")]
    Resolve { path: PathBuf, message: String },

    #[error("Failed to remove {path}: {message}")]
    Remove { path: PathBuf, message: String },
}

#[derive(Error, Debug)]
pub enum ManifestWriteError {
    #[error("Manifest I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}
