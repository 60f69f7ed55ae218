// objectbackup/src/backup/store.rs
use async_trait::async_trait;
use std::path::Path;

use crate::errors::StoreError;

/// What `head_object` reports for an existing object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub size: u64,
    pub digest: String,
}

/// The only store surface the pipeline needs. Implementations classify their
/// own errors as retriable or permanent and must be safe to share between
/// upload workers.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Uploads `local_path` to `bucket/key`, returning the store's digest.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
    ) -> Result<String, StoreError>;

    /// `Ok(None)` when the object does not exist.
    async fn head_object(&self, bucket: &str, key: &str)
    -> Result<Option<ObjectHead>, StoreError>;
}

#[cfg(test)]
pub use memory::{MemoryStore, ScriptedPut};
