// objectbackup/src/backup/upload.rs
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backup::enumerate::FileEntry;
use crate::backup::integrity::IntegrityChecker;
use crate::backup::store::ObjectStoreClient;
use crate::config::RetryPolicy;
use crate::errors::{IntegrityError, UploadError};
use crate::utils::logger::{EventOutcome, LogEvent, Logger, Phase};

/// Re-uploads granted after a failed verification before giving up.
const MAX_INTEGRITY_REUPLOADS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Succeeded,
    Failed,
    SkippedDryRun,
}

/// Result of one file's upload. Produced once, never mutated.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub entry: FileEntry,
    pub status: UploadStatus,
    /// `put_object` calls actually made.
    pub attempts: u32,
    pub error: Option<UploadError>,
    pub remote_digest: Option<String>,
}

impl UploadOutcome {
    fn succeeded(entry: &FileEntry, attempts: u32, remote_digest: String) -> Self {
        UploadOutcome {
            entry: entry.clone(),
            status: UploadStatus::Succeeded,
            attempts,
            error: None,
            remote_digest: Some(remote_digest),
        }
    }

    pub(crate) fn failed(entry: &FileEntry, attempts: u32, error: UploadError) -> Self {
        UploadOutcome {
            entry: entry.clone(),
            status: UploadStatus::Failed,
            attempts,
            error: Some(error),
            remote_digest: None,
        }
    }

    fn skipped(entry: &FileEntry) -> Self {
        UploadOutcome {
            entry: entry.clone(),
            status: UploadStatus::SkippedDryRun,
            attempts: 0,
            error: None,
            remote_digest: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == UploadStatus::Succeeded
    }
}

/// Uploads single files with bounded retry, per-attempt timeout and
/// post-upload verification.
pub struct UploadExecutor {
    store: Arc<dyn ObjectStoreClient>,
    checker: IntegrityChecker,
    logger: Arc<dyn Logger>,
    bucket: String,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    cancel: CancellationToken,
}

impl UploadExecutor {
    pub fn new(
        store: Arc<dyn ObjectStoreClient>,
        checker: IntegrityChecker,
        logger: Arc<dyn Logger>,
        bucket: impl Into<String>,
        retry: RetryPolicy,
        attempt_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        UploadExecutor {
            store,
            checker,
            logger,
            bucket: bucket.into(),
            retry,
            attempt_timeout,
            cancel,
        }
    }

    pub async fn upload(&self, entry: &FileEntry, dry_run: bool) -> UploadOutcome {
        if dry_run {
            return match tokio::fs::File::open(&entry.path).await {
                Ok(_) => {
                    self.logger.event(
                        LogEvent::new(Phase::Upload, EventOutcome::Skipped)
                            .path(&entry.path)
                            .detail(format!("dry-run: would upload to {}", entry.key)),
                    );
                    UploadOutcome::skipped(entry)
                }
                Err(e) => self.fail(entry, 0, UploadError::LocalFile(e.to_string())),
            };
        }

        let max_attempts = self.retry.max_retries.saturating_add(1);
        let mut attempts = 0u32;
        let mut integrity_failures = 0u32;
        let mut local_digest: Option<String> = None;

        loop {
            let local_size = match tokio::fs::metadata(&entry.path).await {
                Ok(meta) if meta.is_file() => meta.len(),
                Ok(_) => {
                    let err = UploadError::LocalFile("no longer a regular file".to_string());
                    return self.fail(entry, attempts, err);
                }
                Err(e) => return self.fail(entry, attempts, UploadError::LocalFile(e.to_string())),
            };

            let digest = match local_digest.take() {
                Some(digest) => digest,
                None => match self.local_digest(entry.path.clone()).await {
                    Ok(digest) => digest,
                    Err(e) => {
                        return self.fail(entry, attempts, UploadError::LocalFile(e.to_string()));
                    }
                },
            };

            attempts += 1;
            let error = match self.attempt(entry, &digest, local_size).await {
                Ok(remote_digest) => {
                    self.logger.event(
                        LogEvent::new(Phase::Upload, EventOutcome::Succeeded)
                            .path(&entry.path)
                            .detail(format!(
                                "{} -> s3://{}/{} after {} attempt(s)",
                                remote_digest, self.bucket, entry.key, attempts
                            )),
                    );
                    return UploadOutcome::succeeded(entry, attempts, remote_digest);
                }
                Err(error) => error,
            };

            let exhausted = if let UploadError::Integrity(_) = &error {
                integrity_failures += 1;
                self.logger.event(
                    LogEvent::new(Phase::Verify, EventOutcome::Failed)
                        .path(&entry.path)
                        .detail(error.to_string()),
                );
                // the file may have changed; digest it again before re-uploading
                integrity_failures > MAX_INTEGRITY_REUPLOADS
            } else {
                local_digest = Some(digest);
                attempts >= max_attempts
            };

            if !error.is_retriable() || exhausted {
                return self.fail(entry, attempts, error);
            }

            let delay = self.retry.delay_for(attempts);
            self.logger.event(
                LogEvent::new(Phase::Upload, EventOutcome::Retrying)
                    .path(&entry.path)
                    .detail(format!(
                        "attempt {} failed: {}; retrying in {:?}",
                        attempts, error, delay
                    )),
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return self.fail(entry, attempts, UploadError::Interrupted);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One network attempt: PUT, then HEAD, then verify. Each call is bounded
    /// by the attempt timeout.
    async fn attempt(
        &self,
        entry: &FileEntry,
        local_digest: &str,
        local_size: u64,
    ) -> Result<String, UploadError> {
        let put_digest = tokio::time::timeout(
            self.attempt_timeout,
            self.store.put_object(&self.bucket, &entry.key, &entry.path),
        )
        .await
        .map_err(|_| UploadError::Timeout(self.attempt_timeout))??;

        let head = tokio::time::timeout(
            self.attempt_timeout,
            self.store.head_object(&self.bucket, &entry.key),
        )
        .await
        .map_err(|_| UploadError::Timeout(self.attempt_timeout))??;

        self.checker
            .verify_upload(local_digest, local_size, &put_digest, head.as_ref())?;

        Ok(put_digest.trim().trim_matches('"').to_string())
    }

    async fn local_digest(&self, path: PathBuf) -> Result<String, IntegrityError> {
        let checker = self.checker.clone();
        tokio::task::spawn_blocking(move || checker.digest(&path))
            .await
            .map_err(|e| IntegrityError::LocalDigest(e.to_string()))?
    }

    fn fail(&self, entry: &FileEntry, attempts: u32, error: UploadError) -> UploadOutcome {
        self.logger.event(
            LogEvent::new(Phase::Upload, EventOutcome::Failed)
                .path(&entry.path)
                .detail(format!("{} (attempts: {})", error, attempts)),
        );
        UploadOutcome::failed(entry, attempts, error)
    }
}
