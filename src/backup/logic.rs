// objectbackup/src/backup/logic.rs
//! Run orchestration: enumerate, upload, delete, report.
//!
//! A [`BackupOrchestrator`] is single-use. [`BackupOrchestrator::run`]
//! consumes it and always returns a [`PipelineResult`]; fatal problems end
//! up in `fatal_error` instead of an `Err`.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::backup::deletion::{DeletionGuard, DeletionOutcome, DeletionReason, DeletionStatus};
use crate::backup::enumerate::{FileEntry, FileEnumerator};
use crate::backup::integrity::{IntegrityChecker, Md5Etag};
use crate::backup::manifest::{JsonLinesManifest, ManifestSink};
use crate::backup::metrics::{MetricsRecorder, PipelineResult};
use crate::backup::store::ObjectStoreClient;
use crate::backup::upload::{UploadExecutor, UploadOutcome};
use crate::config::BackupConfig;
use crate::errors::{DeletionError, UploadError};
use crate::utils::logger::{EventOutcome, LogEvent, Logger, Phase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Initialized,
    Enumerating,
    Uploading,
    Deleting,
    Finalized,
}

pub struct BackupOrchestrator {
    config: BackupConfig,
    store: Arc<dyn ObjectStoreClient>,
    logger: Arc<dyn Logger>,
    checker: IntegrityChecker,
    manifest: Option<Arc<dyn ManifestSink>>,
    cancel: CancellationToken,
    state: RunState,
}

impl BackupOrchestrator {
    /// Uses S3 ETag digests sized to `config.multipart_threshold`, and a
    /// JSON-lines manifest when `config.manifest_dir` is set.
    pub fn new(
        config: BackupConfig,
        store: Arc<dyn ObjectStoreClient>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        let checker = IntegrityChecker::new(Arc::new(Md5Etag::new(config.multipart_threshold)));
        let manifest = config
            .manifest_dir
            .clone()
            .map(|dir| Arc::new(JsonLinesManifest::new(dir)) as Arc<dyn ManifestSink>);
        BackupOrchestrator {
            config,
            store,
            logger,
            checker,
            manifest,
            cancel: CancellationToken::new(),
            state: RunState::Initialized,
        }
    }

    pub fn with_integrity_checker(mut self, checker: IntegrityChecker) -> Self {
        self.checker = checker;
        self
    }

    pub fn with_manifest_sink(mut self, sink: Arc<dyn ManifestSink>) -> Self {
        self.manifest = Some(sink);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancelling this token stops dispatching new uploads and deletions.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        self.logger.event(
            LogEvent::new(Phase::Run, EventOutcome::Info)
                .detail(format!("state {:?} -> {:?}", self.state, next)),
        );
        self.state = next;
    }

    pub async fn run(mut self) -> PipelineResult {
        let metrics = Arc::new(MetricsRecorder::new(self.config.dry_run));
        self.logger.event(
            LogEvent::new(Phase::Run, EventOutcome::Started)
                .path(&self.config.source_dir)
                .detail(format!(
                    "run {} -> s3://{}/{} ({} digests){}",
                    metrics.run_id(),
                    self.config.bucket,
                    self.config.key_prefix,
                    self.checker.strategy_name(),
                    if self.config.dry_run { " (dry-run)" } else { "" }
                )),
        );

        self.transition(RunState::Enumerating);
        let entries = match self.enumerate().await {
            Ok(entries) => entries,
            Err(message) => {
                self.logger.event(
                    LogEvent::new(Phase::Enumerate, EventOutcome::Failed)
                        .path(&self.config.source_dir)
                        .detail(message.clone()),
                );
                self.transition(RunState::Finalized);
                return self.finish(&metrics, None, Some(message));
            }
        };
        metrics.set_total(entries.len());
        self.logger.event(
            LogEvent::new(Phase::Enumerate, EventOutcome::Succeeded)
                .path(&self.config.source_dir)
                .detail(format!("{} file(s) selected", entries.len())),
        );

        self.transition(RunState::Uploading);
        let outcomes = self.upload_all(entries, &metrics).await;

        self.transition(RunState::Deleting);
        self.delete_all(outcomes, &metrics).await;

        let manifest = self.write_manifest(&metrics);
        self.transition(RunState::Finalized);
        self.finish(&metrics, manifest, None)
    }

    async fn enumerate(&self) -> Result<Vec<FileEntry>, String> {
        let enumerator = FileEnumerator::new(
            &self.config.include_patterns,
            &self.config.exclude_patterns,
            &self.config.key_prefix,
        )
        .map_err(|e| e.to_string())?;
        let source_dir = self.config.source_dir.clone();

        tokio::task::spawn_blocking(move || enumerator.enumerate(&source_dir))
            .await
            .map_err(|e| format!("Enumeration task failed: {}", e))?
            .map_err(|e| e.to_string())
    }

    async fn upload_all(
        &self,
        entries: Vec<FileEntry>,
        metrics: &MetricsRecorder,
    ) -> Vec<UploadOutcome> {
        let executor = Arc::new(UploadExecutor::new(
            self.store.clone(),
            self.checker.clone(),
            self.logger.clone(),
            self.config.bucket.clone(),
            self.config.retry.clone(),
            self.config.attempt_timeout,
            self.cancel.clone(),
        ));
        let semaphore = Arc::new(Semaphore::new(self.config.upload_workers.max(1)));
        let dry_run = self.config.dry_run;

        let mut tasks = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let executor = executor.clone();
            let task_entry = entry.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                executor.upload(&task_entry, dry_run).await
            });
            tasks.push((index, entry, handle));
        }

        if self.cancel.is_cancelled() {
            self.logger.event(
                LogEvent::new(Phase::Upload, EventOutcome::Info)
                    .detail(format!("cancelled after dispatching {} file(s)", tasks.len())),
            );
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (index, entry, handle) in tasks {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let error = UploadError::TaskFailed(e.to_string());
                    self.logger.event(
                        LogEvent::new(Phase::Upload, EventOutcome::Failed)
                            .path(&entry.path)
                            .detail(error.to_string()),
                    );
                    UploadOutcome::failed(&entry, 0, error)
                }
            };
            metrics.record_upload(index, outcome.clone());
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn delete_all(&self, outcomes: Vec<UploadOutcome>, metrics: &MetricsRecorder) {
        if !self.config.delete_after_upload || self.config.dry_run {
            self.logger.event(LogEvent::new(Phase::Delete, EventOutcome::Skipped).detail(
                if self.config.dry_run {
                    "dry-run: local files are kept"
                } else {
                    "deletion after upload is disabled"
                },
            ));
            return;
        }

        let guard = Arc::new(DeletionGuard::from_config(&self.config));
        let semaphore = Arc::new(Semaphore::new(self.config.deletion_workers.max(1)));

        let candidates: Vec<UploadOutcome> = outcomes
            .into_iter()
            .filter(UploadOutcome::is_success)
            .collect();
        let candidate_count = candidates.len();

        let mut tasks = Vec::with_capacity(candidate_count);
        for outcome in candidates {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let guard = guard.clone();
            let entry = outcome.entry.clone();
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                guard.delete(&outcome.entry, &outcome)
            });
            tasks.push((entry, handle));
        }

        let undispatched = candidate_count - tasks.len();
        if undispatched > 0 {
            metrics.record_deletions_not_attempted(undispatched);
            self.logger.event(
                LogEvent::new(Phase::Delete, EventOutcome::Info)
                    .detail(format!("cancelled: {} deletion(s) not attempted", undispatched)),
            );
        }

        for (entry, handle) in tasks {
            let deletion = handle.await.unwrap_or_else(|e| DeletionOutcome {
                error: Some(DeletionError::Remove {
                    path: entry.path.clone(),
                    message: format!("deletion task failed: {}", e),
                }),
                entry,
                status: DeletionStatus::Retained,
                reason: DeletionReason::FilesystemError,
                removed_dirs: 0,
            });
            self.log_deletion(&deletion);
            metrics.record_deletion(&deletion);
        }
    }

    fn log_deletion(&self, deletion: &DeletionOutcome) {
        let (outcome, detail) = match deletion.status {
            DeletionStatus::Deleted => (
                EventOutcome::Succeeded,
                format!("removed ({} empty dir(s) collapsed)", deletion.removed_dirs),
            ),
            DeletionStatus::Denied => (EventOutcome::Denied, deletion.reason.as_str().to_string()),
            DeletionStatus::Retained => (
                EventOutcome::Retained,
                deletion
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| deletion.reason.as_str().to_string()),
            ),
        };
        self.logger.event(
            LogEvent::new(Phase::Delete, outcome)
                .path(&deletion.entry.path)
                .detail(detail),
        );
    }

    fn write_manifest(&self, metrics: &MetricsRecorder) -> Option<String> {
        if self.config.dry_run {
            return None;
        }
        let sink = self.manifest.as_ref()?;
        let records = metrics.manifest_records();
        if records.is_empty() {
            return None;
        }

        match sink.write(metrics.run_id(), metrics.start_time(), &records) {
            Ok(reference) => {
                self.logger.event(
                    LogEvent::new(Phase::Manifest, EventOutcome::Succeeded)
                        .detail(format!("{} record(s) written to {}", records.len(), reference)),
                );
                Some(reference)
            }
            Err(e) => {
                self.logger.event(
                    LogEvent::new(Phase::Manifest, EventOutcome::Failed).detail(e.to_string()),
                );
                None
            }
        }
    }

    fn finish(
        &self,
        metrics: &MetricsRecorder,
        manifest: Option<String>,
        fatal_error: Option<String>,
    ) -> PipelineResult {
        let result = metrics.finalize(self.cancel.is_cancelled(), manifest, fatal_error);
        self.logger.event(
            LogEvent::new(Phase::Summary, EventOutcome::Info).detail(format!(
                "{}: {} total, {} uploaded, {} failed, {} skipped, {} not attempted, {} deleted, {:.1}% success in {:.2}s",
                result.classification.as_str(),
                result.total_files,
                result.successful_uploads,
                result.failed_uploads,
                result.skipped_dry_run,
                result.not_attempted,
                result.deleted_files,
                result.success_rate_percent,
                result.duration_seconds
            )),
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::integrity::DigestStrategy;
    use crate::backup::metrics::RunClassification;
    use crate::backup::store::{MemoryStore, ScriptedPut};
    use crate::config::RetryPolicy;
    use crate::errors::StoreError;
    use crate::utils::logger::RecordingLogger;
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn source_with(count: usize) -> anyhow::Result<TempDir> {
        let dir = TempDir::new()?;
        for i in 0..count {
            fs::write(dir.path().join(format!("f{:02}.txt", i)), format!("content {}", i))?;
        }
        Ok(dir)
    }

    fn config(source: &Path) -> BackupConfig {
        let mut config = BackupConfig::new(source, "bucket");
        config.retry = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        config.attempt_timeout = Duration::from_secs(5);
        config
    }

    fn store_for(config: &BackupConfig) -> Arc<MemoryStore> {
        let strategy: Arc<dyn DigestStrategy> = Arc::new(Md5Etag::new(config.multipart_threshold));
        Arc::new(MemoryStore::new(strategy))
    }

    async fn run(
        config: BackupConfig,
        store: &Arc<MemoryStore>,
        logger: &Arc<RecordingLogger>,
    ) -> PipelineResult {
        BackupOrchestrator::new(config, store.clone(), logger.clone())
            .run()
            .await
    }

    #[tokio::test]
    async fn test_partial_run_retries_transient_and_reports_permanent() -> anyhow::Result<()> {
        let dir = source_with(10)?;
        let config = config(dir.path());
        let store = store_for(&config);
        let logger = Arc::new(RecordingLogger::default());
        store.script(
            "f03.txt",
            [ScriptedPut::Fail(StoreError::Permanent("AccessDenied".into()))],
        );
        store.script(
            "f05.txt",
            [
                ScriptedPut::Fail(StoreError::Retriable("SlowDown".into())),
                ScriptedPut::Fail(StoreError::Retriable("503".into())),
            ],
        );

        let result = run(config, &store, &logger).await;

        assert_eq!(result.total_files, 10);
        assert_eq!(result.successful_uploads, 9);
        assert_eq!(result.failed_uploads, 1);
        assert_eq!(result.success_rate_percent, 90.0);
        assert_eq!(result.classification, RunClassification::PartialSuccess);
        assert_eq!(result.upload_errors.len(), 1);
        assert!(result.upload_errors[0].0.ends_with("f03.txt"));
        // 8 clean puts, 1 permanent, 3 for the transient file
        assert_eq!(store.put_calls(), 12);
        assert_eq!(logger.count(Phase::Upload, EventOutcome::Retrying), 2);
        assert!(result.is_consistent());
        Ok(())
    }

    #[tokio::test]
    async fn test_two_permanent_failures() -> anyhow::Result<()> {
        let dir = source_with(10)?;
        let config = config(dir.path());
        let store = store_for(&config);
        let logger = Arc::new(RecordingLogger::default());
        for key in ["f02.txt", "f07.txt"] {
            store.script(key, [ScriptedPut::Fail(StoreError::Permanent("403".into()))]);
        }

        let result = run(config, &store, &logger).await;

        assert_eq!(result.successful_uploads, 8);
        assert_eq!(result.failed_uploads, 2);
        assert_eq!(result.success_rate_percent, 80.0);
        assert_eq!(store.object_count(), 8);
        assert!(result.is_consistent());
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() -> anyhow::Result<()> {
        let dir = source_with(5)?;
        let manifests = TempDir::new()?;
        let mut config = config(dir.path());
        config.dry_run = true;
        config.delete_after_upload = true;
        config.manifest_dir = Some(manifests.path().join("out"));
        let store = store_for(&config);
        let logger = Arc::new(RecordingLogger::default());

        let result = run(config, &store, &logger).await;

        assert_eq!(store.put_calls(), 0);
        assert_eq!(store.head_calls(), 0);
        assert_eq!(result.skipped_dry_run, 5);
        assert_eq!(result.deleted_files, 0);
        assert_eq!(result.success_rate_percent, 100.0);
        assert!(result.simulated);
        assert_eq!(result.classification, RunClassification::FullSuccess);
        assert!(result.manifest.is_none());
        assert!(!manifests.path().join("out").exists());
        assert_eq!(fs::read_dir(dir.path())?.count(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_source_is_nothing_to_do() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let config = config(dir.path());
        let store = store_for(&config);
        let logger = Arc::new(RecordingLogger::default());

        let result = run(config, &store, &logger).await;

        assert_eq!(result.total_files, 0);
        assert_eq!(result.success_rate_percent, 0.0);
        assert_eq!(result.classification, RunClassification::NothingToDo);
        assert!(result.fatal_error.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_source_is_total_failure() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let config = config(&dir.path().join("missing"));
        let store = store_for(&config);
        let logger = Arc::new(RecordingLogger::default());

        let result = run(config, &store, &logger).await;

        assert_eq!(result.classification, RunClassification::TotalFailure);
        assert_eq!(result.total_files, 0);
        assert!(
            result
                .fatal_error
                .as_deref()
                .is_some_and(|m| m.contains("does not exist"))
        );
        assert_eq!(store.put_calls(), 0);
        assert_eq!(logger.count(Phase::Enumerate, EventOutcome::Failed), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_only_successful_uploads_are_deleted() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("nested/deeper"))?;
        fs::write(dir.path().join("nested/deeper/a.txt"), b"a")?;
        fs::write(dir.path().join("b.txt"), b"b")?;
        fs::write(dir.path().join("c.txt"), b"c")?;
        let mut config = config(dir.path());
        config.delete_after_upload = true;
        config.key_prefix = "daily".into();
        let store = store_for(&config);
        let logger = Arc::new(RecordingLogger::default());
        store.script(
            "daily/c.txt",
            [ScriptedPut::Fail(StoreError::Permanent("403".into()))],
        );

        let result = run(config, &store, &logger).await;

        assert_eq!(result.successful_uploads, 2);
        assert_eq!(result.deleted_files, 2);
        assert_eq!(result.removed_directories, 2);
        assert!(!dir.path().join("b.txt").exists());
        assert!(!dir.path().join("nested").exists());
        assert!(dir.path().join("c.txt").exists());
        assert!(dir.path().exists());
        assert!(store.get("bucket", "daily/nested/deeper/a.txt").is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_deletion_disabled_keeps_files() -> anyhow::Result<()> {
        let dir = source_with(3)?;
        let config = config(dir.path());
        let store = store_for(&config);
        let logger = Arc::new(RecordingLogger::default());

        let result = run(config, &store, &logger).await;

        assert_eq!(result.successful_uploads, 3);
        assert_eq!(result.deleted_files, 0);
        assert_eq!(fs::read_dir(dir.path())?.count(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_rerun_over_unchanged_source_is_idempotent() -> anyhow::Result<()> {
        let dir = source_with(4)?;
        let config = config(dir.path());
        let store = store_for(&config);
        let logger = Arc::new(RecordingLogger::default());

        let first = run(config.clone(), &store, &logger).await;
        let second = run(config, &store, &logger).await;

        let keys = |r: &PipelineResult| -> BTreeSet<String> {
            r.uploaded_files.iter().map(|(_, key)| key.clone()).collect()
        };
        assert_eq!(keys(&first), keys(&second));
        assert_eq!(second.classification, RunClassification::FullSuccess);
        assert_eq!(store.object_count(), 4);
        Ok(())
    }

    /// Passes calls through and cancels the run once `after` puts have been made.
    struct CancelAfterPuts {
        inner: Arc<MemoryStore>,
        cancel: CancellationToken,
        after: usize,
    }

    #[async_trait::async_trait]
    impl ObjectStoreClient for CancelAfterPuts {
        async fn put_object(
            &self,
            bucket: &str,
            key: &str,
            local_path: &Path,
        ) -> Result<String, StoreError> {
            let result = self.inner.put_object(bucket, key, local_path).await;
            if self.inner.put_calls() >= self.after {
                self.cancel.cancel();
            }
            result
        }

        async fn head_object(
            &self,
            bucket: &str,
            key: &str,
        ) -> Result<Option<crate::backup::store::ObjectHead>, StoreError> {
            self.inner.head_object(bucket, key).await
        }
    }

    #[tokio::test]
    async fn test_cancel_while_uploading_leaves_rest_not_attempted() -> anyhow::Result<()> {
        let dir = source_with(5)?;
        let mut config = config(dir.path());
        config.upload_workers = 1;
        let store = store_for(&config);
        let logger = Arc::new(RecordingLogger::default());
        let cancel = CancellationToken::new();
        let wrapped = Arc::new(CancelAfterPuts {
            inner: store.clone(),
            cancel: cancel.clone(),
            after: 2,
        });

        let result = BackupOrchestrator::new(config, wrapped, logger.clone())
            .with_cancellation(cancel)
            .run()
            .await;

        assert_eq!(result.classification, RunClassification::Interrupted);
        assert_eq!(result.successful_uploads, 2);
        assert_eq!(result.not_attempted, 3);
        assert_eq!(store.put_calls(), 2);
        assert!(result.is_consistent());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_before_deletion_phase_is_interrupted() -> anyhow::Result<()> {
        let dir = source_with(4)?;
        let mut config = config(dir.path());
        config.delete_after_upload = true;
        let store = store_for(&config);
        let logger = Arc::new(RecordingLogger::default());
        let cancel = CancellationToken::new();
        let wrapped = Arc::new(CancelAfterPuts {
            inner: store.clone(),
            cancel: cancel.clone(),
            after: 4,
        });

        let result = BackupOrchestrator::new(config, wrapped, logger.clone())
            .with_cancellation(cancel)
            .run()
            .await;

        assert_eq!(result.successful_uploads, 4);
        assert_eq!(result.not_attempted, 0);
        assert_eq!(result.deleted_files, 0);
        assert_eq!(result.deletions_not_attempted, 4);
        assert!(result.interrupted);
        assert_eq!(result.classification, RunClassification::Interrupted);
        assert_eq!(fs::read_dir(dir.path())?.count(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_state_changes_go_through_logger() -> anyhow::Result<()> {
        let dir = source_with(1)?;
        let config = config(dir.path());
        let store = store_for(&config);
        let logger = Arc::new(RecordingLogger::default());

        BackupOrchestrator::new(config, store.clone(), logger.clone())
            .run()
            .await;

        let states: Vec<String> = logger
            .events()
            .into_iter()
            .filter(|e| e.phase == Phase::Run && e.outcome == EventOutcome::Info)
            .filter_map(|e| e.detail)
            .collect();
        assert_eq!(
            states,
            vec![
                "state Initialized -> Enumerating",
                "state Enumerating -> Uploading",
                "state Uploading -> Deleting",
                "state Deleting -> Finalized",
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch_is_interrupted() -> anyhow::Result<()> {
        let dir = source_with(6)?;
        let mut config = config(dir.path());
        config.delete_after_upload = true;
        let store = store_for(&config);
        let logger = Arc::new(RecordingLogger::default());

        let orchestrator = BackupOrchestrator::new(config, store.clone(), logger.clone());
        orchestrator.cancellation_token().cancel();
        let result = orchestrator.run().await;

        assert_eq!(result.classification, RunClassification::Interrupted);
        assert!(result.interrupted);
        assert_eq!(result.not_attempted, 6);
        assert_eq!(store.put_calls(), 0);
        assert_eq!(fs::read_dir(dir.path())?.count(), 6);
        assert!(result.is_consistent());
        Ok(())
    }

    #[tokio::test]
    async fn test_manifest_lists_successes_in_order() -> anyhow::Result<()> {
        let dir = source_with(4)?;
        let manifests = TempDir::new()?;
        let mut config = config(dir.path());
        config.manifest_dir = Some(manifests.path().to_path_buf());
        let store = store_for(&config);
        let logger = Arc::new(RecordingLogger::default());
        store.script(
            "f01.txt",
            [ScriptedPut::Fail(StoreError::Permanent("403".into()))],
        );

        let result = run(config, &store, &logger).await;

        let reference = result
            .manifest
            .ok_or_else(|| anyhow::anyhow!("manifest not written"))?;
        let keys: Vec<String> = fs::read_to_string(&reference)?
            .lines()
            .map(|line| -> anyhow::Result<String> {
                let value: serde_json::Value = serde_json::from_str(line)?;
                Ok(value["destination_key"].as_str().unwrap_or_default().to_string())
            })
            .collect::<anyhow::Result<_>>()?;
        assert_eq!(keys, vec!["f00.txt", "f02.txt", "f03.txt"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_no_manifest_when_nothing_succeeded() -> anyhow::Result<()> {
        let dir = source_with(1)?;
        let manifests = TempDir::new()?;
        let mut config = config(dir.path());
        config.manifest_dir = Some(manifests.path().join("out"));
        let store = store_for(&config);
        let logger = Arc::new(RecordingLogger::default());
        store.script(
            "f00.txt",
            [ScriptedPut::Fail(StoreError::Permanent("403".into()))],
        );

        let result = run(config, &store, &logger).await;

        assert_eq!(result.classification, RunClassification::TotalFailure);
        assert!(result.manifest.is_none());
        assert!(!manifests.path().join("out").exists());
        Ok(())
    }

    struct BrokenSink;

    impl ManifestSink for BrokenSink {
        fn write(
            &self,
            _run_id: uuid::Uuid,
            _run_started: chrono::DateTime<chrono::Utc>,
            _records: &[crate::backup::manifest::ManifestRecord],
        ) -> Result<String, crate::errors::ManifestWriteError> {
            Err(std::io::Error::other("disk full").into())
        }
    }

    #[tokio::test]
    async fn test_manifest_failure_does_not_change_verdict() -> anyhow::Result<()> {
        let dir = source_with(2)?;
        let config = config(dir.path());
        let store = store_for(&config);
        let logger = Arc::new(RecordingLogger::default());

        let result = BackupOrchestrator::new(config, store.clone(), logger.clone())
            .with_manifest_sink(Arc::new(BrokenSink))
            .run()
            .await;

        assert_eq!(result.classification, RunClassification::FullSuccess);
        assert!(result.manifest.is_none());
        assert_eq!(logger.count(Phase::Manifest, EventOutcome::Failed), 1);
        Ok(())
    }

    struct FixedDigest;

    impl DigestStrategy for FixedDigest {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn digest(&self, _path: &Path) -> Result<String, crate::errors::IntegrityError> {
            Ok("ffffffffffffffffffffffffffffffff".to_string())
        }
    }

    #[tokio::test]
    async fn test_unverifiable_uploads_are_failures_and_never_deleted() -> anyhow::Result<()> {
        let dir = source_with(2)?;
        let mut config = config(dir.path());
        config.delete_after_upload = true;
        let store = store_for(&config);
        let logger = Arc::new(RecordingLogger::default());

        let result = BackupOrchestrator::new(config, store.clone(), logger.clone())
            .with_integrity_checker(IntegrityChecker::new(Arc::new(FixedDigest)))
            .run()
            .await;

        assert_eq!(result.failed_uploads, 2);
        assert_eq!(result.classification, RunClassification::TotalFailure);
        // one upload plus one re-upload per file
        assert_eq!(store.put_calls(), 4);
        assert_eq!(result.deleted_files, 0);
        assert_eq!(fs::read_dir(dir.path())?.count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_summary_event_is_emitted_once() -> anyhow::Result<()> {
        let dir = source_with(2)?;
        let config = config(dir.path());
        let store = store_for(&config);
        let logger = Arc::new(RecordingLogger::default());

        let orchestrator = BackupOrchestrator::new(config, store.clone(), logger.clone());
        assert_eq!(orchestrator.state(), RunState::Initialized);
        orchestrator.run().await;

        assert_eq!(logger.count(Phase::Summary, EventOutcome::Info), 1);
        assert_eq!(logger.count(Phase::Run, EventOutcome::Started), 1);
        Ok(())
    }
}
