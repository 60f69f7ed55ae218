// objectbackup/src/backup/metrics.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

use crate::backup::deletion::{DeletionOutcome, DeletionStatus};
use crate::backup::manifest::ManifestRecord;
use crate::backup::upload::{UploadOutcome, UploadStatus};
use crate::errors::UploadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunClassification {
    FullSuccess,
    PartialSuccess,
    TotalFailure,
    NothingToDo,
    Interrupted,
}

impl RunClassification {
    pub fn as_str(self) -> &'static str {
        match self {
            RunClassification::FullSuccess => "full-success",
            RunClassification::PartialSuccess => "partial-success",
            RunClassification::TotalFailure => "total-failure",
            RunClassification::NothingToDo => "nothing-to-do",
            RunClassification::Interrupted => "interrupted",
        }
    }
}

/// Final, flat report of one run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub total_files: usize,
    pub successful_uploads: usize,
    pub failed_uploads: usize,
    pub skipped_dry_run: usize,
    /// Candidates never dispatched because the run was cancelled.
    pub not_attempted: usize,
    /// Successful uploads whose deletion was never dispatched because the
    /// run was cancelled.
    pub deletions_not_attempted: usize,
    pub deleted_files: usize,
    pub failed_deletions: usize,
    pub denied_deletions: usize,
    pub removed_directories: usize,
    pub uploaded_bytes: u64,
    pub success_rate_percent: f64,
    pub simulated: bool,
    pub interrupted: bool,
    pub classification: RunClassification,
    /// `(local path, error)` for every failed upload, in enumeration order.
    pub upload_errors: Vec<(String, String)>,
    pub deletion_errors: Vec<(String, String)>,
    /// `(local path, destination key)` for every successful upload.
    pub uploaded_files: Vec<(String, String)>,
    pub manifest: Option<String>,
    pub fatal_error: Option<String>,
}

impl PipelineResult {
    pub fn is_consistent(&self) -> bool {
        self.successful_uploads + self.failed_uploads + self.skipped_dry_run + self.not_attempted
            == self.total_files
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    total_files: usize,
    // keyed by enumeration index so reports keep the enumeration order
    uploads: BTreeMap<usize, UploadOutcome>,
    deleted: usize,
    retained: usize,
    denied: usize,
    removed_dirs: usize,
    deletions_not_attempted: usize,
    deletion_errors: Vec<(String, String)>,
}

/// Thread-safe accumulator of per-file outcomes.
#[derive(Debug)]
pub struct MetricsRecorder {
    run_id: Uuid,
    start_time: DateTime<Utc>,
    simulated: bool,
    state: Mutex<MetricsState>,
}

impl MetricsRecorder {
    pub fn new(simulated: bool) -> Self {
        MetricsRecorder {
            run_id: Uuid::new_v4(),
            start_time: Utc::now(),
            simulated,
            state: Mutex::new(MetricsState::default()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_total(&self, total_files: usize) {
        self.state().total_files = total_files;
    }

    pub fn record_upload(&self, index: usize, outcome: UploadOutcome) {
        self.state().uploads.insert(index, outcome);
    }

    pub fn record_deletions_not_attempted(&self, count: usize) {
        self.state().deletions_not_attempted += count;
    }

    pub fn record_deletion(&self, outcome: &DeletionOutcome) {
        let mut state = self.state();
        match outcome.status {
            DeletionStatus::Deleted => {
                state.deleted += 1;
                state.removed_dirs += outcome.removed_dirs;
            }
            DeletionStatus::Retained => {
                state.retained += 1;
                let message = outcome
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| outcome.reason.as_str().to_string());
                state
                    .deletion_errors
                    .push((outcome.entry.path.display().to_string(), message));
            }
            DeletionStatus::Denied => state.denied += 1,
        }
    }

    /// Successful uploads in enumeration order.
    pub fn successful_uploads(&self) -> Vec<UploadOutcome> {
        self.state()
            .uploads
            .values()
            .filter(|o| o.is_success())
            .cloned()
            .collect()
    }

    pub fn manifest_records(&self) -> Vec<ManifestRecord> {
        let now = Utc::now();
        self.successful_uploads()
            .into_iter()
            .map(|o| ManifestRecord {
                destination_key: o.entry.key,
                source_path: o.entry.path,
                digest: o.remote_digest.unwrap_or_default(),
                timestamp: now,
            })
            .collect()
    }

    /// Builds the report. `cancelled` only turns into `interrupted` if the
    /// cancellation actually left work undone.
    pub fn finalize(
        &self,
        cancelled: bool,
        manifest: Option<String>,
        fatal_error: Option<String>,
    ) -> PipelineResult {
        let state = self.state();
        let end_time = Utc::now();

        let mut successful_uploads = 0;
        let mut failed_uploads = 0;
        let mut skipped_dry_run = 0;
        let mut uploaded_bytes = 0;
        let mut cut_short = false;
        let mut upload_errors = Vec::new();
        let mut uploaded_files = Vec::new();

        for outcome in state.uploads.values() {
            let path = outcome.entry.path.display().to_string();
            match outcome.status {
                UploadStatus::Succeeded => {
                    successful_uploads += 1;
                    uploaded_bytes += outcome.entry.size;
                    uploaded_files.push((path, outcome.entry.key.clone()));
                }
                UploadStatus::Failed => {
                    failed_uploads += 1;
                    cut_short |= outcome.error == Some(UploadError::Interrupted);
                    let message = outcome
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown error".to_string());
                    upload_errors.push((path, message));
                }
                UploadStatus::SkippedDryRun => skipped_dry_run += 1,
            }
        }

        let total_files = state.total_files;
        let not_attempted = total_files.saturating_sub(state.uploads.len());
        let interrupted = fatal_error.is_none()
            && cancelled
            && (cut_short || not_attempted > 0 || state.deletions_not_attempted > 0);

        let counted_ok = if self.simulated {
            successful_uploads + skipped_dry_run
        } else {
            successful_uploads
        };
        let success_rate_percent = if total_files == 0 {
            0.0
        } else {
            (counted_ok as f64 * 100.0) / total_files as f64
        };

        let classification = if fatal_error.is_some() {
            RunClassification::TotalFailure
        } else if interrupted {
            RunClassification::Interrupted
        } else if total_files == 0 {
            RunClassification::NothingToDo
        } else if counted_ok == total_files {
            RunClassification::FullSuccess
        } else if counted_ok > 0 {
            RunClassification::PartialSuccess
        } else {
            RunClassification::TotalFailure
        };

        PipelineResult {
            run_id: self.run_id,
            start_time: self.start_time,
            end_time,
            duration_seconds: (end_time - self.start_time).num_milliseconds().max(0) as f64
                / 1000.0,
            total_files,
            successful_uploads,
            failed_uploads,
            skipped_dry_run,
            not_attempted,
            deletions_not_attempted: state.deletions_not_attempted,
            deleted_files: state.deleted,
            failed_deletions: state.retained,
            denied_deletions: state.denied,
            removed_directories: state.removed_dirs,
            uploaded_bytes,
            success_rate_percent,
            simulated: self.simulated,
            interrupted,
            classification,
            upload_errors,
            deletion_errors: state.deletion_errors.clone(),
            uploaded_files,
            manifest,
            fatal_error,
        }
    }
}
