pub(crate) mod deletion; // Safety gate in front of local deletion
pub(crate) mod enumerate; // Source tree walk and include/exclude filters
pub(crate) mod integrity; // Digests and post-upload verification
mod logic; // Run orchestration
pub(crate) mod manifest; // Manifest records and sinks
pub(crate) mod metrics; // Outcome aggregation and the final report
pub(crate) mod s3_upload; // S3 implementation of the store interface
pub(crate) mod store; // Object store interface
pub(crate) mod upload; // Per-file upload with retry

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::utils::logger::TracingLogger;
pub use logic::BackupOrchestrator;
pub use metrics::{PipelineResult, RunClassification};
use s3_upload::S3Store;

/// Public entry point for the backup process: wires the S3 store and the
/// tracing logger into an orchestrator and runs it once.
pub async fn run_backup_flow(
    app_config: &AppConfig,
    dry_run: bool,
    cancel: CancellationToken,
) -> Result<PipelineResult> {
    let mut backup_config = app_config.backup.clone();
    backup_config.dry_run |= dry_run;

    let store = S3Store::connect(&app_config.storage, backup_config.multipart_threshold).await;
    let orchestrator =
        BackupOrchestrator::new(backup_config, Arc::new(store), Arc::new(TracingLogger))
            .with_cancellation(cancel);

    Ok(orchestrator.run().await)
}

/// Checks that the configured bucket is reachable with the configured credentials.
pub async fn check_status(app_config: &AppConfig) -> Result<()> {
    let store = S3Store::connect(&app_config.storage, app_config.backup.multipart_threshold).await;
    store
        .check_connection(&app_config.storage.bucket_name)
        .await
        .context("Object store connection check failed")
}

/// Process exit code for a finished run.
pub fn exit_code(classification: RunClassification) -> u8 {
    match classification {
        RunClassification::FullSuccess | RunClassification::NothingToDo => 0,
        RunClassification::PartialSuccess => 2,
        RunClassification::TotalFailure => 1,
        RunClassification::Interrupted => 130,
    }
}
