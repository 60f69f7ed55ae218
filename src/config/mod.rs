// objectbackup/src/config/mod.rs
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_UPLOAD_WORKERS: usize = 4;
const DEFAULT_DELETION_WORKERS: usize = 2;
const DEFAULT_MULTIPART_THRESHOLD_MB: u64 = 8;
const DEFAULT_MANIFEST_DIR: &str = "manifests";
const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_LOG_LEVEL: &str = "info";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct JsonLoggingConfig {
    pub level: Option<String>,
    pub json: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawJsonConfig {
    pub source_directory: Option<PathBuf>,
    pub include_patterns: Option<Vec<String>>,
    pub exclude_patterns: Option<Vec<String>>,
    pub key_prefix: Option<String>,
    pub delete_after_upload: Option<bool>,
    pub dry_run: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub attempt_timeout_secs: Option<u64>,
    pub upload_workers: Option<usize>,
    pub deletion_workers: Option<usize>,
    pub multipart_threshold_mb: Option<u64>,
    pub manifest_dir: Option<PathBuf>,
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub logging: Option<JsonLoggingConfig>,
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
        }
    }
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket_name: String,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub source_dir: PathBuf,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub bucket: String,
    pub key_prefix: String,
    pub delete_after_upload: bool,
    pub dry_run: bool,
    pub retry: RetryPolicy,
    pub attempt_timeout: Duration,
    pub upload_workers: usize,
    pub deletion_workers: usize,
    /// Files above this size go through multipart upload, in parts of this size.
    pub multipart_threshold: u64,
    pub manifest_dir: Option<PathBuf>,
}

impl BackupConfig {
    /// Minimal config for a source directory and bucket; everything else defaulted.
    pub fn new(source_dir: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        BackupConfig {
            source_dir: source_dir.into(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            bucket: bucket.into(),
            key_prefix: String::new(),
            delete_after_upload: false,
            dry_run: false,
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(DEFAULT_ATTEMPT_TIMEOUT_SECS),
            upload_workers: DEFAULT_UPLOAD_WORKERS,
            deletion_workers: DEFAULT_DELETION_WORKERS,
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD_MB * 1024 * 1024,
            manifest_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backup: BackupConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let mut raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        apply_env_overrides(&mut raw_json_config, |name| std::env::var(name).ok());

        let storage = load_storage_config_from_json(&raw_json_config)
            .context("Failed to load s3_storage configuration from JSON")?;
        let backup = load_backup_config_from_json(&raw_json_config, &storage)
            .context("Failed to load backup configuration from JSON")?;
        let logging = load_logging_config_from_json(&raw_json_config);

        Ok(AppConfig {
            backup,
            storage,
            logging,
        })
    }
}

/// Environment variables win over config.json for credentials, region and bucket.
pub fn apply_env_overrides<F>(raw_config: &mut RawJsonConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let s3 = raw_config.s3_storage.get_or_insert_with(JsonS3StorageConfig::default);
    let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(value) = non_empty("AWS_ACCESS_KEY_ID") {
        s3.access_key_id = Some(value);
    }
    if let Some(value) = non_empty("AWS_SECRET_ACCESS_KEY") {
        s3.secret_access_key = Some(value);
    }
    if let Some(value) = non_empty("AWS_DEFAULT_REGION") {
        s3.region = Some(value);
    }
    if let Some(value) = non_empty("S3_BUCKET_NAME") {
        s3.bucket_name = Some(value);
    }
}

pub fn load_storage_config_from_json(raw_config: &RawJsonConfig) -> Result<StorageConfig> {
    let s3_raw = raw_config
        .s3_storage
        .as_ref()
        .context("s3_storage must be set in config.json")?;

    let bucket_name = s3_raw
        .bucket_name
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .context("s3_storage.bucket_name must be set and non-empty in config.json")?;

    let trimmed = |value: &Option<String>| {
        value
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let access_key_id = trimmed(&s3_raw.access_key_id);
    let secret_access_key = trimmed(&s3_raw.secret_access_key);
    if access_key_id.is_some() != secret_access_key.is_some() {
        return Err(anyhow::anyhow!(
            "s3_storage must set both access_key_id and secret_access_key, or neither to use the default credential chain."
        ));
    }

    Ok(StorageConfig {
        bucket_name,
        region: trimmed(&s3_raw.region).unwrap_or_else(|| DEFAULT_REGION.to_string()),
        access_key_id,
        secret_access_key,
        endpoint_url: trimmed(&s3_raw.endpoint_url),
    })
}

pub fn load_backup_config_from_json(
    raw_config: &RawJsonConfig,
    storage: &StorageConfig,
) -> Result<BackupConfig> {
    let source_directory = raw_config
        .source_directory
        .as_ref()
        .context("source_directory must be set in config.json for backup")?;

    if source_directory.to_string_lossy().trim().is_empty() {
        return Err(anyhow::anyhow!(
            "source_directory cannot be empty in config.json."
        ));
    }
    if !source_directory.exists() {
        return Err(anyhow::anyhow!(
            "source_directory does not exist: {}",
            source_directory.display()
        ));
    }
    if !source_directory.is_dir() {
        return Err(anyhow::anyhow!(
            "source_directory is not a directory: {}",
            source_directory.display()
        ));
    }
    let source_dir = fs::canonicalize(source_directory).with_context(|| {
        format!(
            "Failed to resolve source_directory {}",
            source_directory.display()
        )
    })?;

    let upload_workers = raw_config.upload_workers.unwrap_or(DEFAULT_UPLOAD_WORKERS);
    let deletion_workers = raw_config
        .deletion_workers
        .unwrap_or(DEFAULT_DELETION_WORKERS);
    if upload_workers == 0 || deletion_workers == 0 {
        return Err(anyhow::anyhow!(
            "upload_workers and deletion_workers must be at least 1 in config.json."
        ));
    }

    let multipart_threshold_mb = raw_config
        .multipart_threshold_mb
        .unwrap_or(DEFAULT_MULTIPART_THRESHOLD_MB);
    // S3 rejects multipart parts under 5 MiB (except the last one).
    if multipart_threshold_mb < 5 {
        return Err(anyhow::anyhow!(
            "multipart_threshold_mb must be at least 5 in config.json."
        ));
    }

    let retry = RetryPolicy {
        max_retries: raw_config.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        base_delay: Duration::from_millis(
            raw_config
                .retry_base_delay_ms
                .unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS),
        ),
        max_delay: Duration::from_millis(
            raw_config
                .retry_max_delay_ms
                .unwrap_or(DEFAULT_RETRY_MAX_DELAY_MS),
        ),
    };

    Ok(BackupConfig {
        source_dir,
        include_patterns: normalize_include_patterns(raw_config.include_patterns.as_deref()),
        exclude_patterns: clean_patterns(raw_config.exclude_patterns.as_deref()),
        bucket: storage.bucket_name.clone(),
        key_prefix: raw_config.key_prefix.clone().unwrap_or_default(),
        delete_after_upload: raw_config.delete_after_upload.unwrap_or(false),
        dry_run: raw_config.dry_run.unwrap_or(false),
        retry,
        attempt_timeout: Duration::from_secs(
            raw_config
                .attempt_timeout_secs
                .unwrap_or(DEFAULT_ATTEMPT_TIMEOUT_SECS)
                .max(1),
        ),
        upload_workers,
        deletion_workers,
        multipart_threshold: multipart_threshold_mb * 1024 * 1024,
        manifest_dir: Some(
            raw_config
                .manifest_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MANIFEST_DIR)),
        ),
    })
}

pub fn load_logging_config_from_json(raw_config: &RawJsonConfig) -> LoggingConfig {
    let logging = raw_config.logging.clone().unwrap_or_default();
    LoggingConfig {
        level: logging
            .level
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.trim().to_lowercase())
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        json: logging.json.unwrap_or(false),
    }
}

/// Trims patterns and drops blank ones.
fn clean_patterns(patterns: Option<&[String]>) -> Vec<String> {
    patterns
        .unwrap_or_default()
        .iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Like [`clean_patterns`], but an include list of only `*` collapses to
/// "match everything" (empty list). Excludes never collapse.
fn normalize_include_patterns(patterns: Option<&[String]>) -> Vec<String> {
    let cleaned = clean_patterns(patterns);
    if cleaned.iter().all(|p| p == "*") {
        return Vec::new();
    }
    cleaned
}

/// Writes a sample config.json to `output_path`.
pub fn create_sample_config(output_path: &Path) -> Result<()> {
    let sample = RawJsonConfig {
        source_directory: Some(PathBuf::from("/path/to/backup")),
        include_patterns: Some(vec!["*.txt".into(), "*.pdf".into(), "*.docx".into()]),
        exclude_patterns: Some(vec!["*.tmp".into()]),
        key_prefix: Some("backups/".into()),
        delete_after_upload: Some(false),
        dry_run: Some(false),
        max_retries: Some(DEFAULT_MAX_RETRIES),
        retry_base_delay_ms: Some(DEFAULT_RETRY_BASE_DELAY_MS),
        retry_max_delay_ms: Some(DEFAULT_RETRY_MAX_DELAY_MS),
        attempt_timeout_secs: Some(DEFAULT_ATTEMPT_TIMEOUT_SECS),
        upload_workers: Some(DEFAULT_UPLOAD_WORKERS),
        deletion_workers: Some(DEFAULT_DELETION_WORKERS),
        multipart_threshold_mb: Some(DEFAULT_MULTIPART_THRESHOLD_MB),
        manifest_dir: Some(PathBuf::from(DEFAULT_MANIFEST_DIR)),
        s3_storage: Some(JsonS3StorageConfig {
            bucket_name: Some("your-backup-bucket".into()),
            region: Some(DEFAULT_REGION.into()),
            access_key_id: Some("your_access_key_here".into()),
            secret_access_key: Some("your_secret_key_here".into()),
            endpoint_url: None,
        }),
        logging: Some(JsonLoggingConfig {
            level: Some(DEFAULT_LOG_LEVEL.into()),
            json: Some(false),
        }),
    };

    let content = serde_json::to_string_pretty(&sample)
        .context("Failed to serialize sample configuration")?;
    fs::write(output_path, content).with_context(|| {
        format!(
            "Failed to write sample configuration to {}",
            output_path.display()
        )
    })?;
    Ok(())
}
