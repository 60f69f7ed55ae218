// objectbackup/src/backup/manifest.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use uuid::Uuid;

use crate::errors::ManifestWriteError;

/// One uploaded file, as persisted in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub destination_key: String,
    pub source_path: PathBuf,
    pub digest: String,
    pub timestamp: DateTime<Utc>,
}

pub trait ManifestSink: Send + Sync {
    /// Persists `records` for run `run_id` started at `run_started`,
    /// returning a reference (path, URI) to what was written.
    fn write(
        &self,
        run_id: Uuid,
        run_started: DateTime<Utc>,
        records: &[ManifestRecord],
    ) -> Result<String, ManifestWriteError>;
}

/// Writes one JSON object per line to
/// `<dir>/backup_manifest_<YYYYmmdd_HHMMSS>_<run id>.jsonl`. An existing
/// file is never overwritten.
#[derive(Debug, Clone)]
pub struct JsonLinesManifest {
    dir: PathBuf,
}

impl JsonLinesManifest {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JsonLinesManifest { dir: dir.into() }
    }
}

impl ManifestSink for JsonLinesManifest {
    fn write(
        &self,
        run_id: Uuid,
        run_started: DateTime<Utc>,
        records: &[ManifestRecord],
    ) -> Result<String, ManifestWriteError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!(
            "backup_manifest_{}_{}.jsonl",
            run_started.format("%Y%m%d_%H%M%S"),
            run_id.simple()
        ));

        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        for record in records {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;

        Ok(path.display().to_string())
    }
}
