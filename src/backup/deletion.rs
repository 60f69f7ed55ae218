// objectbackup/src/backup/deletion.rs
//! Safety gate in front of local deletion.
//!
//! Every precondition is re-checked at deletion time, since the tree may
//! have changed since enumeration: the upload must have succeeded, deletion
//! must be enabled outside dry-run, and the resolved path must still be a
//! regular file inside the source root with the size and mtime seen at
//! enumeration.

use chrono::{DateTime, Utc};
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};

use crate::backup::enumerate::FileEntry;
use crate::backup::upload::{UploadOutcome, UploadStatus};
use crate::config::BackupConfig;
use crate::errors::DeletionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionStatus {
    Deleted,
    Retained,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionReason {
    Removed,
    UploadNotSucceeded,
    DeletionDisabled,
    DryRun,
    OutsideSourceTree,
    NotARegularFile,
    ChangedSinceUpload,
    FilesystemError,
}

impl DeletionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeletionReason::Removed => "removed",
            DeletionReason::UploadNotSucceeded => "upload-not-succeeded",
            DeletionReason::DeletionDisabled => "deletion-disabled",
            DeletionReason::DryRun => "dry-run",
            DeletionReason::OutsideSourceTree => "outside-source-tree",
            DeletionReason::NotARegularFile => "not-a-regular-file",
            DeletionReason::ChangedSinceUpload => "changed-since-upload",
            DeletionReason::FilesystemError => "filesystem-error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeletionOutcome {
    pub entry: FileEntry,
    pub status: DeletionStatus,
    pub reason: DeletionReason,
    pub error: Option<DeletionError>,
    /// Empty ancestor directories removed after the file.
    pub removed_dirs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionDecision {
    Permitted { resolved: PathBuf, root: PathBuf },
    Denied(DeletionReason),
    /// The path could not be inspected; the file stays.
    Unresolvable(DeletionError),
}

#[derive(Debug, Clone)]
pub struct DeletionGuard {
    source_dir: PathBuf,
    delete_after_upload: bool,
    dry_run: bool,
}

impl DeletionGuard {
    pub fn new(source_dir: impl Into<PathBuf>, delete_after_upload: bool, dry_run: bool) -> Self {
        DeletionGuard {
            source_dir: source_dir.into(),
            delete_after_upload,
            dry_run,
        }
    }

    pub fn from_config(config: &BackupConfig) -> Self {
        Self::new(
            config.source_dir.clone(),
            config.delete_after_upload,
            config.dry_run,
        )
    }

    pub fn may_delete(&self, entry: &FileEntry, upload: &UploadOutcome) -> DeletionDecision {
        if upload.status != UploadStatus::Succeeded {
            return DeletionDecision::Denied(DeletionReason::UploadNotSucceeded);
        }
        if !self.delete_after_upload {
            return DeletionDecision::Denied(DeletionReason::DeletionDisabled);
        }
        if self.dry_run {
            return DeletionDecision::Denied(DeletionReason::DryRun);
        }

        let root = match fs::canonicalize(&self.source_dir) {
            Ok(root) => root,
            Err(e) => return unresolvable(&self.source_dir, e),
        };

        let meta = match fs::symlink_metadata(&entry.path) {
            Ok(meta) if meta.file_type().is_symlink() || !meta.is_file() => {
                return DeletionDecision::Denied(DeletionReason::NotARegularFile);
            }
            Ok(meta) => meta,
            Err(e) => return unresolvable(&entry.path, e),
        };

        let resolved = match fs::canonicalize(&entry.path) {
            Ok(resolved) => resolved,
            Err(e) => return unresolvable(&entry.path, e),
        };
        if resolved == root || !resolved.starts_with(&root) {
            return DeletionDecision::Denied(DeletionReason::OutsideSourceTree);
        }
        if changed_since_enumeration(entry, &meta) {
            return DeletionDecision::Denied(DeletionReason::ChangedSinceUpload);
        }

        DeletionDecision::Permitted { resolved, root }
    }

    /// Applies [`may_delete`](Self::may_delete): removes the file when
    /// permitted, then collapses empty parents up to the source root.
    pub fn delete(&self, entry: &FileEntry, upload: &UploadOutcome) -> DeletionOutcome {
        let outcome = |status, reason, error, removed_dirs| DeletionOutcome {
            entry: entry.clone(),
            status,
            reason,
            error,
            removed_dirs,
        };

        match self.may_delete(entry, upload) {
            DeletionDecision::Denied(reason) => outcome(DeletionStatus::Denied, reason, None, 0),
            DeletionDecision::Unresolvable(err) => outcome(
                DeletionStatus::Retained,
                DeletionReason::FilesystemError,
                Some(err),
                0,
            ),
            DeletionDecision::Permitted { resolved, root } => match fs::remove_file(&resolved) {
                Ok(()) => {
                    let removed = collapse_empty_parents(&resolved, &root);
                    outcome(DeletionStatus::Deleted, DeletionReason::Removed, None, removed)
                }
                Err(e) => outcome(
                    DeletionStatus::Retained,
                    DeletionReason::FilesystemError,
                    Some(DeletionError::Remove {
                        path: resolved,
                        message: e.to_string(),
                    }),
                    0,
                ),
            },
        }
    }
}

/// Size or mtime differs from what enumeration recorded.
fn changed_since_enumeration(entry: &FileEntry, meta: &Metadata) -> bool {
    if meta.len() != entry.size {
        return true;
    }
    match entry.modified {
        Some(seen) => meta.modified().ok().map(DateTime::<Utc>::from) != Some(seen),
        None => false,
    }
}

fn unresolvable(path: &Path, e: std::io::Error) -> DeletionDecision {
    DeletionDecision::Unresolvable(DeletionError::Resolve {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Removes now-empty directories from `file`'s parent upwards, stopping at
/// (and never removing) `root`. A non-empty directory ends the walk.
fn collapse_empty_parents(file: &Path, root: &Path) -> usize {
    let mut removed = 0;
    let mut current = file.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if fs::remove_dir(dir).is_err() {
            break;
        }
        removed += 1;
        current = dir.parent();
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::enumerate::FileEnumerator;
    use crate::errors::UploadError;
    use tempfile::TempDir;

    fn entries(root: &Path) -> anyhow::Result<Vec<FileEntry>> {
        Ok(FileEnumerator::new(&[], &[], "")?.enumerate(root)?)
    }

    fn succeeded(entry: &FileEntry) -> UploadOutcome {
        UploadOutcome {
            entry: entry.clone(),
            status: UploadStatus::Succeeded,
            attempts: 1,
            error: None,
            remote_digest: Some("d".into()),
        }
    }

    #[test]
    fn test_deletes_file_after_successful_upload() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("a.txt"), b"x")?;
        let entry = entries(dir.path())?.remove(0);

        let guard = DeletionGuard::new(dir.path(), true, false);
        let outcome = guard.delete(&entry, &succeeded(&entry));

        assert_eq!(outcome.status, DeletionStatus::Deleted);
        assert_eq!(outcome.reason, DeletionReason::Removed);
        assert!(!entry.path.exists());
        assert!(dir.path().exists());
        Ok(())
    }

    #[test]
    fn test_denied_unless_upload_succeeded() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("a.txt"), b"x")?;
        let entry = entries(dir.path())?.remove(0);
        let guard = DeletionGuard::new(dir.path(), true, false);

        let failed = UploadOutcome::failed(&entry, 3, UploadError::Timeout(Default::default()));
        let mut skipped = succeeded(&entry);
        skipped.status = UploadStatus::SkippedDryRun;

        for upload in [failed, skipped] {
            let outcome = guard.delete(&entry, &upload);
            assert_eq!(outcome.status, DeletionStatus::Denied);
            assert_eq!(outcome.reason, DeletionReason::UploadNotSucceeded);
        }
        assert!(entry.path.exists());
        Ok(())
    }

    #[test]
    fn test_denied_when_disabled_or_dry_run() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("a.txt"), b"x")?;
        let entry = entries(dir.path())?.remove(0);
        let upload = succeeded(&entry);

        let disabled = DeletionGuard::new(dir.path(), false, false);
        assert_eq!(
            disabled.may_delete(&entry, &upload),
            DeletionDecision::Denied(DeletionReason::DeletionDisabled)
        );
        let dry = DeletionGuard::new(dir.path(), true, true);
        assert_eq!(
            dry.may_delete(&entry, &upload),
            DeletionDecision::Denied(DeletionReason::DryRun)
        );
        assert!(entry.path.exists());
        Ok(())
    }

    #[test]
    fn test_already_gone_is_retained_not_fatal() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("a.txt"), b"x")?;
        let entry = entries(dir.path())?.remove(0);
        fs::remove_file(&entry.path)?;

        let outcome = DeletionGuard::new(dir.path(), true, false).delete(&entry, &succeeded(&entry));
        assert_eq!(outcome.status, DeletionStatus::Retained);
        assert!(matches!(outcome.error, Some(DeletionError::Resolve { .. })));
        Ok(())
    }

    #[test]
    fn test_path_outside_source_is_denied() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let other = TempDir::new()?;
        fs::write(other.path().join("stray.txt"), b"x")?;
        let mut entry = entries(other.path())?.remove(0);
        entry.relative_path = PathBuf::from("stray.txt");

        let outcome = DeletionGuard::new(dir.path(), true, false).delete(&entry, &succeeded(&entry));
        assert_eq!(outcome.status, DeletionStatus::Denied);
        assert_eq!(outcome.reason, DeletionReason::OutsideSourceTree);
        assert!(entry.path.exists());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_swapped_in_after_enumeration_is_denied() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let outside = TempDir::new()?;
        fs::create_dir_all(dir.path().join("sub"))?;
        fs::write(dir.path().join("sub/a.txt"), b"x")?;
        fs::write(dir.path().join("b.txt"), b"x")?;
        fs::write(outside.path().join("a.txt"), b"precious")?;
        fs::write(outside.path().join("target.txt"), b"precious")?;
        let found = entries(dir.path())?;
        let guard = DeletionGuard::new(dir.path(), true, false);

        // file replaced by a link
        let b = found.iter().find(|e| e.path.ends_with("b.txt")).cloned();
        let b = b.ok_or_else(|| anyhow::anyhow!("b.txt not enumerated"))?;
        fs::remove_file(&b.path)?;
        std::os::unix::fs::symlink(outside.path().join("target.txt"), &b.path)?;
        let outcome = guard.delete(&b, &succeeded(&b));
        assert_eq!(outcome.status, DeletionStatus::Denied);
        assert_eq!(outcome.reason, DeletionReason::NotARegularFile);

        // parent directory replaced by a link out of the tree
        let a = found.iter().find(|e| e.path.ends_with("a.txt")).cloned();
        let a = a.ok_or_else(|| anyhow::anyhow!("a.txt not enumerated"))?;
        fs::remove_dir_all(dir.path().join("sub"))?;
        std::os::unix::fs::symlink(outside.path(), dir.path().join("sub"))?;
        let outcome = guard.delete(&a, &succeeded(&a));
        assert_eq!(outcome.status, DeletionStatus::Denied);
        assert_eq!(outcome.reason, DeletionReason::OutsideSourceTree);

        assert!(outside.path().join("a.txt").exists());
        assert!(outside.path().join("target.txt").exists());
        Ok(())
    }

    #[test]
    fn test_file_changed_after_enumeration_is_kept() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("grow.log"), b"first")?;
        fs::write(dir.path().join("touch.log"), b"same")?;
        let found = entries(dir.path())?;
        let guard = DeletionGuard::new(dir.path(), true, false);

        let grown = found.iter().find(|e| e.path.ends_with("grow.log")).cloned();
        let grown = grown.ok_or_else(|| anyhow::anyhow!("grow.log not enumerated"))?;
        let mut file = fs::OpenOptions::new().append(true).open(&grown.path)?;
        std::io::Write::write_all(&mut file, b" and more")?;
        drop(file);

        let outcome = guard.delete(&grown, &succeeded(&grown));
        assert_eq!(outcome.status, DeletionStatus::Denied);
        assert_eq!(outcome.reason, DeletionReason::ChangedSinceUpload);
        assert!(grown.path.exists());

        // same size, different mtime
        let mut touched = found
            .iter()
            .find(|e| e.path.ends_with("touch.log"))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("touch.log not enumerated"))?;
        let seen = touched.modified.ok_or_else(|| anyhow::anyhow!("no mtime"))?;
        touched.modified = Some(seen - chrono::Duration::seconds(60));

        assert_eq!(
            guard.may_delete(&touched, &succeeded(&touched)),
            DeletionDecision::Denied(DeletionReason::ChangedSinceUpload)
        );
        assert!(touched.path.exists());
        Ok(())
    }

    #[test]
    fn test_empty_parents_collapse_up_to_root() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("a/b/c"))?;
        fs::create_dir_all(dir.path().join("a/keep"))?;
        fs::write(dir.path().join("a/b/c/file.txt"), b"x")?;
        fs::write(dir.path().join("a/keep/other.txt"), b"x")?;
        let found = entries(dir.path())?;
        let entry = found
            .iter()
            .find(|e| e.path.ends_with("file.txt"))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("file.txt not enumerated"))?;

        let outcome = DeletionGuard::new(dir.path(), true, false).delete(&entry, &succeeded(&entry));

        assert_eq!(outcome.status, DeletionStatus::Deleted);
        assert_eq!(outcome.removed_dirs, 2);
        assert!(!dir.path().join("a/b").exists());
        assert!(dir.path().join("a/keep/other.txt").exists());
        Ok(())
    }

    #[test]
    fn test_source_root_is_never_removed() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("only.txt"), b"x")?;
        let entry = entries(dir.path())?.remove(0);

        let outcome = DeletionGuard::new(dir.path(), true, false).delete(&entry, &succeeded(&entry));
        assert_eq!(outcome.removed_dirs, 0);
        assert!(dir.path().is_dir());
        Ok(())
    }
}
