// objectbackup/src/backup/enumerate.rs
//! Builds the candidate file list for a run.
//!
//! The walk never follows symbolic links and never yields them as
//! candidates. Filters are case-insensitive globs; a pattern containing `/`
//! is matched against the path relative to the source root, any other
//! pattern against the file name alone.

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::errors::EnumerationError;
use crate::utils::{object_key, slash_path};

/// A file selected for backup. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Absolute local path.
    pub path: PathBuf,
    /// Path relative to the source root.
    pub relative_path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Destination key: prefix + relative path.
    pub key: String,
}

#[derive(Debug, Clone)]
struct FilePattern {
    regex: Regex,
    match_full_path: bool,
}

impl FilePattern {
    fn compile(pattern: &str) -> Result<Self, EnumerationError> {
        let mut glob = pattern.trim().replace('\\', "/");
        // ".txt" means "*.txt"
        if glob.starts_with('.') && !glob.contains(['*', '?', '[', '/']) {
            glob.insert(0, '*');
        }
        let regex = RegexBuilder::new(&glob_to_regex(&glob))
            .case_insensitive(true)
            .build()
            .map_err(|source| EnumerationError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
        Ok(FilePattern {
            regex,
            match_full_path: glob.contains('/'),
        })
    }

    fn matches(&self, file_name: &str, relative: &str) -> bool {
        if self.match_full_path {
            self.regex.is_match(relative)
        } else {
            self.regex.is_match(file_name)
        }
    }
}

/// Translates a glob into an anchored regex. `*` stays within one path
/// segment, `**` crosses segments, `?` is one character, `[...]` is a class.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    let chars: Vec<char> = glob.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    i += 1;
                    // "**/" also matches zero directories
                    if chars.get(i + 1) == Some(&'/') {
                        i += 1;
                        out.push_str("(?:.*/)?");
                    } else {
                        out.push_str(".*");
                    }
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '[' => {
                let close = chars[i + 1..].iter().position(|&c| c == ']');
                match close {
                    Some(offset) if offset > 0 => {
                        let body: String = chars[i + 1..i + 1 + offset].iter().collect();
                        let body = match body.strip_prefix('!') {
                            Some(rest) => format!("^{}", rest),
                            None => body,
                        };
                        out.push('[');
                        out.push_str(&body.replace('\\', "\\\\"));
                        out.push(']');
                        i += offset + 1;
                    }
                    _ => out.push_str("\\["),
                }
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push('$');
    out
}

/// Walks a source tree and applies include/exclude filters.
#[derive(Debug, Clone)]
pub struct FileEnumerator {
    include: Vec<FilePattern>,
    exclude: Vec<FilePattern>,
    key_prefix: String,
}

impl FileEnumerator {
    /// An empty include list means "everything".
    pub fn new(
        include_patterns: &[String],
        exclude_patterns: &[String],
        key_prefix: &str,
    ) -> Result<Self, EnumerationError> {
        let compile_all = |patterns: &[String]| -> Result<Vec<FilePattern>, EnumerationError> {
            patterns
                .iter()
                .filter(|p| !p.trim().is_empty())
                .map(|p| FilePattern::compile(p))
                .collect()
        };
        Ok(FileEnumerator {
            include: compile_all(include_patterns)?,
            exclude: compile_all(exclude_patterns)?,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn should_include(&self, file_name: &str, relative: &str) -> bool {
        let included = self.include.is_empty()
            || self.include.iter().any(|p| p.matches(file_name, relative));
        included && !self.exclude.iter().any(|p| p.matches(file_name, relative))
    }

    /// Returns the candidate files under `source_dir`, sorted by path.
    pub fn enumerate(&self, source_dir: &Path) -> Result<Vec<FileEntry>, EnumerationError> {
        if !source_dir.exists() {
            return Err(EnumerationError::SourceMissing(source_dir.to_path_buf()));
        }
        if !source_dir.is_dir() {
            return Err(EnumerationError::NotADirectory(source_dir.to_path_buf()));
        }
        let root = fs::canonicalize(source_dir).map_err(|source| EnumerationError::Unreadable {
            path: source_dir.to_path_buf(),
            source,
        })?;
        // Surface permission problems on the root itself before walking.
        fs::read_dir(&root).map_err(|source| EnumerationError::Unreadable {
            path: root.clone(),
            source,
        })?;

        let mut entries = Vec::new();
        for entry in WalkDir::new(&root).follow_links(false) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
                EnumerationError::Unreadable { path, source }
            })?;

            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path().to_path_buf();
            let relative_path = path.strip_prefix(&root).unwrap_or(&path).to_path_buf();
            let file_name = entry.file_name().to_string_lossy();
            if !self.should_include(&file_name, &slash_path(&relative_path)) {
                continue;
            }

            let metadata = entry.metadata().map_err(|e| {
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("metadata unavailable"));
                EnumerationError::Unreadable {
                    path: path.clone(),
                    source,
                }
            })?;

            entries.push(FileEntry {
                key: object_key(&self.key_prefix, &relative_path),
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                path,
                relative_path,
            });
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}
