pub mod logger;

use std::path::{Component, Path};

/// Human-readable size, e.g. `1.5 KB`.
pub fn format_file_size(size_bytes: u64) -> String {
    let mut size = size_bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            return format!("{:.1} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.1} PB", size)
}

/// Joins a relative path with `/` regardless of platform.
pub fn slash_path(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Destination key: prefix (slashes trimmed) + `/` + relative path.
pub fn object_key(prefix: &str, relative: &Path) -> String {
    let prefix = prefix.trim_matches('/');
    let relative = slash_path(relative);
    if prefix.is_empty() {
        relative
    } else {
        format!("{}/{}", prefix, relative)
    }
}
