//! Helpers for collaborators that upload a task's artifacts.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};

/// Expiry for artifacts uploaded at `now`.
pub fn expiration_for(now: DateTime<Utc>, hours: u32) -> DateTime<Utc> {
    now + Duration::hours(i64::from(hours))
}

/// Content type for an artifact, by extension.
pub fn guess_content_type(path: impl AsRef<Path>) -> &'static str {
    let ext = path
        .as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match ext.as_deref() {
        Some("log" | "txt") => "text/plain",
        Some("tgz" | "tar") => "application/x-tar",
        Some("dmg") => "application/x-apple-diskimage",
        Some("json") => "application/json",
        Some("gz") => "application/gzip",
        Some("zip") => "application/zip",
        Some("html" | "htm") => "text/html",
        Some("xml") => "application/xml",
        _ => "application/octet-stream",
    }
}

/// Every file under `dir`, as paths relative to it, sorted.
pub fn collect_artifacts(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(dir) {
                found.push(relative.to_path_buf());
            }
        }
    }

    found.sort();
    Ok(found)
}
