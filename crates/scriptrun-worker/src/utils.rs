//! Filesystem and time helpers used around a task run.

use std::io;
use std::path::Path;

use chrono::DateTime;
use tracing::debug;

use crate::config::WorkerConfig;

/// Create the work, log and artifact directories if they are missing.
pub async fn prepare_dirs(config: &WorkerConfig) -> io::Result<()> {
    for dir in [&config.work_dir, &config.log_dir, &config.artifact_dir] {
        tokio::fs::create_dir_all(dir).await?;
    }
    Ok(())
}

/// Empty the work and artifact directories, keeping the directories
/// themselves. Logs are left for whoever uploads them.
pub async fn cleanup(config: &WorkerConfig) -> io::Result<()> {
    for dir in [&config.work_dir, &config.artifact_dir] {
        empty_dir(dir).await?;
    }
    Ok(())
}

async fn empty_dir(dir: &Path) -> io::Result<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        debug!(path = %path.display(), "Removed");
    }
    Ok(())
}

/// Seconds since the epoch for a queue timestamp such as
/// `2016-04-16T03:46:24.958Z`. Sub-second precision is dropped.
pub fn datestring_to_timestamp(datestring: &str) -> Result<f64, chrono::ParseError> {
    let parsed = DateTime::parse_from_rfc3339(datestring)?;
    Ok(parsed.timestamp() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root: &Path) -> WorkerConfig {
        WorkerConfig {
            work_dir: root.join("work"),
            log_dir: root.join("logs"),
            artifact_dir: root.join("artifacts"),
            ..WorkerConfig::default()
        }
    }

    #[test]
    fn test_datestring_to_timestamp() {
        assert_eq!(
            datestring_to_timestamp("2016-04-16T03:46:24.958Z").unwrap(),
            1460778384.0
        );
        assert_eq!(
            datestring_to_timestamp("2016-04-16T05:46:24+02:00").unwrap(),
            1460778384.0
        );
        assert!(datestring_to_timestamp("yesterday").is_err());
    }

    #[tokio::test]
    async fn test_prepare_dirs_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        prepare_dirs(&config).await.unwrap();
        prepare_dirs(&config).await.unwrap();
        assert!(config.work_dir.is_dir());
        assert!(config.log_dir.is_dir());
        assert!(config.artifact_dir.is_dir());
    }

    #[tokio::test]
    async fn test_cleanup_empties_but_keeps_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        prepare_dirs(&config).await.unwrap();
        for path in [&config.work_dir, &config.artifact_dir, &config.log_dir] {
            std::fs::write(path.join("tempfile"), "x").unwrap();
        }
        std::fs::create_dir_all(config.artifact_dir.join("public/nested")).unwrap();
        std::fs::write(config.artifact_dir.join("public/nested/a.log"), "x").unwrap();

        cleanup(&config).await.unwrap();

        for path in [&config.work_dir, &config.artifact_dir] {
            assert!(path.is_dir());
            assert_eq!(std::fs::read_dir(path).unwrap().count(), 0);
        }
        assert!(config.log_dir.join("tempfile").exists());
    }

    #[tokio::test]
    async fn test_cleanup_tolerates_missing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        cleanup(&config(dir.path())).await.unwrap();
    }
}
