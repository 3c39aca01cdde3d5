use crate::error::{Result, SandboxError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::io::AsyncWriteExt;

/// Hidden directory, sibling to the file being snapshotted.
pub const BACKUP_DIR_NAME: &str = ".wpagent-backups";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

/// Per-file timestamped snapshots. Backups are write-once: a snapshot never
/// replaces an existing backup file.
#[derive(Debug, Default)]
pub struct BackupStore {
    last_micros: AtomicI64,
}

impl BackupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backup_dir_for(path: &Path) -> Result<PathBuf> {
        let parent = path.parent().ok_or_else(|| {
            SandboxError::validation(format!("{} has no parent directory", path.display()))
        })?;
        Ok(parent.join(BACKUP_DIR_NAME))
    }

    fn file_name(path: &Path) -> Result<String> {
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| SandboxError::validation(format!("{} is not a file", path.display())))
    }

    /// Strictly increasing microsecond stamp, even across snapshots taken in
    /// the same clock tick.
    fn next_micros(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let prev = self
            .last_micros
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(prev + 1)
    }

    /// Copies the current bytes of `path` into the backup directory.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn snapshot(&self, path: &Path) -> Result<BackupRecord> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            SandboxError::execution(format!("backup of {} failed: {e}", path.display()))
        })?;
        let dir = Self::backup_dir_for(path)?;
        let file_name = Self::file_name(path)?;
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            SandboxError::execution(format!("backup directory {} failed: {e}", dir.display()))
        })?;

        loop {
            let micros = self.next_micros();
            let backup_path = dir.join(format!("{file_name}.{micros}.bak"));
            let mut file = match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&backup_path)
                .await
            {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(SandboxError::execution(format!(
                        "backup file {} failed: {e}",
                        backup_path.display()
                    )));
                }
            };
            file.write_all(&bytes).await?;
            file.flush().await?;
            let record = BackupRecord {
                original_path: path.to_path_buf(),
                backup_path,
                timestamp: DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now),
            };
            tracing::info!(
                original = %record.original_path.display(),
                backup = %record.backup_path.display(),
                bytes = bytes.len(),
                "file snapshot created"
            );
            return Ok(record);
        }
    }

    /// All snapshots of `path`, newest first.
    pub async fn list(&self, path: &Path) -> Result<Vec<BackupRecord>> {
        let dir = Self::backup_dir_for(path)?;
        let prefix = format!("{}.", Self::file_name(path)?);
        let mut rd = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(micros) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".bak"))
                .and_then(|stamp| stamp.parse::<i64>().ok())
            else {
                continue;
            };
            let Some(timestamp) = DateTime::from_timestamp_micros(micros) else {
                continue;
            };
            out.push(BackupRecord {
                original_path: path.to_path_buf(),
                backup_path: entry.path(),
                timestamp,
            });
        }
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(out)
    }

    /// Looks up the record for `backup_path`, refusing anything that is not a
    /// snapshot of `path`. The check is lexical first so an arbitrary host
    /// path is never touched.
    pub async fn find(&self, path: &Path, backup_path: &str) -> Result<BackupRecord> {
        let dir = Self::backup_dir_for(path)?;
        let wanted = Path::new(backup_path);
        let confined = wanted.parent() == Some(dir.as_path())
            && wanted
                .components()
                .all(|c| !matches!(c, std::path::Component::ParentDir));
        if !confined {
            return Err(SandboxError::validation(format!(
                "{backup_path:?} is not a backup of {}",
                path.display()
            )));
        }
        self.list(path)
            .await?
            .into_iter()
            .find(|record| record.backup_path == wanted)
            .ok_or_else(|| {
                SandboxError::validation(format!(
                    "{backup_path:?} is not a backup of {}",
                    path.display()
                ))
            })
    }

    /// Copies backup bytes back over the original. The pre-restore state is
    /// not snapshotted.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn restore(&self, record: &BackupRecord) -> Result<()> {
        tokio::fs::copy(&record.backup_path, &record.original_path)
            .await
            .map_err(|e| {
                SandboxError::execution(format!(
                    "restore of {} failed: {e}",
                    record.original_path.display()
                ))
            })?;
        tracing::info!(
            original = %record.original_path.display(),
            backup = %record.backup_path.display(),
            "file restored from backup"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshots_are_listed_newest_first_and_never_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("style.css");
        let store = BackupStore::new();

        std::fs::write(&file, "v1").unwrap();
        let first = store.snapshot(&file).await.unwrap();
        std::fs::write(&file, "v2").unwrap();
        let second = store.snapshot(&file).await.unwrap();

        assert_ne!(first.backup_path, second.backup_path);
        assert!(second.timestamp > first.timestamp);

        let listed = store.list(&file).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].backup_path, second.backup_path);
        assert_eq!(std::fs::read_to_string(&listed[1].backup_path).unwrap(), "v1");
    }

    #[tokio::test]
    async fn list_ignores_backups_of_other_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackupStore::new();
        let css = tmp.path().join("style.css");
        let map = tmp.path().join("style.css.map");
        std::fs::write(&css, "a").unwrap();
        std::fs::write(&map, "b").unwrap();
        store.snapshot(&css).await.unwrap();
        store.snapshot(&map).await.unwrap();

        assert_eq!(store.list(&css).await.unwrap().len(), 1);
        assert_eq!(store.list(&map).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn restore_does_not_take_a_new_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("functions.php");
        let store = BackupStore::new();
        std::fs::write(&file, "<?php // original").unwrap();
        let record = store.snapshot(&file).await.unwrap();
        std::fs::write(&file, "<?php // broken").unwrap();

        store.restore(&record).await.unwrap();

        assert_eq!(std::fs::read_to_string(&file).unwrap(), "<?php // original");
        assert_eq!(store.list(&file).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn find_rejects_foreign_backup_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.php");
        let other = tmp.path().join("b.php");
        let store = BackupStore::new();
        std::fs::write(&file, "a").unwrap();
        std::fs::write(&other, "b").unwrap();
        let foreign = store.snapshot(&other).await.unwrap();

        let err = store
            .find(&file, &foreign.backup_path.to_string_lossy())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
    }

    #[tokio::test]
    async fn find_refuses_paths_outside_the_backup_dir_without_probing_them() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.php");
        let store = BackupStore::new();
        std::fs::write(&file, "a").unwrap();
        let record = store.snapshot(&file).await.unwrap();

        let existing = store.find(&file, "/etc/passwd").await.unwrap_err();
        let missing = store.find(&file, "/no/such/host/path").await.unwrap_err();
        assert!(matches!(existing, SandboxError::Validation(_)));
        assert_eq!(
            existing.message().replace("/etc/passwd", ""),
            missing.message().replace("/no/such/host/path", "")
        );

        let dir = BackupStore::backup_dir_for(&file).unwrap();
        let sneaky = format!(
            "{}/../{}/{}",
            dir.display(),
            BACKUP_DIR_NAME,
            record.backup_path.file_name().unwrap().to_string_lossy()
        );
        assert!(store.find(&file, &sneaky).await.is_err());

        let found = store
            .find(&file, &record.backup_path.to_string_lossy())
            .await
            .unwrap();
        assert_eq!(found, record);
    }

    #[tokio::test]
    async fn snapshot_of_missing_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackupStore::new();
        let err = store.snapshot(&tmp.path().join("nope.php")).await.unwrap_err();
        assert!(matches!(err, SandboxError::Execution(_)));
    }
}
