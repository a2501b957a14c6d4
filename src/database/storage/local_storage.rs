//! Local filesystem implementation of the ReplicaStore trait
//!
//! Also hosts the directory listing helpers shared by the orchestrator,
//! restore drills and reporting.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs as tokio_fs;
use tracing::debug;

use crate::database::backup_naming::{file_name_of, is_full_backup_name};
use crate::database::{DatabaseError, Result};

use super::ReplicaStore;

/// Replicates backups into another local (or mounted) directory
pub struct LocalDirectoryReplica {
    /// Directory receiving the copies
    replica_dir: PathBuf,
}

impl LocalDirectoryReplica {
    pub fn new(replica_dir: PathBuf) -> Self {
        Self { replica_dir }
    }
}

#[async_trait]
impl ReplicaStore for LocalDirectoryReplica {
    async fn store_backup(&self, artifact: &Path) -> Result<PathBuf> {
        let file_name = artifact.file_name().ok_or_else(|| {
            DatabaseError::BackupNotFound(artifact.display().to_string())
        })?;

        // Ensure the replica directory exists
        tokio_fs::create_dir_all(&self.replica_dir).await?;

        let dest_path = self.replica_dir.join(file_name);
        tokio_fs::copy(artifact, &dest_path).await?;

        debug!("Replicated {} to {}", artifact.display(), dest_path.display());
        Ok(dest_path)
    }

    async fn list_backups(&self) -> Result<Vec<String>> {
        Ok(list_backup_files(&self.replica_dir)
            .await?
            .iter()
            .filter_map(|path| file_name_of(path).map(str::to_string))
            .collect())
    }

    fn location(&self) -> String {
        self.replica_dir.display().to_string()
    }
}

/// Full-backup files in `dir`, newest first by name
///
/// A missing directory yields an empty list.
pub async fn list_backup_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !tokio_fs::try_exists(dir).await? {
        return Ok(Vec::new());
    }

    let mut entries = tokio_fs::read_dir(dir).await?;
    let mut backups = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_backup = file_name_of(&path).is_some_and(is_full_backup_name);
        if is_backup && entry.file_type().await?.is_file() {
            backups.push(path);
        }
    }

    // Timestamped names sort in creation order
    backups.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
    Ok(backups)
}

/// Most recent full backup in `dir`
pub async fn latest_backup_file(dir: &Path) -> Result<Option<PathBuf>> {
    Ok(list_backup_files(dir).await?.into_iter().next())
}
