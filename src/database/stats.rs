//! Read-only statistics over the backup directory

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs as tokio_fs;
use tracing::warn;

use crate::database::Result;
use crate::database::storage::local_storage::list_backup_files;

/// Aggregate view of the stored backups
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackupStats {
    pub total_backups: usize,
    /// Combined size in bytes
    pub total_size: u64,
    pub oldest_backup: Option<DateTime<Utc>>,
    pub newest_backup: Option<DateTime<Utc>>,
}

/// Collect statistics for `backup_dir`; I/O problems yield empty stats
pub async fn get_stats(backup_dir: &Path) -> BackupStats {
    match collect(backup_dir).await {
        Ok(stats) => stats,
        Err(e) => {
            warn!("Failed to collect backup statistics for {}: {}", backup_dir.display(), e);
            BackupStats::default()
        }
    }
}

async fn collect(backup_dir: &Path) -> Result<BackupStats> {
    let mut stats = BackupStats::default();

    for path in list_backup_files(backup_dir).await? {
        let metadata = tokio_fs::metadata(&path).await?;
        let modified: DateTime<Utc> = metadata.modified()?.into();

        stats.total_backups += 1;
        stats.total_size += metadata.len();
        stats.oldest_backup = Some(stats.oldest_backup.map_or(modified, |t| t.min(modified)));
        stats.newest_backup = Some(stats.newest_backup.map_or(modified, |t| t.max(modified)));
    }

    Ok(stats)
}
